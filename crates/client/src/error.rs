//! Error taxonomy of the offline client.
//!
//! Only [`QueueError`] and [`StoreError`] reach callers synchronously, and
//! only for local problems (bad input, storage down). Delivery failures are
//! [`TransportError`]s, classified into terminal or transient and surfaced
//! through the sync event channel.

use stowage_core::DomainError;
use thiserror::Error;

use crate::idempotency::IdempotencyKey;
use crate::types::{FailureKind, MutationStatus};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    Duplicate(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("dependency {0} is not an earlier mutation in this queue")]
    UnknownDependency(IdempotencyKey),
    #[error("idempotency key {0} is already queued")]
    DuplicateKey(IdempotencyKey),
    #[error("no queued mutation with key {0}")]
    NotFound(IdempotencyKey),
    #[error("mutation {key} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        key: IdempotencyKey,
        from: MutationStatus,
        to: MutationStatus,
    },
    #[error("mutation {key} failed with {failure:?} and cannot be retried")]
    NotRetryable {
        key: IdempotencyKey,
        failure: FailureKind,
    },
    #[error("mutation {0} is still outstanding and cannot be discarded")]
    NotDiscardable(IdempotencyKey),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome class of a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Never retried automatically.
    Terminal(FailureKind),
    /// Retried with backoff, within the retry bound.
    Transient,
    /// The credential was refused. The entry waits for a new session and
    /// the attempt does not count against the retry bound.
    Unauthorized,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rejected by backend: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("credential rejected")]
    Unauthorized,
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
}

impl TransportError {
    /// A timeout is always transient: the backend may already have applied
    /// the request, and redelivery under the same key is safe.
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::Validation(_) => FailureClass::Terminal(FailureKind::Validation),
            TransportError::Conflict(_) => FailureClass::Terminal(FailureKind::Conflict),
            TransportError::Unauthorized => FailureClass::Unauthorized,
            TransportError::Timeout | TransportError::Network(_) | TransportError::Server { .. } => {
                FailureClass::Transient
            }
        }
    }

    /// Map a non-success HTTP status to a transport error.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            400 | 403 | 422 => TransportError::Validation(message),
            404 | 409 | 410 => TransportError::Conflict(message),
            401 => TransportError::Unauthorized,
            408 => TransportError::Timeout,
            _ => TransportError::Server { status, message },
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("dependency cycle among {} mutations", keys.len())]
    Cycle { keys: Vec<IdempotencyKey> },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The credential cannot be refreshed; the user must sign in again.
    #[error("session is no longer valid")]
    Invalid,
    #[error("session check failed: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("feed transport error: {0}")]
    Transport(String),
    #[error("feed rejected the credential")]
    Unauthorized,
    #[error("undecodable feed message: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_classify() {
        let class = |s| TransportError::from_status(s, String::new()).class();
        assert_eq!(class(422), FailureClass::Terminal(FailureKind::Validation));
        assert_eq!(class(409), FailureClass::Terminal(FailureKind::Conflict));
        assert_eq!(class(404), FailureClass::Terminal(FailureKind::Conflict));
        assert_eq!(class(408), FailureClass::Transient);
        assert_eq!(class(429), FailureClass::Transient);
        assert_eq!(class(503), FailureClass::Transient);
        assert_eq!(class(401), FailureClass::Unauthorized);
    }

    #[test]
    fn timeout_is_never_terminal() {
        assert_eq!(TransportError::Timeout.class(), FailureClass::Transient);
    }
}
