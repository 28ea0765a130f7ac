//! Queue entry types and client state enums.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_core::{DomainError, TenantId};

use crate::idempotency::IdempotencyKey;
use crate::payload::EntityPayload;

/// Kind of write a queued mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
        }
    }
}

impl FromStr for Operation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            other => Err(DomainError::validation(format!("unknown operation '{other}'"))),
        }
    }
}

/// Entity types the inventory backend accepts writes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Item,
    Location,
    Container,
    Category,
    Loan,
    Member,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Item,
        EntityKind::Location,
        EntityKind::Container,
        EntityKind::Category,
        EntityKind::Loan,
        EntityKind::Member,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Location => "location",
            EntityKind::Container => "container",
            EntityKind::Category => "category",
            EntityKind::Loan => "loan",
            EntityKind::Member => "member",
        }
    }

    /// REST collection segment (`/items`, `/categories`, ...).
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Item => "items",
            EntityKind::Location => "locations",
            EntityKind::Container => "containers",
            EntityKind::Category => "categories",
            EntityKind::Loan => "loans",
            EntityKind::Member => "members",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown entity type '{s}'")))
    }
}

/// Status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "Pending",
            MutationStatus::Syncing => "Syncing",
            MutationStatus::Synced => "Synced",
            MutationStatus::Failed => "Failed",
        }
    }

    /// Outstanding entries still have an effect to deliver.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, MutationStatus::Pending | MutationStatus::Syncing)
    }

    /// Allowed lifecycle edges. `Syncing -> Pending` is the transient-retry
    /// path; `Failed -> Pending` is an explicit caller retry. Planning may
    /// also fail a `Pending` entry that can never be sent, outside this table.
    pub fn can_transition_to(&self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Syncing, Synced)
                | (Syncing, Failed)
                | (Syncing, Pending)
                | (Failed, Pending)
        )
    }
}

impl FromStr for MutationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(MutationStatus::Pending),
            "Syncing" => Ok(MutationStatus::Syncing),
            "Synced" => Ok(MutationStatus::Synced),
            "Failed" => Ok(MutationStatus::Failed),
            other => Err(DomainError::validation(format!("invalid MutationStatus: {other}"))),
        }
    }
}

/// Why a mutation ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Backend rejected the payload.
    Validation,
    /// Backend state contradicts the mutation (e.g. target deleted).
    Conflict,
    /// Transient failures exceeded the retry bound.
    RetriesExhausted,
    /// Entry is part of a dependency cycle.
    Cycle,
    /// A mutation this one depends on failed, so it can never be sent as is.
    DependencyFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Conflict => "conflict",
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::Cycle => "cycle",
            FailureKind::DependencyFailed => "dependency_failed",
        }
    }

    /// Cycles and exhausted retries are never sent again, even on request.
    pub fn allows_manual_retry(&self) -> bool {
        !matches!(self, FailureKind::Cycle | FailureKind::RetriesExhausted)
    }
}

impl FromStr for FailureKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            FailureKind::Validation,
            FailureKind::Conflict,
            FailureKind::RetriesExhausted,
            FailureKind::Cycle,
            FailureKind::DependencyFailed,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| DomainError::validation(format!("invalid FailureKind: {s}")))
    }
}

/// A mutation waiting to be delivered to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEntry {
    /// Local monotonic sequence; ordering tiebreaker.
    pub id: u64,
    pub idempotency_key: IdempotencyKey,
    pub tenant_id: TenantId,
    pub operation: Operation,
    pub entity: EntityKind,
    /// Server id of the target. Absent for a Create until it resolves.
    pub entity_id: Option<String>,
    /// Placeholder identity of a Create, used by the UI and by dependents.
    pub temp_id: Option<String>,
    pub payload: EntityPayload,
    pub depends_on: Vec<IdempotencyKey>,
    pub timestamp: DateTime<Utc>,
    pub retries: u32,
    pub status: MutationStatus,
    /// Earliest time a transient retry may be sent.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    /// Server-assigned id, recorded when a Create resolves.
    pub resolved_id: Option<String>,
}

impl MutationEntry {
    /// Identity the mutation acts on: the server id if known, else the temp id.
    pub fn target(&self) -> Option<&str> {
        self.entity_id.as_deref().or(self.temp_id.as_deref())
    }

    pub fn targets(&self, entity: EntityKind, id: &str) -> bool {
        self.entity == entity && self.target() == Some(id)
    }

    /// Backoff has elapsed (or none was scheduled).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    pub(crate) fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.id)
    }
}

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// SyncManager lifecycle: `Idle -> Syncing -> Idle | Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}
