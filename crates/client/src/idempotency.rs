//! Idempotency keys and temp ids.
//!
//! An idempotency key names one *intended* effect. It is minted once at
//! enqueue time and travels with every delivery attempt of that mutation, so
//! the backend can recognise redeliveries and return the original result.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use stowage_core::DomainError;
use uuid::Uuid;

/// Unique, stable key of one queued mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("IdempotencyKey: {e}")))
    }
}

/// Prefix that marks a locally generated placeholder id.
pub const TEMP_ID_PREFIX: &str = "tmp_";

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Mints idempotency keys and temp ids.
///
/// Keys are UUIDv7: time-ordered, and the uuid crate keeps them strictly
/// monotonic within a process, so two keys minted back to back never collide
/// and sort in mint order.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyKeyGenerator;

impl IdempotencyKeyGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn next_key(&self) -> IdempotencyKey {
        IdempotencyKey(Uuid::now_v7())
    }

    pub fn next_temp_id(&self) -> String {
        format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_unique_and_ordered() {
        let generator = IdempotencyKeyGenerator::new();
        let keys: Vec<_> = (0..1_000).map(|_| generator.next_key()).collect();

        let distinct: HashSet<_> = keys.iter().collect();
        assert_eq!(distinct.len(), keys.len());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn temp_ids_are_recognisable() {
        let generator = IdempotencyKeyGenerator::new();
        let temp = generator.next_temp_id();
        assert!(is_temp_id(&temp));
        assert!(!is_temp_id("01936c2e-9f0a-7000-8000-000000000000"));
    }

    #[test]
    fn key_parses_from_display() {
        let key = IdempotencyKeyGenerator::new().next_key();
        assert_eq!(key.to_string().parse::<IdempotencyKey>().unwrap(), key);
    }
}
