//! Local durable store abstraction.
//!
//! Two surfaces: a keyed record store (`put`/`get` by store name and key),
//! used for the optimistic mirror and bookkeeping, and the mutation queue
//! table whose rows are [`MutationEntry`] values.
//!
//! Crash safety of the engine behind a store is assumed, not implemented here.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use stowage_core::TenantId;

use crate::error::StoreError;
use crate::idempotency::IdempotencyKey;
use crate::types::MutationEntry;

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn put(&self, store: &str, key: &str, record: &Value) -> Result<(), StoreError>;

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn delete(&self, store: &str, key: &str) -> Result<(), StoreError>;

    /// All records of a store, ordered by key.
    async fn scan(&self, store: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Insert a new queue row. Fails with `Duplicate` if the key exists.
    async fn insert_mutation(&self, entry: &MutationEntry) -> Result<(), StoreError>;

    /// Overwrite an existing queue row.
    async fn update_mutation(&self, entry: &MutationEntry) -> Result<(), StoreError>;

    async fn delete_mutation(&self, tenant_id: TenantId, key: &IdempotencyKey)
    -> Result<(), StoreError>;

    /// Every queue row of a tenant, ordered by local sequence.
    async fn load_mutations(&self, tenant_id: TenantId) -> Result<Vec<MutationEntry>, StoreError>;
}

/// Store name scoped to a tenant, e.g. `"<tenant>:optimistic:item"`.
pub fn tenant_store(tenant_id: TenantId, name: &str) -> String {
    format!("{tenant_id}:{name}")
}

/// In-memory store for tests and the simulator.
///
/// `set_fail_writes(true)` makes every write fail, to exercise the
/// write-before-acknowledge and swallow-mirror-failure paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    mutations: RwLock<HashMap<(TenantId, IdempotencyKey), MutationEntry>>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Storage("store is read-only (injected failure)".into()))
        } else {
            Ok(())
        }
    }

    fn poisoned() -> StoreError {
        StoreError::Storage("in-memory store lock poisoned".into())
    }
}

#[async_trait]
impl LocalStore for InMemoryStore {
    async fn put(&self, store: &str, key: &str, record: &Value) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        records
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(store).and_then(|s| s.get(key)).cloned())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        if let Some(s) = records.get_mut(store) {
            s.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, store: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records
            .get(store)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn insert_mutation(&self, entry: &MutationEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut mutations = self.mutations.write().map_err(|_| Self::poisoned())?;
        let id = (entry.tenant_id, entry.idempotency_key);
        if mutations.contains_key(&id) {
            return Err(StoreError::Duplicate(entry.idempotency_key.to_string()));
        }
        mutations.insert(id, entry.clone());
        Ok(())
    }

    async fn update_mutation(&self, entry: &MutationEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut mutations = self.mutations.write().map_err(|_| Self::poisoned())?;
        match mutations.get_mut(&(entry.tenant_id, entry.idempotency_key)) {
            Some(row) => {
                *row = entry.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(entry.idempotency_key.to_string())),
        }
    }

    async fn delete_mutation(
        &self,
        tenant_id: TenantId,
        key: &IdempotencyKey,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut mutations = self.mutations.write().map_err(|_| Self::poisoned())?;
        mutations.remove(&(tenant_id, *key));
        Ok(())
    }

    async fn load_mutations(&self, tenant_id: TenantId) -> Result<Vec<MutationEntry>, StoreError> {
        let mutations = self.mutations.read().map_err(|_| Self::poisoned())?;
        let mut rows: Vec<_> = mutations
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.id);
        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::idempotency::IdempotencyKeyGenerator;
    use crate::payload::EntityPayload;
    use crate::types::{EntityKind, MutationStatus, Operation};

    /// A bare Pending entry, bypassing queue validation.
    pub fn raw_entry(tenant_id: TenantId, id: u64, entity: EntityKind) -> MutationEntry {
        MutationEntry {
            id,
            idempotency_key: IdempotencyKeyGenerator::new().next_key(),
            tenant_id,
            operation: Operation::Update,
            entity,
            entity_id: Some(format!("srv_{id}")),
            temp_id: None,
            payload: EntityPayload::new(entity, json!({"n": id})).unwrap(),
            depends_on: Vec::new(),
            timestamp: Utc::now(),
            retries: 0,
            status: MutationStatus::Pending,
            next_attempt_at: None,
            last_error: None,
            failure: None,
            resolved_id: None,
        }
    }
}
