//! Local mirror of entity state read by the UI.
//!
//! One record per `(entity, id)`, where `id` is a server id or the temp id of
//! an unsynced Create. A pending record looks exactly like a confirmed one
//! apart from the `_pending` flag.
//!
//! Pending to confirmed happens only in [`OptimisticStore::confirm`], which
//! replaces the whole record with the authoritative one. Writes to the
//! durable mirror are best effort: a failure is logged and the in-memory view
//! stays authoritative for this session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stowage_core::TenantId;
use stowage_events::RealtimeAction;
use tokio::sync::Mutex;

use crate::payload::Fields;
use crate::store::{LocalStore, tenant_store};
use crate::types::{EntityKind, MutationEntry, Operation};

/// A mirrored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticRecord {
    pub entity: EntityKind,
    pub id: String,
    pub fields: Fields,
    /// Unconfirmed local edits are applied on top of the last confirmed state.
    #[serde(rename = "_pending")]
    pub pending: bool,
    /// Last authoritative state; `None` for an unsynced Create.
    pub confirmed: Option<Fields>,
    pub updated_at: DateTime<Utc>,
}

impl OptimisticRecord {
    fn rebased(entity: EntityKind, id: &str, base: Option<Fields>, local: &[MutationEntry]) -> Option<Self> {
        if base.is_none() && local.is_empty() {
            return None;
        }
        let mut fields = base.clone().unwrap_or_default();
        for entry in local {
            overlay(&mut fields, entry);
        }
        Some(Self {
            entity,
            id: id.to_string(),
            fields,
            pending: !local.is_empty(),
            confirmed: base,
            updated_at: Utc::now(),
        })
    }

    /// The record as the UI reads it: fields plus `id` and `_pending`.
    pub fn to_view(&self) -> Value {
        let mut view = self.fields.clone();
        view.insert("id".to_string(), Value::String(self.id.clone()));
        view.insert("_pending".to_string(), Value::Bool(self.pending));
        Value::Object(view)
    }
}

fn overlay(fields: &mut Fields, entry: &MutationEntry) {
    for (k, v) in entry.payload.fields() {
        fields.insert(k.clone(), v.clone());
    }
}

type RecordKey = (EntityKind, String);

struct OptimisticInner {
    tenant_id: TenantId,
    store: Arc<dyn LocalStore>,
    records: Mutex<HashMap<RecordKey, OptimisticRecord>>,
}

/// One tenant's mirror. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OptimisticStore {
    inner: Arc<OptimisticInner>,
}

impl OptimisticStore {
    /// Load the tenant's mirror from `store`. Unreadable records are skipped.
    pub async fn open(store: Arc<dyn LocalStore>, tenant_id: TenantId) -> Self {
        let mut records = HashMap::new();
        for kind in EntityKind::ALL {
            let name = mirror_store(tenant_id, kind);
            match store.scan(&name).await {
                Ok(rows) => {
                    for (id, value) in rows {
                        match serde_json::from_value::<OptimisticRecord>(value) {
                            Ok(record) => {
                                records.insert((kind, id), record);
                            }
                            Err(e) => {
                                tracing::warn!(store = %name, id = %id, error = %e, "skipping unreadable mirror record");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(store = %name, error = %e, "failed to load optimistic mirror");
                }
            }
        }

        Self {
            inner: Arc::new(OptimisticInner {
                tenant_id,
                store,
                records: Mutex::new(records),
            }),
        }
    }

    pub async fn get(&self, entity: EntityKind, id: &str) -> Option<OptimisticRecord> {
        let records = self.inner.records.lock().await;
        records.get(&(entity, id.to_string())).cloned()
    }

    /// All records of one entity type, ordered by id.
    pub async fn list(&self, entity: EntityKind) -> Vec<OptimisticRecord> {
        let records = self.inner.records.lock().await;
        let mut out: Vec<_> = records
            .iter()
            .filter(|((kind, _), _)| *kind == entity)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn is_pending(&self, entity: EntityKind, id: &str) -> bool {
        self.get(entity, id).await.is_some_and(|r| r.pending)
    }

    /// Reflect a freshly enqueued mutation.
    pub async fn apply_local(&self, entry: &MutationEntry) {
        let Some(id) = entry.target() else {
            return;
        };
        let key = (entry.entity, id.to_string());

        let record = {
            let mut records = self.inner.records.lock().await;
            let record = records.entry(key).or_insert_with(|| OptimisticRecord {
                entity: entry.entity,
                id: id.to_string(),
                fields: Fields::new(),
                pending: true,
                confirmed: None,
                updated_at: Utc::now(),
            });
            if entry.operation == Operation::Create {
                record.fields = entry.payload.fields().clone();
            } else {
                overlay(&mut record.fields, entry);
            }
            record.pending = true;
            record.updated_at = Utc::now();
            record.clone()
        };

        self.persist(&record).await;
    }

    /// Atomically replace the local record with the authoritative one.
    ///
    /// `local_id` is the id the record was mirrored under (the temp id for a
    /// Create). Entries in `still_outstanding` targeting the server id are
    /// re-applied on top, keeping the record pending until they resolve too.
    pub async fn confirm(
        &self,
        entity: EntityKind,
        local_id: &str,
        server_id: &str,
        record: Fields,
        still_outstanding: &[MutationEntry],
    ) {
        let (replaced, stale) = {
            let mut records = self.inner.records.lock().await;
            let stale = records.remove(&(entity, local_id.to_string()));
            let replaced = OptimisticRecord::rebased(entity, server_id, Some(record), still_outstanding);
            if let Some(r) = &replaced {
                records.insert((entity, server_id.to_string()), r.clone());
            }
            (replaced, stale.filter(|_| local_id != server_id))
        };

        if stale.is_some() {
            self.forget(entity, local_id).await;
        }
        if let Some(record) = replaced {
            tracing::debug!(entity = %entity, id = %server_id, pending = record.pending, "record confirmed");
            self.persist(&record).await;
        }
    }

    /// Undo a terminally failed mutation.
    ///
    /// A failed Create disappears. A failed Update falls back to the last
    /// confirmed state with `still_outstanding` re-applied.
    pub async fn rollback(&self, failed: &MutationEntry, still_outstanding: &[MutationEntry]) {
        let Some(id) = failed.target() else {
            return;
        };
        let key = (failed.entity, id.to_string());

        let restored = {
            let mut records = self.inner.records.lock().await;
            let base = match failed.operation {
                Operation::Create => None,
                Operation::Update => records.get(&key).and_then(|r| r.confirmed.clone()),
            };
            match OptimisticRecord::rebased(failed.entity, id, base, still_outstanding) {
                Some(record) => {
                    records.insert(key, record.clone());
                    Some(record)
                }
                None => {
                    records.remove(&key);
                    None
                }
            }
        };

        match restored {
            Some(record) => self.persist(&record).await,
            None => self.forget(failed.entity, id).await,
        }
    }

    /// Merge a change pushed by the backend.
    ///
    /// Pending records are never overwritten; callers defer the event until
    /// the local mutation resolves. Returns whether the mirror changed.
    pub async fn apply_remote(
        &self,
        entity: EntityKind,
        id: &str,
        action: RealtimeAction,
        data: &Value,
    ) -> bool {
        let key = (entity, id.to_string());
        let outcome = {
            let mut records = self.inner.records.lock().await;
            if records.get(&key).is_some_and(|r| r.pending) {
                tracing::warn!(entity = %entity, id = %id, "remote change for a pending record ignored");
                return false;
            }
            match (action, data) {
                (RealtimeAction::Deleted, _) => records.remove(&key).map(|_| None),
                (_, Value::Object(fields)) => {
                    let record = OptimisticRecord {
                        entity,
                        id: id.to_string(),
                        fields: fields.clone(),
                        pending: false,
                        confirmed: Some(fields.clone()),
                        updated_at: Utc::now(),
                    };
                    records.insert(key, record.clone());
                    Some(Some(record))
                }
                // Notification without a body; nothing to mirror.
                _ => None,
            }
        };

        match outcome {
            Some(Some(record)) => {
                self.persist(&record).await;
                true
            }
            Some(None) => {
                self.forget(entity, id).await;
                true
            }
            None => false,
        }
    }

    async fn persist(&self, record: &OptimisticRecord) {
        let name = mirror_store(self.inner.tenant_id, record.entity);
        let value = match serde_json::to_value(record) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(store = %name, id = %record.id, error = %e, "failed to encode mirror record");
                return;
            }
        };
        if let Err(e) = self.inner.store.put(&name, &record.id, &value).await {
            tracing::warn!(store = %name, id = %record.id, error = %e, "failed to write mirror record");
        }
    }

    async fn forget(&self, entity: EntityKind, id: &str) {
        let name = mirror_store(self.inner.tenant_id, entity);
        if let Err(e) = self.inner.store.delete(&name, id).await {
            tracing::warn!(store = %name, id = %id, error = %e, "failed to delete mirror record");
        }
    }
}

fn mirror_store(tenant_id: TenantId, entity: EntityKind) -> String {
    tenant_store(tenant_id, &format!("optimistic:{entity}"))
}
