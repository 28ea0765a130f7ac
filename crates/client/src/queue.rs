//! Durable, ordered queue of mutations waiting for the backend.
//!
//! The queue is the only source of truth for "what must still happen".
//! Every change is written to the [`LocalStore`] before the in-memory view is
//! updated, and every writer goes through one async mutex, so no two callers
//! ever interleave a read-modify-write of the same entry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_core::{DomainError, TenantId};
use tokio::sync::Mutex;

use crate::error::{QueueError, StoreError};
use crate::idempotency::{IdempotencyKey, IdempotencyKeyGenerator, is_temp_id};
use crate::payload::EntityPayload;
use crate::resolver::{self, Resolution};
use crate::store::{LocalStore, tenant_store};
use crate::types::{EntityKind, FailureKind, MutationEntry, MutationStatus, Operation};

const RESOLUTIONS: &str = "resolutions";

/// Input of [`MutationQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub operation: Operation,
    pub entity: EntityKind,
    pub payload: EntityPayload,
    pub entity_id: Option<String>,
    pub depends_on: Vec<IdempotencyKey>,
}

impl NewMutation {
    pub fn create(entity: EntityKind, payload: EntityPayload) -> Self {
        Self {
            operation: Operation::Create,
            entity,
            payload,
            entity_id: None,
            depends_on: Vec::new(),
        }
    }

    pub fn update(entity: EntityKind, entity_id: impl Into<String>, payload: EntityPayload) -> Self {
        Self {
            operation: Operation::Update,
            entity,
            payload,
            entity_id: Some(entity_id.into()),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, keys: impl IntoIterator<Item = IdempotencyKey>) -> Self {
        self.depends_on.extend(keys);
        self
    }
}

/// A status transition requested by the sync manager.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Syncing,
    /// Delivered. A Create must carry the server-assigned id.
    Synced { resolved_id: Option<String> },
    /// Transient failure: back to `Pending`, `retries + 1`, not before the given time.
    RetryLater {
        error: String,
        not_before: DateTime<Utc>,
    },
    /// Credential refused: back to `Pending` without spending a retry.
    Held { error: String },
    /// `retries`, when set, replaces the stored attempt count.
    Failed {
        failure: FailureKind,
        error: String,
        retries: Option<u32>,
    },
}

impl StatusUpdate {
    fn target(&self) -> MutationStatus {
        match self {
            StatusUpdate::Syncing => MutationStatus::Syncing,
            StatusUpdate::Synced { .. } => MutationStatus::Synced,
            StatusUpdate::RetryLater { .. } | StatusUpdate::Held { .. } => MutationStatus::Pending,
            StatusUpdate::Failed { .. } => MutationStatus::Failed,
        }
    }
}

/// Outcome of a status transition.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// The entry after the transition. A `Synced` entry is no longer queued.
    pub entry: MutationEntry,
    /// Entries whose entity id or payload had a resolved temp id rewritten.
    pub substituted: Vec<IdempotencyKey>,
}

/// The next batch of a drain, plus anything the resolver had to fail.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    /// Entries now `Syncing`, in send order.
    pub batch: Vec<MutationEntry>,
    /// Entries failed with `DependencyFailed` during planning.
    pub failed: Vec<MutationEntry>,
    /// Cycle groups, every member now failed with `Cycle`.
    pub cycles: Vec<Vec<MutationEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Resolved {
    entity: EntityKind,
    temp_id: Option<String>,
    server_id: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: BTreeMap<u64, MutationEntry>,
    by_key: HashMap<IdempotencyKey, u64>,
    next_seq: u64,
    resolved: HashMap<IdempotencyKey, Resolved>,
    /// temp id -> server id, for every resolved Create.
    temp_ids: HashMap<String, String>,
}

impl QueueState {
    fn get(&self, key: &IdempotencyKey) -> Option<&MutationEntry> {
        self.by_key.get(key).and_then(|id| self.entries.get(id))
    }

    fn require(&self, key: &IdempotencyKey) -> Result<&MutationEntry, QueueError> {
        self.get(key).ok_or(QueueError::NotFound(*key))
    }

    fn commit(&mut self, entry: MutationEntry) {
        self.by_key.insert(entry.idempotency_key, entry.id);
        self.entries.insert(entry.id, entry);
    }

    fn remove(&mut self, key: &IdempotencyKey) -> Option<MutationEntry> {
        let id = self.by_key.remove(key)?;
        self.entries.remove(&id)
    }

    fn resolution(&self) -> Resolution {
        resolver::resolve(self.entries.values(), |k| self.resolved.contains_key(k))
    }
}

struct QueueInner {
    tenant_id: TenantId,
    store: Arc<dyn LocalStore>,
    keys: IdempotencyKeyGenerator,
    state: Mutex<QueueState>,
}

/// One tenant's mutation queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    /// Open the tenant's queue, reloading whatever the store holds.
    ///
    /// Entries found `Syncing` were in flight when the process stopped; they
    /// go back to `Pending` and are resent under the same idempotency key.
    pub async fn open(store: Arc<dyn LocalStore>, tenant_id: TenantId) -> Result<Self, QueueError> {
        let mut state = QueueState::default();

        for (key, value) in store.scan(&tenant_store(tenant_id, RESOLUTIONS)).await? {
            let key: IdempotencyKey = key
                .parse()
                .map_err(|e: DomainError| StoreError::Serialization(e.to_string()))?;
            let resolved: Resolved = serde_json::from_value(value).map_err(StoreError::from)?;
            if let (Some(temp), Some(server)) = (&resolved.temp_id, &resolved.server_id) {
                state.temp_ids.insert(temp.clone(), server.clone());
            }
            state.resolved.insert(key, resolved);
        }

        let mut reset = 0usize;
        for mut entry in store.load_mutations(tenant_id).await? {
            if entry.status == MutationStatus::Syncing {
                entry.status = MutationStatus::Pending;
                store.update_mutation(&entry).await?;
                reset += 1;
            }
            state.next_seq = state.next_seq.max(entry.id);
            state.commit(entry);
        }
        state.next_seq += 1;

        tracing::info!(
            tenant_id = %tenant_id,
            entries = state.entries.len(),
            reset,
            "mutation queue opened"
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                tenant_id,
                store,
                keys: IdempotencyKeyGenerator::new(),
                state: Mutex::new(state),
            }),
        })
    }

    pub fn tenant_id(&self) -> TenantId {
        self.inner.tenant_id
    }

    /// Validate, persist, then acknowledge a new mutation.
    ///
    /// References to the temp id of an outstanding Create (as `entity_id` or
    /// anywhere in the payload) add that Create to `depends_on`. Temp ids
    /// that already resolved are replaced by their server id.
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<MutationEntry, QueueError> {
        let NewMutation {
            operation,
            entity,
            mut payload,
            mut entity_id,
            depends_on,
        } = mutation;

        payload.validate(entity, operation)?;
        match (operation, entity_id.as_deref()) {
            (Operation::Create, Some(_)) => {
                return Err(DomainError::validation(format!(
                    "{entity} create must not carry an entity id"
                ))
                .into());
            }
            (Operation::Update, None) => {
                return Err(DomainError::validation(format!(
                    "{entity} update requires an entity id"
                ))
                .into());
            }
            (Operation::Update, Some(id)) if id.trim().is_empty() => {
                return Err(DomainError::validation(format!("{entity} update has an empty entity id")).into());
            }
            _ => {}
        }

        let mut state = self.inner.state.lock().await;

        let mut deps: Vec<IdempotencyKey> = Vec::with_capacity(depends_on.len());
        for key in depends_on {
            if !state.by_key.contains_key(&key) && !state.resolved.contains_key(&key) {
                return Err(QueueError::UnknownDependency(key));
            }
            if !deps.contains(&key) {
                deps.push(key);
            }
        }

        if let Some(server_id) = entity_id.as_ref().and_then(|id| state.temp_ids.get(id)) {
            entity_id = Some(server_id.clone());
        }
        let temps: Vec<String> = payload
            .string_values()
            .into_iter()
            .filter(|s| is_temp_id(s))
            .map(str::to_owned)
            .collect();
        for temp in temps {
            if let Some(server_id) = state.temp_ids.get(&temp) {
                payload.substitute(&temp, server_id);
            }
        }

        if let Some(id) = entity_id.as_deref() {
            if is_temp_id(id) && !state.entries.values().any(|e| e.temp_id.as_deref() == Some(id)) {
                return Err(DomainError::validation(format!("unknown temp id '{id}'")).into());
            }
        }

        let implied: Vec<IdempotencyKey> = state
            .entries
            .values()
            .filter_map(|e| match (e.operation, e.temp_id.as_deref()) {
                (Operation::Create, Some(temp)) => Some((e.idempotency_key, temp)),
                _ => None,
            })
            .filter(|(_, temp)| entity_id.as_deref() == Some(*temp) || payload.references(temp))
            .map(|(key, _)| key)
            .collect();
        for key in implied {
            if !deps.contains(&key) {
                deps.push(key);
            }
        }

        let idempotency_key = self.inner.keys.next_key();
        if state.by_key.contains_key(&idempotency_key) {
            return Err(QueueError::DuplicateKey(idempotency_key));
        }

        let entry = MutationEntry {
            id: state.next_seq,
            idempotency_key,
            tenant_id: self.inner.tenant_id,
            operation,
            entity,
            entity_id,
            temp_id: (operation == Operation::Create).then(|| self.inner.keys.next_temp_id()),
            payload,
            depends_on: deps,
            timestamp: Utc::now(),
            retries: 0,
            status: MutationStatus::Pending,
            next_attempt_at: None,
            last_error: None,
            failure: None,
            resolved_id: None,
        };

        self.inner
            .store
            .insert_mutation(&entry)
            .await
            .map_err(|e| match e {
                StoreError::Duplicate(_) => QueueError::DuplicateKey(idempotency_key),
                other => other.into(),
            })?;

        state.next_seq += 1;
        state.commit(entry.clone());

        tracing::debug!(
            tenant_id = %self.inner.tenant_id,
            idempotency_key = %entry.idempotency_key,
            operation = entry.operation.as_str(),
            entity = %entry.entity,
            depends_on = entry.depends_on.len(),
            "mutation enqueued"
        );

        Ok(entry)
    }

    /// Pending entries whose dependencies are all synced and whose backoff
    /// has elapsed, in send order. Nothing changes state.
    pub async fn dequeue_eligible(&self) -> Vec<MutationEntry> {
        let state = self.inner.state.lock().await;
        let now = Utc::now();
        state
            .resolution()
            .ready
            .iter()
            .filter_map(|k| state.get(k))
            .filter(|e| e.is_due(now))
            .cloned()
            .collect()
    }

    /// Pick up to `limit` eligible entries (skipping `exclude`) and mark them
    /// `Syncing`. Cycle members and entries whose dependencies can never be
    /// satisfied are failed on the way.
    pub async fn plan_batch(
        &self,
        limit: usize,
        exclude: &HashSet<IdempotencyKey>,
    ) -> Result<BatchPlan, QueueError> {
        let mut state = self.inner.state.lock().await;
        let resolution = state.resolution();
        let mut plan = BatchPlan::default();

        for group in &resolution.cycles {
            let mut members = Vec::with_capacity(group.len());
            let error = format!("dependency cycle among {} mutations", group.len());
            for key in group {
                if let Some(entry) = self.abandon(&mut state, key, FailureKind::Cycle, &error).await? {
                    members.push(entry);
                }
            }
            if !members.is_empty() {
                plan.cycles.push(members);
            }
        }

        for key in &resolution.blocked {
            let error = "a dependency failed or is missing";
            if let Some(entry) = self
                .abandon(&mut state, key, FailureKind::DependencyFailed, error)
                .await?
            {
                plan.failed.push(entry);
            }
        }

        let now = Utc::now();
        let picks: Vec<IdempotencyKey> = resolution
            .ready
            .iter()
            .filter(|k| !exclude.contains(k))
            .filter(|k| state.get(k).is_some_and(|e| e.is_due(now)))
            .take(limit)
            .copied()
            .collect();
        for key in picks {
            match self.apply(&mut state, &key, StatusUpdate::Syncing).await {
                Ok(change) => plan.batch.push(change.entry),
                Err(e) => {
                    for picked in &plan.batch {
                        self.release_locked(&mut state, &picked.idempotency_key).await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(plan)
    }

    /// Fail an entry that was never sent: a cycle member or a dependent of
    /// a failed mutation. Only planning moves an entry from `Pending`
    /// straight to `Failed`; anything else is skipped.
    async fn abandon(
        &self,
        state: &mut QueueState,
        key: &IdempotencyKey,
        failure: FailureKind,
        error: &str,
    ) -> Result<Option<MutationEntry>, QueueError> {
        let Some(mut entry) = state.get(key).filter(|e| e.status == MutationStatus::Pending).cloned() else {
            return Ok(None);
        };
        entry.status = MutationStatus::Failed;
        entry.failure = Some(failure);
        entry.last_error = Some(error.to_string());
        entry.next_attempt_at = None;

        self.inner.store.update_mutation(&entry).await?;
        state.commit(entry.clone());
        Ok(Some(entry))
    }

    /// Put a `Syncing` entry whose outcome could not be recorded back to
    /// `Pending`, as [`open`](Self::open) does after a crash. The backend
    /// dedups the resend. Returns false if the entry is not `Syncing`.
    pub async fn release(&self, key: &IdempotencyKey) -> bool {
        let mut state = self.inner.state.lock().await;
        self.release_locked(&mut state, key).await
    }

    async fn release_locked(&self, state: &mut QueueState, key: &IdempotencyKey) -> bool {
        let Some(mut entry) = state.get(key).filter(|e| e.status == MutationStatus::Syncing).cloned() else {
            return false;
        };
        entry.status = MutationStatus::Pending;
        // A stale `Syncing` row is reset on the next open anyway.
        if let Err(e) = self.inner.store.update_mutation(&entry).await {
            tracing::debug!(idempotency_key = %key, error = %e, "released entry not persisted");
        }
        state.commit(entry);
        true
    }

    /// Persist a status transition.
    ///
    /// On `Synced` the row leaves the durable queue. For a Create the server
    /// id is recorded and substituted for the temp id in every entry that is
    /// not currently `Syncing`.
    pub async fn update_status(
        &self,
        key: &IdempotencyKey,
        update: StatusUpdate,
    ) -> Result<StatusChange, QueueError> {
        let mut state = self.inner.state.lock().await;
        self.apply(&mut state, key, update).await
    }

    async fn apply(
        &self,
        state: &mut QueueState,
        key: &IdempotencyKey,
        update: StatusUpdate,
    ) -> Result<StatusChange, QueueError> {
        let mut entry = state.require(key)?.clone();
        let to = update.target();
        let allowed = match update {
            StatusUpdate::RetryLater { .. } | StatusUpdate::Held { .. } => {
                entry.status == MutationStatus::Syncing
            }
            _ => entry.status.can_transition_to(to),
        };
        if !allowed {
            return Err(QueueError::InvalidTransition {
                key: *key,
                from: entry.status,
                to,
            });
        }

        entry.status = to;
        match update {
            StatusUpdate::Syncing => {}
            StatusUpdate::RetryLater { error, not_before } => {
                entry.retries = entry.retries.saturating_add(1);
                entry.last_error = Some(error);
                entry.next_attempt_at = Some(not_before);
            }
            StatusUpdate::Held { error } => {
                entry.last_error = Some(error);
                entry.next_attempt_at = None;
            }
            StatusUpdate::Failed {
                failure,
                error,
                retries,
            } => {
                if let Some(retries) = retries {
                    entry.retries = retries;
                }
                entry.failure = Some(failure);
                entry.last_error = Some(error);
                entry.next_attempt_at = None;
            }
            StatusUpdate::Synced { resolved_id } => {
                return self.settle(state, entry, resolved_id).await;
            }
        }

        self.inner.store.update_mutation(&entry).await?;
        state.commit(entry.clone());
        Ok(StatusChange {
            entry,
            substituted: Vec::new(),
        })
    }

    async fn settle(
        &self,
        state: &mut QueueState,
        mut entry: MutationEntry,
        resolved_id: Option<String>,
    ) -> Result<StatusChange, QueueError> {
        let tenant_id = self.inner.tenant_id;
        let key = entry.idempotency_key;

        let server_id = match entry.operation {
            Operation::Create => Some(resolved_id.ok_or_else(|| {
                DomainError::validation(format!("create {key} resolved without a server id"))
            })?),
            Operation::Update => resolved_id.or_else(|| entry.entity_id.clone()),
        };
        entry.resolved_id = server_id.clone();
        entry.last_error = None;
        entry.next_attempt_at = None;

        let record = Resolved {
            entity: entry.entity,
            temp_id: entry.temp_id.clone(),
            server_id: server_id.clone(),
        };
        let value = serde_json::to_value(&record).map_err(StoreError::from)?;
        self.inner
            .store
            .put(&tenant_store(tenant_id, RESOLUTIONS), &key.to_string(), &value)
            .await?;
        self.inner.store.delete_mutation(tenant_id, &key).await?;
        state.remove(&key);
        state.resolved.insert(key, record);

        let mut substituted = Vec::new();
        if let (Some(temp), Some(server)) = (entry.temp_id.as_deref(), server_id.as_deref()) {
            state.temp_ids.insert(temp.to_string(), server.to_string());

            let rewritten: Vec<MutationEntry> = state
                .entries
                .values()
                .filter(|e| e.status != MutationStatus::Syncing)
                .filter_map(|e| {
                    let mut e = e.clone();
                    let mut changed = false;
                    if e.entity_id.as_deref() == Some(temp) {
                        e.entity_id = Some(server.to_string());
                        changed = true;
                    }
                    changed |= e.payload.substitute(temp, server);
                    changed.then_some(e)
                })
                .collect();

            for e in rewritten {
                self.inner.store.update_mutation(&e).await?;
                substituted.push(e.idempotency_key);
                state.commit(e);
            }

            if !substituted.is_empty() {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    temp_id = temp,
                    server_id = server,
                    rewritten = substituted.len(),
                    "substituted resolved id into dependents"
                );
            }
        }

        Ok(StatusChange { entry, substituted })
    }

    /// Put a `Failed` entry back to `Pending` with a fresh retry budget.
    pub async fn retry_failed(&self, key: &IdempotencyKey) -> Result<MutationEntry, QueueError> {
        let mut state = self.inner.state.lock().await;
        let mut entry = state.require(key)?.clone();
        if entry.status != MutationStatus::Failed {
            return Err(QueueError::InvalidTransition {
                key: *key,
                from: entry.status,
                to: MutationStatus::Pending,
            });
        }
        if let Some(failure) = entry.failure {
            if !failure.allows_manual_retry() {
                return Err(QueueError::NotRetryable { key: *key, failure });
            }
        }

        entry.status = MutationStatus::Pending;
        entry.retries = 0;
        entry.failure = None;
        entry.last_error = None;
        entry.next_attempt_at = None;

        self.inner.store.update_mutation(&entry).await?;
        state.commit(entry.clone());
        tracing::info!(idempotency_key = %key, "failed mutation re-queued");
        Ok(entry)
    }

    /// Drop a `Failed` entry for good.
    pub async fn discard(&self, key: &IdempotencyKey) -> Result<MutationEntry, QueueError> {
        let mut state = self.inner.state.lock().await;
        let status = state.require(key)?.status;
        if status != MutationStatus::Failed {
            return Err(QueueError::NotDiscardable(*key));
        }
        self.inner
            .store
            .delete_mutation(self.inner.tenant_id, key)
            .await?;
        state.remove(key).ok_or(QueueError::NotFound(*key))
    }

    /// Entries waiting to be sent (`Pending`).
    pub async fn pending_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| e.status == MutationStatus::Pending)
            .count()
    }

    /// Every queued entry in local sequence order.
    pub async fn entries(&self) -> Vec<MutationEntry> {
        let state = self.inner.state.lock().await;
        state.entries.values().cloned().collect()
    }

    pub async fn get(&self, key: &IdempotencyKey) -> Option<MutationEntry> {
        let state = self.inner.state.lock().await;
        state.get(key).cloned()
    }

    /// Does a `Pending` or `Syncing` entry target this entity?
    pub async fn outstanding_for(&self, entity: EntityKind, id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state
            .entries
            .values()
            .any(|e| e.status.is_outstanding() && e.targets(entity, id))
    }

    /// Outstanding entries targeting this entity, in sequence order.
    pub async fn outstanding_entries_for(&self, entity: EntityKind, id: &str) -> Vec<MutationEntry> {
        let state = self.inner.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| e.status.is_outstanding() && e.targets(entity, id))
            .cloned()
            .collect()
    }

    /// Server id recorded for a synced entry.
    pub async fn resolved_id(&self, key: &IdempotencyKey) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.resolved.get(key).and_then(|r| r.server_id.clone())
    }

    pub async fn is_synced(&self, key: &IdempotencyKey) -> bool {
        let state = self.inner.state.lock().await;
        state.resolved.contains_key(key)
    }
}
