//! Drains the mutation queue against the backend.
//!
//! State machine: `Idle -> Syncing -> Idle | Error`.
//!
//! A drain repeatedly asks the queue for the next batch (dependency ordered,
//! at most one entry per entity chain, at most `max_in_flight` entries),
//! sends the batch concurrently, and applies every result before planning the
//! next one. Only one drain runs per manager; a second `process_queue` call
//! returns [`DrainOutcome::AlreadyRunning`] right away.
//!
//! Failures never reach the caller that enqueued the mutation. They are
//! published on the manager's event bus.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use stowage_events::{EventBus, Handler, InMemoryEventBus, Subscription, Unsubscribe};
use tokio::sync::Notify;

use crate::config::SyncConfig;
use crate::error::{FailureClass, QueueError, SyncError, TransportError};
use crate::idempotency::IdempotencyKey;
use crate::offline::Connectivity;
use crate::optimistic::OptimisticStore;
use crate::queue::{MutationQueue, NewMutation, StatusUpdate};
use crate::transport::{MutationRequest, MutationResponse, SyncTransport};
use crate::types::{EntityKind, FailureKind, MutationEntry, SyncState};

/// Lifecycle events of the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SyncStarted,
    MutationSynced {
        key: IdempotencyKey,
        entity: EntityKind,
        /// Id the entity was known by locally (temp id for a Create).
        local_id: String,
        entity_id: String,
    },
    MutationRetryScheduled {
        key: IdempotencyKey,
        retries: u32,
        delay: Duration,
        error: String,
    },
    MutationFailed {
        key: IdempotencyKey,
        entity: EntityKind,
        target: Option<String>,
        failure: FailureKind,
        error: String,
    },
    /// A failed mutation was dropped by the caller.
    MutationDiscarded {
        key: IdempotencyKey,
        entity: EntityKind,
        target: Option<String>,
    },
    /// The backend refused the credential. The mutation is held in the
    /// queue until the session is renewed and a drain runs again.
    ReauthRequired { key: IdempotencyKey },
    SyncCompleted(DrainReport),
    SyncError {
        message: String,
        keys: Vec<IdempotencyKey>,
    },
    StateChanged {
        from: SyncState,
        to: SyncState,
    },
}

impl SyncEvent {
    /// Channel name of the event, e.g. `MUTATION_FAILED`.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted => "SYNC_STARTED",
            SyncEvent::MutationSynced { .. } => "MUTATION_SYNCED",
            SyncEvent::MutationRetryScheduled { .. } => "MUTATION_RETRY_SCHEDULED",
            SyncEvent::MutationFailed { .. } => "MUTATION_FAILED",
            SyncEvent::MutationDiscarded { .. } => "MUTATION_DISCARDED",
            SyncEvent::ReauthRequired { .. } => "REAUTH_REQUIRED",
            SyncEvent::SyncCompleted(_) => "SYNC_COMPLETED",
            SyncEvent::SyncError { .. } => "SYNC_ERROR",
            SyncEvent::StateChanged { .. } => "STATE_CHANGED",
        }
    }
}

/// Counters of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub batches: usize,
    pub synced: usize,
    pub retried: usize,
    pub failed: usize,
    /// Held back by a refused credential.
    pub held: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain was active; nothing was done.
    AlreadyRunning,
    Offline,
    Completed(DrainReport),
    /// Stopped at a batch boundary after [`SyncManager::cancel`].
    Cancelled(DrainReport),
    /// Abandoned because of a dependency cycle.
    Aborted(DrainReport),
}

enum DrainEnd {
    Done(DrainReport),
    Cancelled(DrainReport),
    Cycle(DrainReport, Vec<IdempotencyKey>),
}

/// Holds the single-flight flag for the duration of a drain.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ManagerInner {
    queue: MutationQueue,
    optimistic: OptimisticStore,
    transport: Arc<dyn SyncTransport>,
    connectivity: Connectivity,
    config: SyncConfig,
    events: Arc<InMemoryEventBus<SyncEvent>>,
    state: Mutex<SyncState>,
    draining: AtomicBool,
    cancel_requested: AtomicBool,
    nudge: Arc<Notify>,
}

/// One tenant's sync engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    pub fn new(
        queue: MutationQueue,
        optimistic: OptimisticStore,
        transport: Arc<dyn SyncTransport>,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                queue,
                optimistic,
                transport,
                connectivity,
                config,
                events: Arc::new(InMemoryEventBus::new()),
                state: Mutex::new(SyncState::Idle),
                draining: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                nudge: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.inner.queue
    }

    pub fn optimistic(&self) -> &OptimisticStore {
        &self.inner.optimistic
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SyncState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(SyncState::Error)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> Subscription<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_with(&self, handler: Handler<SyncEvent>) -> Unsubscribe {
        self.inner.events.subscribe_with(handler)
    }

    pub(crate) fn nudged(&self) -> Arc<Notify> {
        self.inner.nudge.clone()
    }

    /// Queue a mutation and reflect it in the optimistic mirror.
    ///
    /// Only local problems (invalid input, storage down) are errors here.
    pub async fn enqueue(&self, mutation: NewMutation) -> Result<MutationEntry, QueueError> {
        let entry = self.inner.queue.enqueue(mutation).await?;
        self.inner.optimistic.apply_local(&entry).await;
        self.inner.nudge.notify_one();
        Ok(entry)
    }

    /// Re-queue a failed mutation and re-apply it locally.
    pub async fn retry_failed(&self, key: &IdempotencyKey) -> Result<MutationEntry, QueueError> {
        let entry = self.inner.queue.retry_failed(key).await?;
        self.inner.optimistic.apply_local(&entry).await;
        self.inner.nudge.notify_one();
        Ok(entry)
    }

    /// Drop a failed mutation.
    pub async fn discard(&self, key: &IdempotencyKey) -> Result<MutationEntry, QueueError> {
        let entry = self.inner.queue.discard(key).await?;
        self.roll_back(&entry).await;
        self.publish(SyncEvent::MutationDiscarded {
            key: entry.idempotency_key,
            entity: entry.entity,
            target: entry.target().map(str::to_string),
        });
        Ok(entry)
    }

    /// Ask the running drain to stop at the next batch boundary. Requests
    /// already in flight complete and their results are applied.
    pub fn cancel(&self) {
        if self.is_draining() {
            self.inner.cancel_requested.store(true, Ordering::Release);
        }
    }

    /// Run one drain cycle.
    pub async fn process_queue(&self) -> Result<DrainOutcome, SyncError> {
        if !self.inner.connectivity.is_online() {
            tracing::debug!(tenant_id = %self.inner.queue.tenant_id(), "skipping drain: offline");
            return Ok(DrainOutcome::Offline);
        }
        let Some(_guard) = DrainGuard::acquire(&self.inner.draining) else {
            tracing::debug!(tenant_id = %self.inner.queue.tenant_id(), "drain already running");
            return Ok(DrainOutcome::AlreadyRunning);
        };
        self.inner.cancel_requested.store(false, Ordering::Release);

        self.set_state(SyncState::Syncing);
        self.publish(SyncEvent::SyncStarted);

        match self.drain().await {
            Ok(DrainEnd::Done(report)) => {
                tracing::info!(
                    tenant_id = %self.inner.queue.tenant_id(),
                    batches = report.batches,
                    synced = report.synced,
                    retried = report.retried,
                    failed = report.failed,
                    "drain completed"
                );
                self.set_state(SyncState::Idle);
                self.publish(SyncEvent::SyncCompleted(report));
                Ok(DrainOutcome::Completed(report))
            }
            Ok(DrainEnd::Cancelled(report)) => {
                tracing::info!(tenant_id = %self.inner.queue.tenant_id(), "drain cancelled");
                self.set_state(SyncState::Idle);
                self.publish(SyncEvent::SyncCompleted(report));
                Ok(DrainOutcome::Cancelled(report))
            }
            Ok(DrainEnd::Cycle(report, keys)) => {
                let message = SyncError::Cycle { keys: keys.clone() }.to_string();
                tracing::error!(tenant_id = %self.inner.queue.tenant_id(), error = %message, "drain aborted");
                self.set_state(SyncState::Error);
                self.publish(SyncEvent::SyncError { message, keys });
                Ok(DrainOutcome::Aborted(report))
            }
            Err(e) => {
                tracing::error!(tenant_id = %self.inner.queue.tenant_id(), error = %e, "drain failed");
                self.set_state(SyncState::Error);
                self.publish(SyncEvent::SyncError {
                    message: e.to_string(),
                    keys: Vec::new(),
                });
                Err(e)
            }
        }
    }

    async fn drain(&self) -> Result<DrainEnd, SyncError> {
        let mut report = DrainReport::default();
        // An entry is attempted at most once per drain.
        let mut attempted: HashSet<IdempotencyKey> = HashSet::new();

        loop {
            if self.inner.cancel_requested.swap(false, Ordering::AcqRel) {
                return Ok(DrainEnd::Cancelled(report));
            }
            if !self.inner.connectivity.is_online() {
                tracing::info!("connectivity lost; stopping drain");
                return Ok(DrainEnd::Done(report));
            }

            let plan = self
                .inner
                .queue
                .plan_batch(self.inner.config.max_in_flight, &attempted)
                .await?;

            for entry in &plan.failed {
                report.failed += 1;
                self.roll_back(entry).await;
                self.publish_failure(entry);
            }

            let mut cycle_keys = Vec::new();
            for group in &plan.cycles {
                for entry in group {
                    cycle_keys.push(entry.idempotency_key);
                    report.failed += 1;
                    self.roll_back(entry).await;
                }
            }

            if plan.batch.is_empty() {
                if cycle_keys.is_empty() {
                    return Ok(DrainEnd::Done(report));
                }
                return Ok(DrainEnd::Cycle(report, cycle_keys));
            }

            report.batches += 1;
            attempted.extend(plan.batch.iter().map(|e| e.idempotency_key));
            tracing::debug!(size = plan.batch.len(), "sending batch");

            let results = join_all(plan.batch.iter().map(|entry| self.deliver(entry))).await;

            // Every result is applied even if recording one of them fails.
            let held_before = report.held;
            let mut unrecorded = None;
            for (entry, result) in plan.batch.iter().zip(results) {
                if let Err(e) = self.settle(entry, result, &mut report).await {
                    let key = entry.idempotency_key;
                    tracing::error!(idempotency_key = %key, error = %e, "could not record mutation outcome");
                    self.inner.queue.release(&key).await;
                    unrecorded.get_or_insert(e);
                }
            }
            if let Some(e) = unrecorded {
                return Err(e);
            }

            if !cycle_keys.is_empty() {
                return Ok(DrainEnd::Cycle(report, cycle_keys));
            }
            if report.held > held_before {
                tracing::warn!("credential rejected; stopping drain until the session is renewed");
                return Ok(DrainEnd::Done(report));
            }
        }
    }

    async fn deliver(&self, entry: &MutationEntry) -> Result<MutationResponse, TransportError> {
        let request = MutationRequest::from_entry(entry);
        match tokio::time::timeout(
            self.inner.config.request_timeout,
            self.inner.transport.send(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(idempotency_key = %entry.idempotency_key, "request timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    async fn settle(
        &self,
        entry: &MutationEntry,
        result: Result<MutationResponse, TransportError>,
        report: &mut DrainReport,
    ) -> Result<(), SyncError> {
        let key = entry.idempotency_key;
        let queue = &self.inner.queue;

        let err = match result {
            Ok(response) => {
                queue
                    .update_status(
                        &key,
                        StatusUpdate::Synced {
                            resolved_id: Some(response.entity_id.clone()),
                        },
                    )
                    .await?;
                let local_id = entry.target().unwrap_or(response.entity_id.as_str()).to_string();
                let outstanding = queue
                    .outstanding_entries_for(entry.entity, &response.entity_id)
                    .await;
                self.inner
                    .optimistic
                    .confirm(
                        entry.entity,
                        &local_id,
                        &response.entity_id,
                        response.record,
                        &outstanding,
                    )
                    .await;

                report.synced += 1;
                tracing::debug!(idempotency_key = %key, entity_id = %response.entity_id, "mutation synced");
                self.publish(SyncEvent::MutationSynced {
                    key,
                    entity: entry.entity,
                    local_id,
                    entity_id: response.entity_id,
                });
                return Ok(());
            }
            Err(err) => err,
        };

        let (failure, message, retries) = match err.class() {
            FailureClass::Terminal(kind) => (kind, err.to_string(), None),
            FailureClass::Unauthorized => {
                queue
                    .update_status(
                        &key,
                        StatusUpdate::Held {
                            error: err.to_string(),
                        },
                    )
                    .await?;
                report.held += 1;
                tracing::warn!(idempotency_key = %key, "credential rejected; mutation held");
                self.publish(SyncEvent::ReauthRequired { key });
                return Ok(());
            }
            FailureClass::Transient => {
                let retries = entry.retries.saturating_add(1);
                if self.inner.config.retry.is_exhausted(retries) {
                    (
                        FailureKind::RetriesExhausted,
                        format!("gave up after {retries} attempts: {err}"),
                        Some(retries),
                    )
                } else {
                    let delay = self.inner.config.retry.delay_for_retry(retries);
                    let not_before = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| Utc::now().checked_add_signed(d))
                        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
                    queue
                        .update_status(
                            &key,
                            StatusUpdate::RetryLater {
                                error: err.to_string(),
                                not_before,
                            },
                        )
                        .await?;

                    report.retried += 1;
                    tracing::warn!(
                        idempotency_key = %key,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; retry scheduled"
                    );
                    self.publish(SyncEvent::MutationRetryScheduled {
                        key,
                        retries,
                        delay,
                        error: err.to_string(),
                    });
                    return Ok(());
                }
            }
        };

        let change = queue
            .update_status(
                &key,
                StatusUpdate::Failed {
                    failure,
                    error: message,
                    retries,
                },
            )
            .await?;

        report.failed += 1;
        tracing::warn!(idempotency_key = %key, failure = failure.as_str(), "mutation failed");
        self.roll_back(&change.entry).await;
        self.publish_failure(&change.entry);
        Ok(())
    }

    async fn roll_back(&self, entry: &MutationEntry) {
        let Some(target) = entry.target() else {
            return;
        };
        let outstanding = self
            .inner
            .queue
            .outstanding_entries_for(entry.entity, target)
            .await;
        self.inner.optimistic.rollback(entry, &outstanding).await;
    }

    fn publish_failure(&self, entry: &MutationEntry) {
        self.publish(SyncEvent::MutationFailed {
            key: entry.idempotency_key,
            entity: entry.entity,
            target: entry.target().map(str::to_string),
            failure: entry.failure.unwrap_or(FailureKind::DependencyFailed),
            error: entry.last_error.clone().unwrap_or_default(),
        });
    }

    fn set_state(&self, to: SyncState) {
        let from = match self.inner.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, to),
            Err(_) => return,
        };
        if from != to {
            self.publish(SyncEvent::StateChanged { from, to });
        }
    }

    fn publish(&self, event: SyncEvent) {
        let name = event.name();
        if let Err(e) = self.inner.events.publish(event) {
            tracing::warn!(event = name, error = ?e, "failed to publish sync event");
        }
    }
}
