//! Background worker that decides when the queue drains.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::realtime::RealtimeEventBroadcaster;
use crate::sync_manager::SyncManager;
use crate::types::{ConnectivityState, MutationStatus};

/// Drives one tenant's [`SyncManager`].
///
/// A drain is triggered by:
/// - a new or retried mutation
/// - connectivity coming back
/// - the app becoming visible again
/// - the earliest scheduled retry falling due
/// - the periodic poll, when anything is pending
///
/// Connectivity and visibility changes also reconnect the realtime feed.
pub struct SyncWorker {
    manager: SyncManager,
    realtime: Option<RealtimeEventBroadcaster>,
    shutdown: Arc<Notify>,
}

/// Handle to a running worker.
pub struct SyncWorkerHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SyncWorkerHandle {
    /// Stop the worker and wait for it. A drain in progress finishes its
    /// current batch first.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "sync worker task failed");
        }
    }
}

impl SyncWorker {
    pub fn new(manager: SyncManager) -> Self {
        Self {
            manager,
            realtime: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_realtime(mut self, realtime: RealtimeEventBroadcaster) -> Self {
        self.realtime = Some(realtime);
        self
    }

    pub fn start(self) -> SyncWorkerHandle {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.run());
        SyncWorkerHandle { shutdown, task }
    }

    async fn run(self) {
        let tenant_id = self.manager.queue().tenant_id();
        tracing::info!(tenant_id = %tenant_id, "sync worker started");

        let connectivity = self.manager.connectivity().clone();
        let mut online = connectivity.watch_state();
        let mut visible = connectivity.watch_visibility();
        let nudge = self.manager.nudged();

        let mut poll = tokio::time::interval(self.manager.config().poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Whatever survived the last session goes out first.
        self.drain().await;

        loop {
            let retry_due = self.until_next_retry().await;

            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!(tenant_id = %tenant_id, "sync worker received shutdown signal");
                    self.manager.cancel();
                    break;
                }
                _ = poll.tick() => {
                    if self.manager.queue().pending_count().await > 0 {
                        self.drain().await;
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *online.borrow_and_update();
                    if state == ConnectivityState::Online {
                        tracing::info!(tenant_id = %tenant_id, "back online; draining queue");
                        self.reconnect_feed().await;
                        self.drain().await;
                    }
                }
                changed = visible.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_visible = *visible.borrow_and_update();
                    if is_visible && connectivity.is_online() {
                        tracing::debug!(tenant_id = %tenant_id, "app visible; draining queue");
                        self.reconnect_feed().await;
                        self.drain().await;
                    }
                }
                _ = nudge.notified() => {
                    self.drain().await;
                }
                _ = sleep_or_forever(retry_due) => {
                    self.drain().await;
                }
            }
        }

        tracing::info!(tenant_id = %tenant_id, "sync worker stopped");
    }

    async fn drain(&self) {
        match self.manager.process_queue().await {
            Ok(outcome) => tracing::debug!(outcome = ?outcome, "drain finished"),
            // Already published as a sync event.
            Err(e) => tracing::debug!(error = %e, "drain failed"),
        }
    }

    async fn reconnect_feed(&self) {
        if let Some(realtime) = &self.realtime {
            realtime.reconnect().await;
        }
    }

    /// Time until the earliest backed-off entry becomes due.
    async fn until_next_retry(&self) -> Option<Duration> {
        let now = Utc::now();
        self.manager
            .queue()
            .entries()
            .await
            .into_iter()
            .filter(|e| e.status == MutationStatus::Pending)
            .filter_map(|e| e.next_attempt_at)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

async fn sleep_or_forever(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Fault, InMemoryBackend};
    use crate::config::{RetryPolicy, SyncConfig};
    use crate::offline::Connectivity;
    use crate::optimistic::OptimisticStore;
    use crate::payload::EntityPayload;
    use crate::queue::{MutationQueue, NewMutation};
    use crate::store::InMemoryStore;
    use crate::types::EntityKind;
    use serde_json::json;
    use stowage_core::TenantId;

    async fn setup(initial: ConnectivityState, config: SyncConfig) -> (SyncManager, Arc<InMemoryBackend>) {
        let store = Arc::new(InMemoryStore::new());
        let tenant = TenantId::new();
        let queue = MutationQueue::open(store.clone(), tenant).await.unwrap();
        let optimistic = OptimisticStore::open(store, tenant).await;
        let backend = Arc::new(InMemoryBackend::new());
        let manager = SyncManager::new(queue, optimistic, backend.clone(), Connectivity::new(initial), config);
        (manager, backend)
    }

    async fn settle(manager: &SyncManager) {
        for _ in 0..200 {
            if manager.queue().entries().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("queue did not drain");
    }

    fn location(name: &str) -> NewMutation {
        NewMutation::create(
            EntityKind::Location,
            EntityPayload::new(EntityKind::Location, json!({"name": name})).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_drains_what_was_queued_offline() {
        let (manager, backend) = setup(ConnectivityState::Offline, SyncConfig::default()).await;
        let handle = SyncWorker::new(manager.clone()).start();

        manager.enqueue(location("Garage")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.applied_count(), 0);

        manager.connectivity().set_online();
        settle(&manager).await;
        assert_eq!(backend.applied_count(), 1);

        handle.shutdown().await;
    }

    // Retry deadlines are wall-clock, so this one runs in real time.
    #[tokio::test]
    async fn backed_off_entry_is_retried_when_due() {
        let config = SyncConfig::default().with_retry(RetryPolicy::new(
            3,
            Duration::from_millis(200),
            Duration::from_secs(5),
        ));
        let (manager, backend) = setup(ConnectivityState::Online, config).await;
        backend.push_fault(Fault::Transient);
        let handle = SyncWorker::new(manager.clone()).start();

        manager.enqueue(location("Shed")).await.unwrap();
        settle(&manager).await;

        assert_eq!(backend.requests().len(), 2);
        assert_eq!(backend.applied_count(), 1);
        handle.shutdown().await;
    }
}
