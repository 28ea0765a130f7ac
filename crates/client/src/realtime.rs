//! Realtime push feed: one connection per active tenant, fanned out to
//! subscribers and reconciled against unconfirmed local edits.
//!
//! Two tasks run per active tenant:
//! - the connection task owns the feed stream. On a transport error it closes
//!   the stream and reconnects with capped exponential backoff, re-checking
//!   the session before every attempt. An invalid session, or a feed that
//!   refuses the credential, stops the loop and reports
//!   [`RealtimeStatus::ReauthRequired`].
//! - the reconciler consumes feed messages and sync outcomes in one ordered
//!   channel. A message for an entity with an outstanding local mutation is
//!   deferred, then replayed in arrival order once nothing is outstanding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use stowage_core::TenantId;
use stowage_events::{
    EventBus, Handler, InMemoryEventBus, RealtimeEvent, Subscription, TenantScoped, Unsubscribe,
};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;

use crate::config::{ReconnectBackoff, ReconnectPolicy};
use crate::error::{RealtimeError, SessionError};
use crate::optimistic::OptimisticStore;
use crate::queue::MutationQueue;
use crate::session::SessionProvider;
use crate::sync_manager::{SyncEvent, SyncManager};
use crate::types::EntityKind;

/// Decoded feed messages; ends when the connection closes.
pub type FeedStream = BoxStream<'static, Result<RealtimeEvent, RealtimeError>>;

/// Opens the push feed for a tenant.
///
/// The feed transport cannot carry headers, so the credential travels in
/// the connection string and is re-derived for every attempt.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, tenant_id: TenantId, credential: &str) -> Result<FeedStream, RealtimeError>;
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeStatus {
    Connecting { tenant_id: TenantId, attempt: u32 },
    Connected { tenant_id: TenantId },
    Disconnected { tenant_id: TenantId, reason: String },
    ReconnectScheduled {
        tenant_id: TenantId,
        attempt: u32,
        delay: Duration,
    },
    /// Attempt budget spent; waiting for a manual reconnect.
    GaveUp { tenant_id: TenantId, attempts: u32 },
    /// The session is no longer valid; the user must sign in again.
    ReauthRequired { tenant_id: TenantId },
    Closed { tenant_id: TenantId },
}

#[derive(Debug)]
enum ReconcileInput {
    Feed(RealtimeEvent),
    /// A local mutation left the outstanding set: synced, failed, failed
    /// as part of a cycle, or discarded.
    Resolved,
}

struct ActiveFeed {
    tenant_id: TenantId,
    shutdown: Arc<Notify>,
    reconnect: Arc<Notify>,
    connection: JoinHandle<()>,
    reconciler: JoinHandle<()>,
    sync_events: Unsubscribe,
}

struct BroadcasterInner {
    connector: Arc<dyn RealtimeConnector>,
    session: Arc<dyn SessionProvider>,
    policy: ReconnectPolicy,
    events: Arc<InMemoryEventBus<RealtimeEvent>>,
    status: Arc<InMemoryEventBus<RealtimeStatus>>,
    active: Mutex<Option<ActiveFeed>>,
}

/// Shared realtime connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RealtimeEventBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl RealtimeEventBroadcaster {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        session: Arc<dyn SessionProvider>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                connector,
                session,
                policy,
                events: Arc::new(InMemoryEventBus::new()),
                status: Arc::new(InMemoryEventBus::new()),
                active: Mutex::new(None),
            }),
        }
    }

    /// Fan reconciled feed messages out to `handler`.
    pub fn subscribe(&self, handler: impl Fn(&RealtimeEvent) + Send + Sync + 'static) -> Unsubscribe {
        let handler: Handler<RealtimeEvent> = Arc::new(handler);
        self.inner.events.subscribe_with(handler)
    }

    /// Pulled variant of [`subscribe`](Self::subscribe).
    pub fn subscribe_channel(&self) -> Subscription<RealtimeEvent> {
        self.inner.events.subscribe()
    }

    pub fn status_events(&self) -> Subscription<RealtimeStatus> {
        self.inner.status.subscribe()
    }

    pub async fn active_tenant(&self) -> Option<TenantId> {
        self.inner.active.lock().await.as_ref().map(|a| a.tenant_id)
    }

    /// Make `manager`'s tenant the active workspace.
    ///
    /// The previous tenant's connection, if any, is closed first. Feed
    /// messages are reconciled against `manager`'s queue and mirror.
    pub async fn set_workspace(&self, manager: &SyncManager) {
        let mut active = self.inner.active.lock().await;
        if let Some(previous) = active.take() {
            close_feed(previous).await;
        }

        let tenant_id = manager.queue().tenant_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let reconnect = Arc::new(Notify::new());

        let resolved_tx = tx.clone();
        let sync_events = manager.subscribe_with(Arc::new(move |event: &SyncEvent| {
            let resolved = match event {
                SyncEvent::MutationSynced { .. }
                | SyncEvent::MutationFailed { .. }
                | SyncEvent::MutationDiscarded { .. } => true,
                SyncEvent::SyncError { keys, .. } => !keys.is_empty(),
                _ => false,
            };
            if resolved && resolved_tx.send(ReconcileInput::Resolved).is_err() {
                tracing::debug!(tenant_id = %tenant_id, "reconciler stopped; resolution not forwarded");
            }
        }));

        let reconciler = tokio::spawn(run_reconciler(
            Reconciler {
                tenant_id,
                queue: manager.queue().clone(),
                optimistic: manager.optimistic().clone(),
                events: self.inner.events.clone(),
                deferred: Vec::new(),
            },
            rx,
        ));

        let connection = tokio::spawn(run_connection(Connection {
            tenant_id,
            connector: self.inner.connector.clone(),
            session: self.inner.session.clone(),
            backoff: ReconnectBackoff::new(self.inner.policy.clone()),
            status: self.inner.status.clone(),
            shutdown: shutdown.clone(),
            reconnect: reconnect.clone(),
            feed: tx,
        }));

        tracing::info!(tenant_id = %tenant_id, "realtime workspace activated");
        *active = Some(ActiveFeed {
            tenant_id,
            shutdown,
            reconnect,
            connection,
            reconciler,
            sync_events,
        });
    }

    /// Reconnect now with a fresh attempt budget (app visible again,
    /// network back online). A healthy connection is left alone.
    pub async fn reconnect(&self) {
        if let Some(active) = self.inner.active.lock().await.as_ref() {
            active.reconnect.notify_one();
        }
    }

    /// Close the active connection and stop reconciling.
    pub async fn shutdown(&self) {
        if let Some(active) = self.inner.active.lock().await.take() {
            close_feed(active).await;
        }
    }
}

async fn close_feed(feed: ActiveFeed) {
    let ActiveFeed {
        tenant_id,
        shutdown,
        connection,
        reconciler,
        sync_events,
        ..
    } = feed;

    shutdown.notify_one();
    sync_events.unsubscribe();
    if let Err(e) = connection.await {
        tracing::warn!(tenant_id = %tenant_id, error = %e, "feed connection task failed");
    }
    // The connection task held the last feed sender; the reconciler drains
    // what is left and stops.
    if let Err(e) = reconciler.await {
        tracing::warn!(tenant_id = %tenant_id, error = %e, "reconciler task failed");
    }
    tracing::info!(tenant_id = %tenant_id, "realtime workspace closed");
}

struct Connection {
    tenant_id: TenantId,
    connector: Arc<dyn RealtimeConnector>,
    session: Arc<dyn SessionProvider>,
    backoff: ReconnectBackoff,
    status: Arc<InMemoryEventBus<RealtimeStatus>>,
    shutdown: Arc<Notify>,
    reconnect: Arc<Notify>,
    feed: mpsc::UnboundedSender<ReconcileInput>,
}

impl Connection {
    fn report(&self, status: RealtimeStatus) {
        if let Err(e) = self.status.publish(status) {
            tracing::debug!(tenant_id = %self.tenant_id, error = ?e, "failed to publish realtime status");
        }
    }
}

enum PumpEnd {
    Shutdown,
    Lost(String),
}

/// How one connection attempt ended.
enum Attempt {
    /// The session or the feed refused the credential.
    Reauth,
    Failed(String),
}

async fn run_connection(mut conn: Connection) {
    let tenant_id = conn.tenant_id;

    'outer: loop {
        conn.report(RealtimeStatus::Connecting {
            tenant_id,
            attempt: conn.backoff.attempts() + 1,
        });

        let credential = tokio::select! {
            _ = conn.shutdown.notified() => break 'outer,
            credential = conn.session.fresh_credential(tenant_id) => credential,
        };

        let attempt = match credential {
            Err(SessionError::Invalid) => Attempt::Reauth,
            Err(e) => Attempt::Failed(e.to_string()),
            Ok(credential) => {
                let connected = tokio::select! {
                    _ = conn.shutdown.notified() => break 'outer,
                    stream = conn.connector.connect(tenant_id, &credential) => stream,
                };
                match connected {
                    Ok(stream) => {
                        conn.backoff.reset();
                        conn.report(RealtimeStatus::Connected { tenant_id });
                        tracing::info!(tenant_id = %tenant_id, "realtime feed connected");
                        match pump(&conn, stream).await {
                            PumpEnd::Shutdown => break 'outer,
                            PumpEnd::Lost(reason) => Attempt::Failed(reason),
                        }
                    }
                    Err(RealtimeError::Unauthorized) => Attempt::Reauth,
                    Err(e) => Attempt::Failed(e.to_string()),
                }
            }
        };

        let failure = match attempt {
            Attempt::Failed(reason) => reason,
            Attempt::Reauth => {
                tracing::warn!(tenant_id = %tenant_id, "credential refused; realtime reconnect stopped");
                conn.report(RealtimeStatus::ReauthRequired { tenant_id });
                tokio::select! {
                    _ = conn.shutdown.notified() => break 'outer,
                    _ = conn.reconnect.notified() => {
                        conn.backoff.reset();
                        continue 'outer;
                    }
                }
            }
        };

        tracing::warn!(tenant_id = %tenant_id, reason = %failure, "realtime feed disconnected");
        conn.report(RealtimeStatus::Disconnected {
            tenant_id,
            reason: failure,
        });

        match conn.backoff.next_delay() {
            Some(delay) => {
                conn.report(RealtimeStatus::ReconnectScheduled {
                    tenant_id,
                    attempt: conn.backoff.attempts(),
                    delay,
                });
                tokio::select! {
                    _ = conn.shutdown.notified() => break 'outer,
                    _ = conn.reconnect.notified() => conn.backoff.reset(),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                let attempts = conn.backoff.attempts();
                tracing::warn!(tenant_id = %tenant_id, attempts, "realtime reconnect budget spent");
                conn.report(RealtimeStatus::GaveUp { tenant_id, attempts });
                tokio::select! {
                    _ = conn.shutdown.notified() => break 'outer,
                    _ = conn.reconnect.notified() => conn.backoff.reset(),
                }
            }
        }
    }

    conn.report(RealtimeStatus::Closed { tenant_id });
}

async fn pump(conn: &Connection, mut stream: FeedStream) -> PumpEnd {
    loop {
        tokio::select! {
            biased;
            _ = conn.shutdown.notified() => return PumpEnd::Shutdown,
            _ = conn.reconnect.notified() => {
                tracing::debug!(tenant_id = %conn.tenant_id, "feed healthy; manual reconnect ignored");
            }
            frame = stream.next() => match frame {
                Some(Ok(event)) => {
                    if conn.feed.send(ReconcileInput::Feed(event)).is_err() {
                        return PumpEnd::Shutdown;
                    }
                }
                Some(Err(RealtimeError::Decode(message))) => {
                    tracing::warn!(tenant_id = %conn.tenant_id, error = %message, "skipping undecodable feed message");
                }
                Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
                None => return PumpEnd::Lost("feed closed by server".to_string()),
            }
        }
    }
}

struct Reconciler {
    tenant_id: TenantId,
    queue: MutationQueue,
    optimistic: OptimisticStore,
    events: Arc<InMemoryEventBus<RealtimeEvent>>,
    /// Arrival order across all entities.
    deferred: Vec<(EntityKind, RealtimeEvent)>,
}

impl Reconciler {
    /// Local state for this entity is unconfirmed.
    async fn is_held(&self, entity: EntityKind, id: &str) -> bool {
        self.queue.outstanding_for(entity, id).await || self.optimistic.is_pending(entity, id).await
    }

    async fn on_feed(&mut self, event: RealtimeEvent) {
        if event.tenant_id() != self.tenant_id {
            tracing::debug!(tenant_id = %self.tenant_id, event_tenant = %event.tenant_id(), "dropping event for another workspace");
            return;
        }
        if event.is_heartbeat() {
            return;
        }

        let Ok(entity) = event.entity_type.parse::<EntityKind>() else {
            // Not an entity the queue writes; nothing to reconcile against.
            self.publish(event);
            return;
        };

        let queued_behind = self
            .deferred
            .iter()
            .any(|(kind, e)| *kind == entity && e.entity_id == event.entity_id);
        if queued_behind || self.is_held(entity, &event.entity_id).await {
            tracing::debug!(
                entity = %entity,
                entity_id = %event.entity_id,
                event_type = %event.event_type,
                "deferring realtime event behind local mutation"
            );
            self.deferred.push((entity, event));
            return;
        }

        self.apply(entity, event).await;
    }

    async fn on_resolved(&mut self) {
        if self.deferred.is_empty() {
            return;
        }

        let mut held: HashMap<(EntityKind, String), bool> = HashMap::new();
        let mut still_deferred = Vec::new();
        for (entity, event) in std::mem::take(&mut self.deferred) {
            let key = (entity, event.entity_id.clone());
            let is_held = match held.get(&key) {
                Some(h) => *h,
                None => {
                    let h = self.is_held(entity, &event.entity_id).await;
                    held.insert(key, h);
                    h
                }
            };
            if is_held {
                still_deferred.push((entity, event));
            } else {
                tracing::debug!(entity = %entity, entity_id = %event.entity_id, "replaying deferred realtime event");
                self.apply(entity, event).await;
            }
        }
        self.deferred = still_deferred;
    }

    async fn apply(&self, entity: EntityKind, event: RealtimeEvent) {
        self.optimistic
            .apply_remote(entity, &event.entity_id, event.action(), &event.data)
            .await;
        self.publish(event);
    }

    fn publish(&self, event: RealtimeEvent) {
        if let Err(e) = self.events.publish(event) {
            tracing::warn!(error = ?e, "failed to publish realtime event");
        }
    }
}

async fn run_reconciler(mut reconciler: Reconciler, mut rx: mpsc::UnboundedReceiver<ReconcileInput>) {
    while let Some(input) = rx.recv().await {
        match input {
            ReconcileInput::Feed(event) => reconciler.on_feed(event).await,
            ReconcileInput::Resolved => reconciler.on_resolved().await,
        }
    }
    if !reconciler.deferred.is_empty() {
        tracing::debug!(
            tenant_id = %reconciler.tenant_id,
            dropped = reconciler.deferred.len(),
            "reconciler stopped with deferred events"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::SyncConfig;
    use crate::offline::Connectivity;
    use crate::session::StaticSession;
    use crate::store::InMemoryStore;
    use crate::types::ConnectivityState;
    use chrono::Utc;
    use serde_json::json;

    async fn manager(backend: Arc<InMemoryBackend>) -> SyncManager {
        let store = Arc::new(InMemoryStore::new());
        let tenant = TenantId::new();
        let queue = MutationQueue::open(store.clone(), tenant).await.unwrap();
        let optimistic = OptimisticStore::open(store, tenant).await;
        SyncManager::new(
            queue,
            optimistic,
            backend,
            Connectivity::new(ConnectivityState::Online),
            SyncConfig::default(),
        )
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            growth_factor: 2.0,
            max_delay: Duration::from_secs(1),
            max_attempts,
        }
    }

    async fn wait_for<T>(sub: &Subscription<T>, mut pred: impl FnMut(&T) -> bool) -> T {
        loop {
            while let Ok(item) = sub.try_recv() {
                if pred(&item) {
                    return item;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn event(tenant: TenantId, entity_id: &str, data: serde_json::Value) -> RealtimeEvent {
        RealtimeEvent {
            event_type: "item.updated".into(),
            entity_id: entity_id.into(),
            entity_type: "item".into(),
            workspace_id: tenant,
            user_id: None,
            timestamp: Utc::now(),
            data,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_then_gives_up_until_manual_reconnect() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(backend.clone()).await;
        backend.refuse_connects(10);

        let broadcaster = RealtimeEventBroadcaster::new(
            backend.clone(),
            Arc::new(StaticSession::new("tok")),
            policy(3),
        );
        let status = broadcaster.status_events();
        broadcaster.set_workspace(&manager).await;

        let gave_up = wait_for(&status, |s| matches!(s, RealtimeStatus::GaveUp { .. })).await;
        assert!(matches!(gave_up, RealtimeStatus::GaveUp { attempts: 3, .. }));
        assert_eq!(backend.connect_attempts(), 4);

        backend.refuse_connects(0);
        broadcaster.reconnect().await;
        wait_for(&status, |s| matches!(s, RealtimeStatus::Connected { .. })).await;
        broadcaster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_session_asks_for_reauth() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(backend.clone()).await;
        let session = Arc::new(StaticSession::new("tok"));
        let broadcaster = RealtimeEventBroadcaster::new(backend.clone(), session.clone(), policy(5));
        let status = broadcaster.status_events();

        broadcaster.set_workspace(&manager).await;
        wait_for(&status, |s| matches!(s, RealtimeStatus::Connected { .. })).await;

        session.revoke();
        backend.drop_connections();
        wait_for(&status, |s| matches!(s, RealtimeStatus::ReauthRequired { .. })).await;
        assert_eq!(backend.connect_attempts(), 1);

        session.renew("tok2");
        broadcaster.reconnect().await;
        wait_for(&status, |s| matches!(s, RealtimeStatus::Connected { .. })).await;
        assert_eq!(backend.presented_credentials(), vec!["tok".to_string(), "tok2".to_string()]);
        broadcaster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_credential_asks_for_reauth_without_backoff() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(backend.clone()).await;
        let session = Arc::new(StaticSession::new(""));
        let broadcaster = RealtimeEventBroadcaster::new(backend.clone(), session.clone(), policy(5));
        let status = broadcaster.status_events();

        broadcaster.set_workspace(&manager).await;
        wait_for(&status, |s| matches!(s, RealtimeStatus::ReauthRequired { .. })).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.connect_attempts(), 1);
        while let Ok(s) = status.try_recv() {
            assert!(!matches!(s, RealtimeStatus::ReconnectScheduled { .. } | RealtimeStatus::GaveUp { .. }));
        }

        session.renew("tok");
        broadcaster.reconnect().await;
        wait_for(&status, |s| matches!(s, RealtimeStatus::Connected { .. })).await;
        assert_eq!(backend.presented_credentials(), vec![String::new(), "tok".to_string()]);
        broadcaster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn event_held_behind_a_cycle_member_is_replayed() {
        use crate::store::LocalStore;
        use crate::store::test_support::raw_entry;
        use crate::sync_manager::DrainOutcome;

        let store = Arc::new(InMemoryStore::new());
        let tenant = TenantId::new();
        let mut a = raw_entry(tenant, 1, EntityKind::Item);
        let mut b = raw_entry(tenant, 2, EntityKind::Item);
        let mut c = raw_entry(tenant, 3, EntityKind::Item);
        a.depends_on = vec![c.idempotency_key];
        b.depends_on = vec![a.idempotency_key];
        c.depends_on = vec![b.idempotency_key];
        for entry in [&a, &b, &c] {
            store.insert_mutation(entry).await.unwrap();
        }

        let backend = Arc::new(InMemoryBackend::new());
        let queue = MutationQueue::open(store.clone(), tenant).await.unwrap();
        let optimistic = OptimisticStore::open(store, tenant).await;
        let manager = SyncManager::new(
            queue,
            optimistic,
            backend.clone(),
            Connectivity::new(ConnectivityState::Online),
            SyncConfig::default(),
        );

        let broadcaster =
            RealtimeEventBroadcaster::new(backend.clone(), Arc::new(StaticSession::new("tok")), policy(5));
        let status = broadcaster.status_events();
        let received = broadcaster.subscribe_channel();
        broadcaster.set_workspace(&manager).await;
        wait_for(&status, |s| matches!(s, RealtimeStatus::Connected { .. })).await;

        backend.publish_event(event(tenant, "srv_1", json!({"name": "Drill", "quantity": 4})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received.try_recv().is_err());

        let outcome = manager.process_queue().await.unwrap();
        assert!(matches!(outcome, DrainOutcome::Aborted(r) if r.failed == 3));

        let got = wait_for(&received, |_| true).await;
        assert_eq!(got.entity_id, "srv_1");
        let mirrored = manager.optimistic().get(EntityKind::Item, "srv_1").await.unwrap();
        assert_eq!(mirrored.fields["quantity"], 4);
        broadcaster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_workspace_events_are_dropped() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(backend.clone()).await;
        let tenant = manager.queue().tenant_id();
        let broadcaster =
            RealtimeEventBroadcaster::new(backend.clone(), Arc::new(StaticSession::new("tok")), policy(5));
        let status = broadcaster.status_events();
        let received = broadcaster.subscribe_channel();

        broadcaster.set_workspace(&manager).await;
        wait_for(&status, |s| matches!(s, RealtimeStatus::Connected { .. })).await;

        backend.publish_event(event(TenantId::new(), "srv_1", json!({"n": 1})));
        backend.publish_event(event(tenant, "srv_2", json!({"n": 2})));

        let got = wait_for(&received, |_| true).await;
        assert_eq!(got.entity_id, "srv_2");
        assert!(received.try_recv().is_err());
        assert!(manager.optimistic().get(EntityKind::Item, "srv_1").await.is_none());
        broadcaster.shutdown().await;
    }
}
