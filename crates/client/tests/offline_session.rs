//! End-to-end offline sessions against the in-process backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use stowage_client::{
    Connectivity, ConnectivityState, DrainOutcome, EntityKind, EntityPayload, Fault, InMemoryBackend,
    InMemoryStore, LocalStore, MutationQueue, MutationStatus, NewMutation, OptimisticStore,
    ReconnectPolicy, RealtimeEventBroadcaster, RealtimeStatus, RetryPolicy, SqliteStore,
    StaticSession, SyncConfig, SyncEvent, SyncManager,
};
use stowage_core::TenantId;
use stowage_events::{RealtimeEvent, Subscription};

struct Session {
    tenant: TenantId,
    store: Arc<dyn LocalStore>,
    backend: Arc<InMemoryBackend>,
    manager: SyncManager,
}

async fn session_with(store: Arc<dyn LocalStore>, config: SyncConfig) -> Session {
    let tenant = TenantId::new();
    let backend = Arc::new(InMemoryBackend::new());
    let queue = MutationQueue::open(store.clone(), tenant).await.unwrap();
    let optimistic = OptimisticStore::open(store.clone(), tenant).await;
    let manager = SyncManager::new(
        queue,
        optimistic,
        backend.clone(),
        Connectivity::new(ConnectivityState::Offline),
        config,
    );
    Session {
        tenant,
        store,
        backend,
        manager,
    }
}

async fn session() -> Session {
    session_with(Arc::new(InMemoryStore::new()), SyncConfig::default()).await
}

fn payload(entity: EntityKind, doc: Value) -> EntityPayload {
    EntityPayload::new(entity, doc).unwrap()
}

async fn eventually<T>(sub: &Subscription<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            while let Ok(item) = sub.try_recv() {
                if pred(&item) {
                    return item;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn container_created_offline_points_at_the_synced_location() {
    let s = session().await;

    let location = s
        .manager
        .enqueue(NewMutation::create(
            EntityKind::Location,
            payload(EntityKind::Location, json!({"name": "Garage"})),
        ))
        .await
        .unwrap();
    let location_temp = location.temp_id.clone().unwrap();
    let container = s
        .manager
        .enqueue(NewMutation::create(
            EntityKind::Container,
            payload(EntityKind::Container, json!({"name": "Bin A", "location_id": location_temp})),
        ))
        .await
        .unwrap();
    assert_eq!(container.depends_on, vec![location.idempotency_key]);

    let view = s
        .manager
        .optimistic()
        .get(EntityKind::Container, container.temp_id.as_deref().unwrap())
        .await
        .unwrap();
    assert!(view.pending);
    assert_eq!(view.to_view()["_pending"], true);

    s.manager.connectivity().set_online();
    let outcome = s.manager.process_queue().await.unwrap();
    assert!(matches!(outcome, DrainOutcome::Completed(r) if r.synced == 2 && r.batches == 2));

    let requests = s.backend.requests();
    assert_eq!(requests[0].entity, EntityKind::Location);
    assert_eq!(requests[1].payload.fields()["location_id"], "srv_1");

    let stored = s.backend.record(s.tenant, EntityKind::Container, "srv_2").unwrap();
    assert_eq!(stored["location_id"], "srv_1");

    let mirrored = s.manager.optimistic().get(EntityKind::Container, "srv_2").await.unwrap();
    assert!(!mirrored.pending);
    assert_eq!(mirrored.fields["location_id"], "srv_1");
    assert!(s.manager.queue().entries().await.is_empty());
}

#[tokio::test]
async fn updates_to_one_entity_apply_in_order() {
    let s = session().await;
    let mut seed = serde_json::Map::new();
    seed.insert("name".into(), json!("Drill"));
    seed.insert("quantity".into(), json!(1));
    s.backend.seed(s.tenant, EntityKind::Item, "srv_100", seed);

    for quantity in [2, 3] {
        s.manager
            .enqueue(NewMutation::update(
                EntityKind::Item,
                "srv_100",
                payload(EntityKind::Item, json!({"quantity": quantity})),
            ))
            .await
            .unwrap();
    }
    let local = s.manager.optimistic().get(EntityKind::Item, "srv_100").await.unwrap();
    assert_eq!(local.fields["quantity"], 3);

    s.manager.connectivity().set_online();
    let outcome = s.manager.process_queue().await.unwrap();
    assert!(matches!(outcome, DrainOutcome::Completed(r) if r.synced == 2 && r.batches == 2));

    let sent: Vec<_> = s
        .backend
        .requests()
        .iter()
        .map(|r| r.payload.fields()["quantity"].clone())
        .collect();
    assert_eq!(sent, vec![json!(2), json!(3)]);
    assert_eq!(s.backend.record(s.tenant, EntityKind::Item, "srv_100").unwrap()["quantity"], 3);
    assert_eq!(s.backend.max_concurrency(), 1);
}

#[tokio::test]
async fn concurrent_drain_requests_are_single_flight() {
    let s = session().await;
    s.backend.set_latency(Duration::from_millis(300));
    s.manager
        .enqueue(NewMutation::create(
            EntityKind::Category,
            payload(EntityKind::Category, json!({"name": "Tools"})),
        ))
        .await
        .unwrap();
    s.manager.connectivity().set_online();

    let manager = s.manager.clone();
    let first = tokio::spawn(async move { manager.process_queue().await });
    while s.backend.requests_started() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(s.manager.is_draining());
    assert_eq!(s.manager.process_queue().await.unwrap(), DrainOutcome::AlreadyRunning);

    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, DrainOutcome::Completed(r) if r.synced == 1));
    assert_eq!(s.backend.requests_started(), 1);
    assert!(!s.manager.is_draining());
}

#[tokio::test]
async fn lost_response_is_replayed_without_double_apply() {
    let s = session_with(
        Arc::new(InMemoryStore::new()),
        SyncConfig::default().with_retry(RetryPolicy::immediate(3)),
    )
    .await;
    let events = s.manager.subscribe();
    s.backend.push_fault(Fault::CommitThenTimeout);
    let entry = s
        .manager
        .enqueue(NewMutation::create(
            EntityKind::Item,
            payload(EntityKind::Item, json!({"name": "Ladder"})),
        ))
        .await
        .unwrap();
    s.manager.connectivity().set_online();

    let first = s.manager.process_queue().await.unwrap();
    assert!(matches!(first, DrainOutcome::Completed(r) if r.retried == 1 && r.synced == 0));
    assert_eq!(s.backend.applied_count(), 1);
    assert!(s.manager.optimistic().is_pending(EntityKind::Item, entry.temp_id.as_deref().unwrap()).await);

    let second = s.manager.process_queue().await.unwrap();
    assert!(matches!(second, DrainOutcome::Completed(r) if r.synced == 1));

    let requests = s.backend.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.idempotency_key == entry.idempotency_key));
    assert_eq!(s.backend.applied_count(), 1);
    assert_eq!(s.backend.records(s.tenant, EntityKind::Item).len(), 1);

    let retried = events
        .drain()
        .into_iter()
        .any(|e| matches!(e, SyncEvent::MutationRetryScheduled { retries: 1, .. }));
    assert!(retried);
}

#[tokio::test]
async fn remote_change_waits_for_local_edit_to_resolve() {
    let s = session().await;
    let mut seed = serde_json::Map::new();
    seed.insert("name".into(), json!("Drill"));
    seed.insert("quantity".into(), json!(1));
    s.backend.seed(s.tenant, EntityKind::Item, "srv_100", seed);

    let realtime = RealtimeEventBroadcaster::new(
        s.backend.clone(),
        Arc::new(StaticSession::new("token")),
        ReconnectPolicy::default(),
    );
    let status = realtime.status_events();
    let received = realtime.subscribe_channel();
    realtime.set_workspace(&s.manager).await;
    eventually(&status, |st| matches!(st, RealtimeStatus::Connected { .. })).await;

    s.manager
        .enqueue(NewMutation::update(
            EntityKind::Item,
            "srv_100",
            payload(EntityKind::Item, json!({"quantity": 5})),
        ))
        .await
        .unwrap();

    s.backend.publish_event(RealtimeEvent {
        event_type: "item.updated".into(),
        entity_id: "srv_100".into(),
        entity_type: "item".into(),
        workspace_id: s.tenant,
        user_id: None,
        timestamp: Utc::now(),
        data: json!({"name": "Drill", "quantity": 9}),
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(received.try_recv().is_err());
    let local = s.manager.optimistic().get(EntityKind::Item, "srv_100").await.unwrap();
    assert!(local.pending);
    assert_eq!(local.fields["quantity"], 5);

    s.manager.connectivity().set_online();
    s.manager.process_queue().await.unwrap();

    let replayed = eventually(&received, |_| true).await;
    assert_eq!(replayed.entity_id, "srv_100");
    let mirrored = s.manager.optimistic().get(EntityKind::Item, "srv_100").await.unwrap();
    assert!(!mirrored.pending);
    assert_eq!(mirrored.fields["quantity"], 9);

    realtime.shutdown().await;
    eventually(&status, |st| matches!(st, RealtimeStatus::Closed { .. })).await;
}

#[tokio::test]
async fn feed_reconnects_after_a_dropped_connection() {
    let s = session().await;
    let realtime = RealtimeEventBroadcaster::new(
        s.backend.clone(),
        Arc::new(StaticSession::new("token")),
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            growth_factor: 2.0,
            max_delay: Duration::from_millis(100),
            max_attempts: 5,
        },
    );
    let status = realtime.status_events();
    let received = realtime.subscribe_channel();
    realtime.set_workspace(&s.manager).await;
    eventually(&status, |st| matches!(st, RealtimeStatus::Connected { .. })).await;

    s.backend.drop_connections();
    let scheduled = eventually(&status, |st| matches!(st, RealtimeStatus::ReconnectScheduled { .. })).await;
    assert!(matches!(
        scheduled,
        RealtimeStatus::ReconnectScheduled { attempt: 1, delay, .. } if delay == Duration::from_millis(10)
    ));
    eventually(&status, |st| matches!(st, RealtimeStatus::Connected { .. })).await;
    assert_eq!(s.backend.connect_attempts(), 2);

    s.backend.publish_event(RealtimeEvent {
        event_type: "location.created".into(),
        entity_id: "srv_7".into(),
        entity_type: "location".into(),
        workspace_id: s.tenant,
        user_id: None,
        timestamp: Utc::now(),
        data: json!({"name": "Basement"}),
    });
    let event = eventually(&received, |_| true).await;
    assert_eq!(event.entity_id, "srv_7");
    assert!(s.manager.optimistic().get(EntityKind::Location, "srv_7").await.is_some());

    realtime.shutdown().await;
    assert_eq!(realtime.active_tenant().await, None);
}

#[tokio::test]
async fn queue_survives_a_restart() {
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let s = session_with(store, SyncConfig::default()).await;
    let location = s
        .manager
        .enqueue(NewMutation::create(
            EntityKind::Location,
            payload(EntityKind::Location, json!({"name": "Loft"})),
        ))
        .await
        .unwrap();
    let temp = location.temp_id.clone().unwrap();
    drop(s.manager);

    let queue = MutationQueue::open(s.store.clone(), s.tenant).await.unwrap();
    let optimistic = OptimisticStore::open(s.store.clone(), s.tenant).await;

    let entries = queue.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].idempotency_key, location.idempotency_key);
    assert_eq!(entries[0].status, MutationStatus::Pending);
    assert!(optimistic.is_pending(EntityKind::Location, &temp).await);

    let manager = SyncManager::new(
        queue,
        optimistic,
        s.backend.clone(),
        Connectivity::new(ConnectivityState::Online),
        SyncConfig::default(),
    );
    manager.process_queue().await.unwrap();
    assert_eq!(s.backend.applied_count(), 1);
    assert!(manager.queue().entries().await.is_empty());
}
