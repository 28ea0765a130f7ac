//! Offline session simulator.
//!
//! Queues a location, a container inside it and an item inside the
//! container while offline, comes back online against the in-process
//! backend, and prints what the engine did.
//!
//! `STOWAGE_DB_PATH` keeps the queue in a SQLite file instead of memory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use stowage_client::{
    Connectivity, ConnectivityState, EntityKind, EntityPayload, Fault, InMemoryBackend, LocalStore,
    MutationQueue, NewMutation, OptimisticStore, RealtimeEventBroadcaster, SqliteStore, StaticSession,
    SyncConfig, SyncEvent, SyncManager, SyncWorker,
};
use stowage_core::TenantId;
use stowage_events::RealtimeEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stowage_observability::init();

    let config = SyncConfig::from_env();
    let store: Arc<dyn LocalStore> = match std::env::var("STOWAGE_DB_PATH") {
        Ok(path) => Arc::new(SqliteStore::open(&path).await.with_context(|| format!("opening {path}"))?),
        Err(_) => Arc::new(SqliteStore::in_memory().await.context("opening in-memory store")?),
    };

    let tenant_id = TenantId::new();
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_latency(Duration::from_millis(25));
    // The first delivery hits a 503 and is retried.
    backend.push_fault(Fault::Transient);

    let queue = MutationQueue::open(store.clone(), tenant_id).await?;
    let optimistic = OptimisticStore::open(store, tenant_id).await;
    let connectivity = Connectivity::new(ConnectivityState::Offline);
    let manager = SyncManager::new(
        queue,
        optimistic,
        backend.clone(),
        connectivity.clone(),
        config.clone(),
    );

    let _sync_log = manager.subscribe_with(Arc::new(|event: &SyncEvent| {
        println!("[sync] {} {:?}", event.name(), event);
    }));

    let realtime = RealtimeEventBroadcaster::new(
        backend.clone(),
        Arc::new(StaticSession::new("sim-token")),
        config.reconnect.clone(),
    );
    let _feed_log = realtime.subscribe(|event: &RealtimeEvent| {
        println!("[feed] {} {} {}", event.event_type, event.entity_type, event.entity_id);
    });
    realtime.set_workspace(&manager).await;

    let worker = SyncWorker::new(manager.clone())
        .with_realtime(realtime.clone())
        .start();

    let location = manager
        .enqueue(NewMutation::create(
            EntityKind::Location,
            EntityPayload::new(EntityKind::Location, json!({"name": "Garage"}))?,
        ))
        .await?;
    let location_id = location.temp_id.clone().context("create without temp id")?;

    let container = manager
        .enqueue(NewMutation::create(
            EntityKind::Container,
            EntityPayload::new(
                EntityKind::Container,
                json!({"name": "Red toolbox", "location_id": location_id}),
            )?,
        ))
        .await?;
    let container_id = container.temp_id.clone().context("create without temp id")?;

    let item = manager
        .enqueue(
            NewMutation::create(
                EntityKind::Item,
                EntityPayload::new(
                    EntityKind::Item,
                    json!({"name": "Cordless drill", "container_id": container_id, "quantity": 1}),
                )?,
            )
            .depends_on([container.idempotency_key]),
        )
        .await?;
    let item_id = item.temp_id.clone().context("create without temp id")?;

    manager
        .enqueue(NewMutation::update(
            EntityKind::Item,
            item_id.as_str(),
            EntityPayload::new(EntityKind::Item, json!({"quantity": 2}))?,
        ))
        .await?;

    println!("queued offline: {} mutation(s)", manager.queue().pending_count().await);
    for record in manager.optimistic().list(EntityKind::Item).await {
        println!("  local item {} -> {}", record.id, record.to_view());
    }

    connectivity.set_online();

    tokio::time::timeout(Duration::from_secs(30), async {
        while !manager.queue().entries().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("queue did not drain within 30s")?;

    // Someone else edits the drill.
    if let Some((server_id, _)) = backend.records(tenant_id, EntityKind::Item).into_iter().next() {
        backend.publish_event(RealtimeEvent {
            event_type: "item.updated".to_string(),
            entity_id: server_id,
            entity_type: "item".to_string(),
            workspace_id: tenant_id,
            user_id: None,
            timestamp: Utc::now(),
            data: json!({"name": "Cordless drill", "quantity": 3}),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for entity in [EntityKind::Location, EntityKind::Container, EntityKind::Item] {
        for (id, record) in backend.records(tenant_id, entity) {
            println!("server {entity} {id}: {}", serde_json::Value::Object(record));
        }
        for record in manager.optimistic().list(entity).await {
            println!("mirror {entity} {}: {}", record.id, record.to_view());
        }
    }
    println!(
        "deliveries: {} (applied {})",
        backend.requests().len(),
        backend.applied_count()
    );

    worker.shutdown().await;
    realtime.shutdown().await;
    Ok(())
}
