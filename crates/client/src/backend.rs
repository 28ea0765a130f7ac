//! In-process backend for tests and the simulator.
//!
//! Honours the dedup contract: a repeated idempotency key returns the
//! original response and applies nothing. Faults can be scripted per request
//! and the realtime feed can be driven by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use stowage_core::TenantId;
use stowage_events::RealtimeEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{RealtimeError, TransportError};
use crate::idempotency::{IdempotencyKey, is_temp_id};
use crate::payload::Fields;
use crate::realtime::{FeedStream, RealtimeConnector};
use crate::transport::{MutationRequest, MutationResponse, SyncTransport};
use crate::types::{EntityKind, Operation};

/// A scripted outcome for the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// 503 without applying anything.
    Transient,
    /// Apply the mutation, then lose the response.
    CommitThenTimeout,
    /// 422 without applying anything.
    Reject(String),
    /// 409 without applying anything.
    Conflict(String),
    /// 401 without applying anything.
    Unauthorized,
}

#[derive(Debug, Clone)]
enum FeedFrame {
    Event(RealtimeEvent),
    Drop,
}

type RecordKey = (TenantId, EntityKind, String);

#[derive(Debug, Default)]
struct BackendState {
    records: HashMap<RecordKey, Fields>,
    responses: HashMap<IdempotencyKey, MutationResponse>,
    faults: VecDeque<Fault>,
    requests: Vec<MutationRequest>,
    next_id: u64,
    applied: usize,
    refuse_connects: u32,
    connects: usize,
    credentials: Vec<String>,
}

impl BackendState {
    fn apply(&mut self, request: &MutationRequest) -> Result<MutationResponse, TransportError> {
        if let Some(previous) = self.responses.get(&request.idempotency_key) {
            tracing::debug!(idempotency_key = %request.idempotency_key, "duplicate delivery");
            return Ok(previous.clone());
        }

        let unresolved = request.entity_id.as_deref().is_some_and(is_temp_id)
            || request.payload.string_values().into_iter().any(is_temp_id);
        if unresolved {
            return Err(TransportError::Validation(
                "request references an unresolved temp id".to_string(),
            ));
        }

        let response = match request.operation {
            Operation::Create => {
                self.next_id += 1;
                let id = format!("srv_{}", self.next_id);
                let mut record = request.payload.fields().clone();
                record.insert("id".to_string(), Value::String(id.clone()));
                self.records
                    .insert((request.tenant_id, request.entity, id.clone()), record.clone());
                MutationResponse { entity_id: id, record }
            }
            Operation::Update => {
                let id = request
                    .entity_id
                    .clone()
                    .ok_or_else(|| TransportError::Validation("update without id".to_string()))?;
                let record = self
                    .records
                    .get_mut(&(request.tenant_id, request.entity, id.clone()))
                    .ok_or_else(|| {
                        TransportError::Conflict(format!("{} {id} does not exist", request.entity))
                    })?;
                for (k, v) in request.payload.fields() {
                    record.insert(k.clone(), v.clone());
                }
                MutationResponse {
                    entity_id: id,
                    record: record.clone(),
                }
            }
        };

        self.responses
            .insert(request.idempotency_key, response.clone());
        self.applied += 1;
        Ok(response)
    }
}

#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    latency: Mutex<Duration>,
    started: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    feed: broadcast::Sender<FeedFrame>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(BackendState::default()),
            latency: Mutex::new(Duration::ZERO),
            started: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            feed,
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BackendState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Queue faults consumed by the next requests, one per request.
    pub fn push_fault(&self, fault: Fault) {
        self.with_state(|s| s.faults.push_back(fault));
    }

    /// Delay every request by `latency` before it is handled.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// Insert a record as if it had been created earlier.
    pub fn seed(&self, tenant_id: TenantId, entity: EntityKind, id: &str, mut fields: Fields) {
        fields.insert("id".to_string(), Value::String(id.to_string()));
        self.with_state(|s| {
            s.records.insert((tenant_id, entity, id.to_string()), fields);
        });
    }

    /// Delete a record behind the client's back.
    pub fn remove(&self, tenant_id: TenantId, entity: EntityKind, id: &str) {
        self.with_state(|s| {
            s.records.remove(&(tenant_id, entity, id.to_string()));
        });
    }

    pub fn record(&self, tenant_id: TenantId, entity: EntityKind, id: &str) -> Option<Fields> {
        self.with_state(|s| s.records.get(&(tenant_id, entity, id.to_string())).cloned())
    }

    /// Records of one entity type, ordered by id.
    pub fn records(&self, tenant_id: TenantId, entity: EntityKind) -> Vec<(String, Fields)> {
        let mut out: Vec<_> = self.with_state(|s| {
            s.records
                .iter()
                .filter(|((t, e, _), _)| *t == tenant_id && *e == entity)
                .map(|((_, _, id), r)| (id.clone(), r.clone()))
                .collect()
        });
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Distinct effects applied (duplicates excluded).
    pub fn applied_count(&self) -> usize {
        self.with_state(|s| s.applied)
    }

    /// Every delivery received, retries included, in arrival order.
    pub fn requests(&self) -> Vec<MutationRequest> {
        self.with_state(|s| s.requests.clone())
    }

    pub fn requests_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Highest number of requests handled at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Push a message to every open feed connection.
    pub fn publish_event(&self, event: RealtimeEvent) {
        if self.feed.send(FeedFrame::Event(event)).is_err() {
            tracing::debug!("no open feed connection; event not delivered");
        }
    }

    /// Break every open feed connection.
    pub fn drop_connections(&self) {
        if self.feed.send(FeedFrame::Drop).is_err() {
            tracing::debug!("no open feed connection to drop");
        }
    }

    /// Refuse the next `n` feed connection attempts.
    pub fn refuse_connects(&self, n: u32) {
        self.with_state(|s| s.refuse_connects = n);
    }

    pub fn connect_attempts(&self) -> usize {
        self.with_state(|s| s.connects)
    }

    pub fn open_connections(&self) -> usize {
        self.feed.receiver_count()
    }

    /// Credentials presented by feed connection attempts, in order.
    pub fn presented_credentials(&self) -> Vec<String> {
        self.with_state(|s| s.credentials.clone())
    }

    fn handle(&self, request: &MutationRequest) -> Result<MutationResponse, TransportError> {
        self.with_state(|state| {
            state.requests.push(request.clone());
            match state.faults.pop_front() {
                Some(Fault::Transient) => Err(TransportError::Server {
                    status: 503,
                    message: "service unavailable".to_string(),
                }),
                Some(Fault::Reject(message)) => Err(TransportError::Validation(message)),
                Some(Fault::Conflict(message)) => Err(TransportError::Conflict(message)),
                Some(Fault::Unauthorized) => Err(TransportError::Unauthorized),
                Some(Fault::CommitThenTimeout) => {
                    state.apply(request)?;
                    Err(TransportError::Timeout)
                }
                None => state.apply(request),
            }
        })
    }
}

#[async_trait]
impl SyncTransport for InMemoryBackend {
    async fn send(&self, request: &MutationRequest) -> Result<MutationResponse, TransportError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = self.handle(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl RealtimeConnector for InMemoryBackend {
    async fn connect(&self, tenant_id: TenantId, credential: &str) -> Result<FeedStream, RealtimeError> {
        let refused = self.with_state(|s| {
            s.connects += 1;
            s.credentials.push(credential.to_string());
            if s.refuse_connects > 0 {
                s.refuse_connects -= 1;
                true
            } else {
                false
            }
        });
        if refused {
            return Err(RealtimeError::Transport("connection refused".to_string()));
        }
        if credential.is_empty() {
            return Err(RealtimeError::Unauthorized);
        }

        tracing::debug!(tenant_id = %tenant_id, "feed connection opened");
        let rx = self.feed.subscribe();
        let feed = stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(FeedFrame::Event(event)) => return Some((Ok(event), Some(rx))),
                    // End the stream after reporting the drop.
                    Ok(FeedFrame::Drop) => {
                        return Some((
                            Err(RealtimeError::Transport("connection reset".to_string())),
                            None,
                        ));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "feed receiver lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(feed))
    }
}
