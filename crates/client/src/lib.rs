//! `stowage-client`
//!
//! **Responsibility:** Offline-first write path for the inventory client.
//!
//! This crate provides:
//! - A durable mutation queue with idempotency keys and dependency tracking
//! - An optimistic local mirror that reflects queued writes immediately
//! - Ordered, retrying delivery to the backend (`SyncManager`)
//! - The realtime push feed, reconciled against unconfirmed local edits
//!
//! The backend stays the authority: every queued write is replayed against
//! it, and its response replaces the optimistic record.

pub mod backend;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod offline;
pub mod optimistic;
pub mod payload;
pub mod queue;
pub mod realtime;
pub mod resolver;
pub mod session;
pub mod sqlite_store;
pub mod sse;
pub mod store;
pub mod sync_manager;
pub mod sync_worker;
pub mod transport;
pub mod types;

pub use backend::{Fault, InMemoryBackend};
pub use config::{ReconnectBackoff, ReconnectPolicy, RetryPolicy, SyncConfig};
pub use error::{QueueError, RealtimeError, SessionError, StoreError, SyncError, TransportError};
pub use idempotency::{IdempotencyKey, IdempotencyKeyGenerator};
pub use offline::{Connectivity, ConnectivityState};
pub use optimistic::{OptimisticRecord, OptimisticStore};
pub use payload::EntityPayload;
pub use queue::{MutationQueue, NewMutation};
pub use realtime::{RealtimeConnector, RealtimeEventBroadcaster, RealtimeStatus};
pub use session::{SessionProvider, StaticSession};
pub use sqlite_store::SqliteStore;
pub use sse::SseConnector;
pub use store::{InMemoryStore, LocalStore};
pub use sync_manager::{DrainOutcome, DrainReport, SyncEvent, SyncManager};
pub use sync_worker::{SyncWorker, SyncWorkerHandle};
pub use transport::{HttpTransport, SyncTransport};
pub use types::{EntityKind, FailureKind, MutationEntry, MutationStatus, Operation, SyncState};
