//! `stowage-events`
//!
//! Typed publish/subscribe plumbing and the realtime feed envelope.

pub mod bus;
pub mod in_memory_bus;
pub mod realtime;
pub mod tenant;

pub use bus::{EventBus, Handler, Subscription, Unsubscribe};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use realtime::{RealtimeAction, RealtimeEvent};
pub use tenant::TenantScoped;
