//! Typed publish/subscribe abstraction (mechanics only).
//!
//! The bus distributes messages to every live subscriber. Subscribers are
//! either a channel ([`Subscription`], pulled by the consumer) or a callback
//! ([`Handler`], pushed synchronously from `publish`). Both forms hand back a
//! cancellation handle: dropping it, or calling `unsubscribe`, removes the
//! subscriber from the bus.
//!
//! ## Delivery
//!
//! - Messages are delivered in publish order to each subscriber.
//! - No persistence: a subscriber only sees messages published while it is
//!   registered.
//! - Handlers run on the publishing task and must not block.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Callback subscriber.
pub type Handler<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Cancellation handle returned by every subscription.
///
/// Dropping the handle unsubscribes. Use [`Unsubscribe::detach`] to keep a
/// subscription alive for the lifetime of the bus.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct Unsubscribe {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle that cancels nothing.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Remove the subscriber now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the subscriber registered after this handle is gone.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl core::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A pulled subscription to a bus.
///
/// Single consumer. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
    handle: Unsubscribe,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>, handle: Unsubscribe) -> Self {
        Self { receiver, handle }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything published so far and not yet received.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }

    pub fn unsubscribe(self) {
        self.handle.unsubscribe();
    }
}

/// Transport-agnostic typed pub/sub.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;

    fn subscribe_with(&self, handler: Handler<M>) -> Unsubscribe;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }

    fn subscribe_with(&self, handler: Handler<M>) -> Unsubscribe {
        (**self).subscribe_with(handler)
    }
}
