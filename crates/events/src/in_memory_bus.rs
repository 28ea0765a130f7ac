//! In-process event bus.

use std::sync::{Arc, Mutex, Weak, mpsc};

use crate::bus::{EventBus, Handler, Subscription, Unsubscribe};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

enum Sink<M> {
    Channel(mpsc::Sender<M>),
    Handler(Handler<M>),
}

struct Registry<M> {
    next_id: u64,
    sinks: Vec<(u64, Sink<M>)>,
}

impl<M> Registry<M> {
    fn register(&mut self, sink: Sink<M>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.sinks.push((id, sink));
        id
    }
}

/// In-memory fan-out bus.
///
/// - No IO, no async
/// - Channel subscribers receive clones; dead channels are pruned on publish
/// - Handlers are invoked outside the registry lock, so a handler may
///   publish or subscribe without deadlocking
pub struct InMemoryEventBus<M> {
    registry: Arc<Mutex<Registry<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered subscribers (channels and handlers).
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().map(|r| r.sinks.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                sinks: Vec::new(),
            })),
        }
    }
}

impl<M> core::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn cancel_handle<M: Send + 'static>(registry: Weak<Mutex<Registry<M>>>, id: u64) -> Unsubscribe {
    Unsubscribe::new(move || {
        if let Some(registry) = registry.upgrade() {
            if let Ok(mut r) = registry.lock() {
                r.sinks.retain(|(sid, _)| *sid != id);
            }
        }
    })
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let handlers: Vec<Handler<M>> = {
            let mut r = self.registry.lock().map_err(|_| InMemoryBusError::Poisoned)?;
            r.sinks.retain(|(_, sink)| match sink {
                Sink::Channel(tx) => tx.send(message.clone()).is_ok(),
                Sink::Handler(_) => true,
            });
            r.sinks
                .iter()
                .filter_map(|(_, sink)| match sink {
                    Sink::Handler(h) => Some(h.clone()),
                    Sink::Channel(_) => None,
                })
                .collect()
        };

        for handler in handlers {
            handler(&message);
        }
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned registry still yields a subscription; it never receives.
        let handle = match self.registry.lock() {
            Ok(mut r) => {
                let id = r.register(Sink::Channel(tx));
                cancel_handle(Arc::downgrade(&self.registry), id)
            }
            Err(_) => Unsubscribe::noop(),
        };

        Subscription::new(rx, handle)
    }

    fn subscribe_with(&self, handler: Handler<M>) -> Unsubscribe {
        match self.registry.lock() {
            Ok(mut r) => {
                let id = r.register(Sink::Handler(handler));
                cancel_handle(Arc::downgrade(&self.registry), id)
            }
            Err(_) => Unsubscribe::noop(),
        }
    }
}
