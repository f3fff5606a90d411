use crate::message::SubscribeCode;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// A component sharing the broker connection.
///
/// Every hook defaults to doing nothing, so implementors only override what they care
/// about. Hooks are never called while the connection's internal lock is held: they may
/// call back into the connection freely. Hooks for one connection are delivered one at a
/// time, in the order of the state changes behind them.
pub trait Consumer: Send + Sync {
    /// Stable identifier; registering another consumer with the same id replaces it.
    fn id(&self) -> &str;

    fn on_connect(&self) {}

    fn on_disconnect(&self) {}

    fn on_reconnecting(&self) {}

    /// Outcome of a wire subscription on a filter this consumer holds an entry for,
    /// matched by ref key. Called on success too, with the granted QoS.
    fn on_subscribe_ack(&self, _code: SubscribeCode) {}
}

struct Registration {
    consumer: Weak<dyn Consumer>,
    /// Has been sent `on_connect` and not yet the matching `on_disconnect`.
    connected: bool,
}

/// Consumers currently using the connection, by id.
///
/// Only weak references are kept: the caller owns its consumer and may drop it at any
/// time. A dropped consumer still counts until it is deregistered, it just stops
/// receiving hooks.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: BTreeMap<String, Registration>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the consumer. Returns true when it is the first one.
    pub fn insert(&mut self, consumer: &Arc<dyn Consumer>) -> bool {
        let first = self.consumers.is_empty();
        self.consumers.insert(
            consumer.id().to_string(),
            Registration {
                consumer: Arc::downgrade(consumer),
                connected: false,
            },
        );
        first
    }

    /// Removes by id. Returns false if it wasn't registered.
    pub fn remove(&mut self, id: &str) -> bool {
        self.consumers.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers.get(id).and_then(|registration| registration.consumer.upgrade())
    }

    /// Flags one consumer as connected. Returns it only if it wasn't already, i.e. when
    /// it is owed an `on_connect`.
    pub fn mark_connected(&mut self, id: &str) -> Option<Arc<dyn Consumer>> {
        let registration = self.consumers.get_mut(id)?;
        if registration.connected {
            return None;
        }
        registration.connected = true;
        registration.consumer.upgrade()
    }

    /// Flags every consumer as connected and returns the live ones owed an `on_connect`.
    pub fn mark_all_connected(&mut self) -> Vec<Arc<dyn Consumer>> {
        self.mark_all(true)
    }

    /// Clears every connected flag and returns the live consumers owed an
    /// `on_disconnect`.
    pub fn mark_all_disconnected(&mut self) -> Vec<Arc<dyn Consumer>> {
        self.mark_all(false)
    }

    fn mark_all(&mut self, connected: bool) -> Vec<Arc<dyn Consumer>> {
        let mut changed = Vec::new();
        for registration in self.consumers.values_mut() {
            if registration.connected == connected {
                continue;
            }
            registration.connected = connected;
            if let Some(consumer) = registration.consumer.upgrade() {
                changed.push(consumer);
            }
        }
        changed
    }

    /// Live consumers, for invoking hooks after the lock is released.
    pub fn snapshot(&self) -> Vec<Arc<dyn Consumer>> {
        self.consumers
            .values()
            .filter_map(|registration| registration.consumer.upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
