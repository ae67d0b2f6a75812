// In-process event bus
//
// Named events are delivered to every registered handler in registration
// order. Emission happens on the caller's task/thread, so frames from a
// single producer arrive in order.

use super::{AvailabilityProbe, EventSource, Frame, FrameHandler, Subscription};
use crate::streaming::types::StreamResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type ListenerMap = HashMap<String, Vec<(u64, FrameHandler)>>;

pub struct LocalEventBus {
    listeners: Arc<RwLock<ListenerMap>>,
    next_id: AtomicU64,
    available: AtomicBool,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Mark the producer as present or absent (drives the availability probe)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Deliver a frame to every listener of `event_name`
    ///
    /// Returns the number of handlers that received it.
    pub fn emit(&self, event_name: &str, frame: Frame) -> usize {
        // Snapshot handlers so a handler may unsubscribe without deadlocking
        let handlers: Vec<FrameHandler> = match self.listeners.read().get(event_name) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };

        for handler in &handlers {
            handler(frame.clone());
        }

        handlers.len()
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners
            .read()
            .get(event_name)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    fn remove_listener(listeners: &Weak<RwLock<ListenerMap>>, event_name: &str, id: u64) {
        let Some(listeners) = listeners.upgrade() else {
            return;
        };
        let mut map = listeners.write();
        if let Some(list) = map.get_mut(event_name) {
            list.retain(|(listener_id, _)| *listener_id != id);
            if list.is_empty() {
                map.remove(event_name);
            }
        }
        log::debug!("Listener {} removed from '{}'", id, event_name);
    }
}

#[async_trait]
impl EventSource for LocalEventBus {
    async fn subscribe(
        &self,
        event_name: &str,
        handler: FrameHandler,
    ) -> StreamResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.listeners
            .write()
            .entry(event_name.to_string())
            .or_default()
            .push((id, handler));

        log::debug!("Listener {} registered on '{}'", id, event_name);

        let listeners = Arc::downgrade(&self.listeners);
        let event_name = event_name.to_string();
        Ok(Subscription::new(id, move || {
            Self::remove_listener(&listeners, &event_name, id);
        }))
    }
}

impl AvailabilityProbe for LocalEventBus {
    fn is_source_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
