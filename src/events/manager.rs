//! Listener registry broadcasting lifecycle events.

use super::types::{DropReason, EventFilter, EventsHandle, ListenerId, SpyEvent};
use crate::stream::SubscriptionRef;
use crate::types::{NotificationKind, Value};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Internal listener state.
struct Listener {
    filter: EventFilter,
    sender: Sender<SpyEvent>,
}

impl Listener {
    /// Try to send an event. Returns false if the buffer is full or the
    /// receiver is gone (listener will be dropped).
    fn try_send(&self, event: SpyEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn wants(&self, kind: NotificationKind, subscription: &SubscriptionRef) -> bool {
        if let Some(ref kinds) = self.filter.kinds {
            if !kinds.contains(&kind) {
                return false;
            }
        }

        match self.filter.matcher {
            Some(ref matcher) => matcher.matches(subscription),
            None => true,
        }
    }
}

/// Manages listeners and broadcasts events.
pub struct EventsManager {
    /// Active listeners by ID.
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    /// Counter for generating listener IDs.
    next_id: AtomicU64,
}

impl EventsManager {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a listener and returns its receiving end.
    pub fn listen(&self, filter: EventFilter) -> EventsHandle {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(filter.buffer_size.max(1));

        self.listeners.write().insert(id, Listener { filter, sender });
        tracing::debug!(listener = id.0, "listener added");

        EventsHandle { id, receiver }
    }

    /// Removes a listener, telling it why.
    pub fn unlisten(&self, id: ListenerId) {
        self.drop_listener(id, DropReason::Unsubscribed);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Removes every listener.
    pub fn close(&self) {
        let listeners: Vec<Listener> = self.listeners.write().drain().map(|(_, l)| l).collect();
        for listener in listeners {
            let _ = listener.sender.try_send(SpyEvent::Dropped {
                reason: DropReason::SessionEnded,
            });
        }
    }

    /// Sends one lifecycle event to every interested listener. Listeners
    /// that cannot keep up are dropped.
    pub fn broadcast(
        &self,
        kind: NotificationKind,
        tick: u64,
        subscription: &SubscriptionRef,
        value: Option<&Value>,
    ) {
        let mut to_remove = Vec::new();

        {
            let listeners = self.listeners.read();
            if listeners.is_empty() {
                return;
            }
            let event = SpyEvent::Lifecycle {
                kind,
                tick,
                subscription: subscription.id(),
                observable: subscription.observable().id(),
                tag: subscription.observable().tag().map(str::to_string),
                value: value.cloned(),
            };

            for (id, listener) in listeners.iter() {
                if listener.wants(kind, subscription) && !listener.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        for id in to_remove {
            self.drop_listener(id, DropReason::BufferOverflow);
        }
    }

    fn drop_listener(&self, id: ListenerId, reason: DropReason) {
        if let Some(listener) = self.listeners.write().remove(&id) {
            tracing::debug!(listener = id.0, ?reason, "listener dropped");
            // The buffer may be full; the closed channel still ends the stream.
            let _ = listener.sender.try_send(SpyEvent::Dropped { reason });
        }
    }
}

impl Default for EventsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Observable;
    use std::panic::Location;
    use std::time::Duration;

    fn reference(tag: &str) -> SubscriptionRef {
        SubscriptionRef::new(Observable::never().with_tag(tag), Location::caller())
    }

    #[test]
    fn test_listen_unlisten() {
        let manager = EventsManager::new();

        let handle = manager.listen(EventFilter::all());
        assert_eq!(manager.listener_count(), 1);

        manager.unlisten(handle.id);
        assert_eq!(manager.listener_count(), 0);
        assert_eq!(
            handle.try_recv().unwrap(),
            SpyEvent::Dropped {
                reason: DropReason::Unsubscribed
            }
        );
    }

    #[test]
    fn test_broadcast_filters_kind_and_match() {
        let manager = EventsManager::new();
        let filter = EventFilter {
            kinds: Some(vec![NotificationKind::Next]),
            ..EventFilter::matching("people")
        };
        let handle = manager.listen(filter);

        let people = reference("people");
        let places = reference("places");
        manager.broadcast(NotificationKind::Subscribe, 1, &people, None);
        manager.broadcast(NotificationKind::Next, 2, &places, Some(&serde_json::json!(1)));
        manager.broadcast(NotificationKind::Next, 3, &people, Some(&serde_json::json!(2)));

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            SpyEvent::Lifecycle { tick, tag, value, .. } => {
                assert_eq!(tick, 3);
                assert_eq!(tag.as_deref(), Some("people"));
                assert_eq!(value, Some(serde_json::json!(2)));
            }
            other => panic!("Expected Lifecycle event, got {:?}", other),
        }
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_drop_slow_listener() {
        let manager = EventsManager::new();
        let _handle = manager.listen(EventFilter::all().with_buffer_size(2));

        let people = reference("people");
        for tick in 0..10 {
            manager.broadcast(NotificationKind::Next, tick, &people, None);
        }

        assert_eq!(manager.listener_count(), 0);
    }
}
