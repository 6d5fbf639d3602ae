use super::manager::EventsManager;
use super::types::{EventFilter, EventsHandle, ListenerId};
use crate::plugins::Plugin;
use crate::session::Session;
use crate::stream::SubscriptionRef;
use crate::types::{NotificationKind, Value};

/// Publishes every lifecycle event to the registered listeners.
#[derive(Default)]
pub struct EventsPlugin {
    manager: EventsManager,
}

impl EventsPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, filter: EventFilter) -> EventsHandle {
        self.manager.listen(filter)
    }

    pub fn unlisten(&self, id: ListenerId) {
        self.manager.unlisten(id);
    }

    pub fn listener_count(&self) -> usize {
        self.manager.listener_count()
    }
}

impl Plugin for EventsPlugin {
    fn name(&self) -> &'static str {
        "events"
    }

    fn before_subscribe(&self, session: &Session, subscription: &SubscriptionRef) {
        self.manager
            .broadcast(NotificationKind::Subscribe, session.tick(), subscription, None);
    }

    fn before_next(&self, session: &Session, subscription: &SubscriptionRef, value: &Value) {
        self.manager
            .broadcast(NotificationKind::Next, session.tick(), subscription, Some(value));
    }

    fn before_error(&self, session: &Session, subscription: &SubscriptionRef, error: &Value) {
        self.manager
            .broadcast(NotificationKind::Error, session.tick(), subscription, Some(error));
    }

    fn before_complete(&self, session: &Session, subscription: &SubscriptionRef) {
        self.manager
            .broadcast(NotificationKind::Complete, session.tick(), subscription, None);
    }

    fn before_unsubscribe(&self, session: &Session, subscription: &SubscriptionRef) {
        self.manager
            .broadcast(NotificationKind::Unsubscribe, session.tick(), subscription, None);
    }

    fn teardown(&self) {
        self.manager.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpyConfig;
    use crate::events::{DropReason, SpyEvent};
    use crate::stream::Observable;
    use crate::types::Notification;
    use serde_json::json;

    #[test]
    fn test_session_events_in_tick_order() {
        let session = Session::new(SpyConfig::bare());
        let handle = session.events(EventFilter::all());

        session.subscribe(&Observable::of(vec![json!(1)]), |_: Notification| {});

        let kinds: Vec<(NotificationKind, u64)> = handle
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                SpyEvent::Lifecycle { kind, tick, .. } => Some((kind, tick)),
                SpyEvent::Dropped { .. } => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (NotificationKind::Subscribe, 1),
                (NotificationKind::Next, 2),
                (NotificationKind::Complete, 3),
                (NotificationKind::Unsubscribe, 4),
            ]
        );
    }

    #[test]
    fn test_listeners_share_one_plugin_and_end_with_session() {
        let session = Session::new(SpyConfig::bare());
        let first = session.events(EventFilter::all());
        let _second = session.events(EventFilter::kinds(vec![NotificationKind::Error]));
        assert_eq!(session.find::<EventsPlugin>().unwrap().listener_count(), 2);

        session.teardown();
        assert_eq!(
            first.drain(),
            vec![SpyEvent::Dropped {
                reason: DropReason::SessionEnded
            }]
        );
    }
}
