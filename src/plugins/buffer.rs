//! Detection of subscriptions that absorb more values than they emit.

use super::Plugin;
use crate::graph::GraphPlugin;
use crate::identity::Match;
use crate::session::Session;
use crate::snapshot::SnapshotPlugin;
use crate::stream::SubscriptionRef;
use crate::types::{SubscriptionId, Value};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};

/// Threshold used by [`BufferPlugin::default`].
pub const DEFAULT_BUFFER_THRESHOLD: usize = 100;

#[derive(Clone, Copy, Debug, Default)]
struct Flow {
    inflow: usize,
    outflow: usize,
}

impl Flow {
    fn buffered(&self) -> usize {
        self.inflow.saturating_sub(self.outflow)
    }
}

#[derive(Default)]
struct BufferState {
    flows: HashMap<SubscriptionId, Flow>,
    warned: HashSet<SubscriptionId>,
}

/// Compares the values a matching subscription receives from its inputs
/// with the values it emits itself.
///
/// Once the difference reaches the threshold a warning is logged for that
/// subscription, and the `buffered` query field is kept up to date from then
/// on. Needs the graph registered before it.
pub struct BufferPlugin {
    matcher: Match,
    threshold: usize,
    state: Mutex<BufferState>,
}

impl BufferPlugin {
    pub fn new(matcher: impl Into<Match>, threshold: usize) -> Self {
        Self {
            matcher: matcher.into(),
            threshold: threshold.max(1),
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Values received but not emitted so far by `id`.
    pub fn buffered(&self, id: SubscriptionId) -> usize {
        self.state.lock().flows.get(&id).map_or(0, Flow::buffered)
    }
}

impl Default for BufferPlugin {
    fn default() -> Self {
        Self::new(Match::predicate(|_, _| true), DEFAULT_BUFFER_THRESHOLD)
    }
}

impl Plugin for BufferPlugin {
    fn name(&self) -> &'static str {
        "buffer"
    }

    fn before_subscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        if self.matcher.matches(subscription) {
            self.state.lock().flows.insert(subscription.id(), Flow::default());
        }
    }

    fn before_next(&self, _: &Session, subscription: &SubscriptionRef, _: &Value) {
        if let Some(flow) = self.state.lock().flows.get_mut(&subscription.id()) {
            flow.outflow += 1;
        }
    }

    fn after_next(&self, session: &Session, subscription: &SubscriptionRef, _: &Value) {
        let Some(graph) = session.require_before::<GraphPlugin>(self, "Graph") else {
            return;
        };
        let Some(id) = graph.record(subscription.id()).and_then(|record| record.sink) else {
            return;
        };

        let (buffered, first) = {
            let mut state = self.state.lock();
            let Some(flow) = state.flows.get_mut(&id) else {
                return;
            };
            flow.inflow += 1;
            let buffered = flow.buffered();
            if buffered < self.threshold && !state.warned.contains(&id) {
                return;
            }
            (buffered, state.warned.insert(id))
        };

        if first {
            let observable = graph
                .record(id)
                .map(|record| record.subscription.observable().clone());
            let name = match observable {
                Some(observable) => match observable.tag() {
                    Some(tag) => format!("tag = {tag}"),
                    None => format!("id = {}", observable.id()),
                },
                None => format!("id = {id}"),
            };
            tracing::debug!(subscription = %id, buffered, "excessive buffering");
            session.logger().warn(&format!(
                "Excessive buffering detected; {name}; subscription = {id}; buffered = {buffered}"
            ));
        }
        if let Some(snapshot) = session.find_before::<SnapshotPlugin>(self) {
            snapshot.update_query(id, "buffered", |_| json!(buffered));
        }
    }

    fn after_unsubscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        let mut state = self.state.lock();
        state.flows.remove(&subscription.id());
        state.warned.remove(&subscription.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Retention, SpyConfig};
    use crate::logger::MemoryLogger;
    use crate::stream::{Observable, Subject, Subscriber, Teardown};
    use crate::types::Notification;
    use std::sync::Arc;

    /// Holds every value until the source completes, then emits them as one
    /// array.
    fn collect(source: Observable) -> Observable {
        Observable::new(move |subscriber: Subscriber| {
            let held = Arc::new(Mutex::new(Vec::new()));
            let downstream = subscriber.clone();
            let upstream = subscriber.subscribe(&source, move |n: Notification| match n {
                Notification::Next(value) => held.lock().push(value),
                Notification::Error(error) => downstream.error(error),
                Notification::Complete => {
                    let values = std::mem::take(&mut *held.lock());
                    downstream.next(Value::Array(values));
                    downstream.complete();
                }
            });
            Teardown::from(upstream)
        })
    }

    fn session() -> (Session, Arc<MemoryLogger>) {
        let logger = Arc::new(MemoryLogger::new());
        let session = Session::new(
            SpyConfig::default()
                .with_retention(Retention::Forever)
                .with_logger(logger.clone()),
        );
        (session, logger)
    }

    #[test]
    fn test_absorbing_subscription_is_flagged() {
        let (session, logger) = session();
        let buffer = Arc::new(BufferPlugin::new("collect", 3));
        session.plug_arc(buffer.clone());

        let subject = Subject::new();
        let collected = collect(subject.observable()).with_tag("collect");
        let subscription = session.subscribe(&collected, |_: Notification| {});
        for n in 0..5 {
            subject.next(json!(n));
        }

        let id = subscription.id().unwrap();
        assert_eq!(buffer.buffered(id), 5);
        let warnings = logger.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("tag = collect"));
        assert!(warnings[0].ends_with("buffered = 3"));

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.subscription(id).unwrap().query["buffered"], json!(5));
    }

    #[test]
    fn test_pass_through_is_not_flagged() {
        let (session, logger) = session();
        let buffer = Arc::new(BufferPlugin::new(Match::predicate(|_, _| true), 1));
        session.plug_arc(buffer.clone());

        let subject = Subject::new();
        let subscription = session.subscribe(&subject.observable().map(|v| v), |_: Notification| {});
        for n in 0..10 {
            subject.next(json!(n));
        }

        assert_eq!(buffer.buffered(subscription.id().unwrap()), 0);
        assert!(logger.warnings().is_empty());
    }

    #[test]
    fn test_requires_graph() {
        let logger = Arc::new(MemoryLogger::new());
        let session = Session::new(SpyConfig::bare().with_logger(logger.clone()));
        session.plug(BufferPlugin::default());
        session.subscribe(&Observable::of(vec![json!(1)]), |_: Notification| {});
        assert!(logger.contains("Graph plugin not found"));
    }
}
