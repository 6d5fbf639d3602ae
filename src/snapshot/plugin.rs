//! Per-subscription capture and two-pass snapshot construction.

use super::types::{
    ObservableSnapshot, Snapshot, SnapshotOptions, SnapshotRecord, SubscriberSnapshot,
    SubscriptionSnapshot, ValueSnapshot,
};
use crate::graph::{FlushWatch, GraphPlugin};
use crate::plugins::{Plugin, StackTracePlugin};
use crate::session::Session;
use crate::stream::SubscriptionRef;
use crate::types::{SubscriptionId, Timestamp, Value};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Captures timestamps, a bounded value history and the error of every
/// subscription, and builds [`Snapshot`]s from the graph.
///
/// Records live as long as the graph holds their subscription. Without a
/// graph registered before it, a record is dropped on unsubscribe.
pub struct SnapshotPlugin {
    kept_values: usize,
    records: Arc<Mutex<HashMap<SubscriptionId, SnapshotRecord>>>,
    flushes: FlushWatch,
}

impl SnapshotPlugin {
    pub fn new(kept_values: usize) -> Self {
        Self {
            kept_values,
            records: Arc::new(Mutex::new(HashMap::new())),
            flushes: FlushWatch::new(),
        }
    }

    /// Number of captured subscriptions.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn record(&self, id: SubscriptionId) -> Option<SnapshotRecord> {
        self.records.lock().get(&id).cloned()
    }

    /// Sets a query extension field on a subscription's record.
    pub fn set_query(&self, id: SubscriptionId, key: &str, value: Value) {
        if let Some(record) = self.records.lock().get_mut(&id) {
            record.query.insert(key.to_string(), value);
        }
    }

    /// Replaces a query extension field with `update(current)`.
    pub fn update_query<F>(&self, id: SubscriptionId, key: &str, update: F)
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        if let Some(record) = self.records.lock().get_mut(&id) {
            let value = update(record.query.get(key));
            record.query.insert(key.to_string(), value);
        }
    }

    fn update<F>(&self, session: &Session, subscription: &SubscriptionRef, f: F)
    where
        F: FnOnce(&mut SnapshotRecord, Timestamp),
    {
        if let Some(record) = self.records.lock().get_mut(&subscription.id()) {
            record.tick = session.tick();
            f(record, Timestamp::now());
        }
    }

    /// Builds a snapshot of every subscription reachable in the graph.
    ///
    /// Nodes are built first and linked second, because a sink may be
    /// visited before or after its sources. Records the graph no longer
    /// holds are dropped from the capture table.
    pub fn snapshot_all(&self, session: &Session, options: SnapshotOptions) -> Snapshot {
        let mut snapshot = Snapshot {
            tick: session.tick(),
            ..Snapshot::default()
        };

        let Some(graph) = session.require_before::<GraphPlugin>(self, "Graph") else {
            return snapshot;
        };
        let stack = session.require_before::<StackTracePlugin>(self, "Stack trace");

        let reachable = graph.reachable();
        let ids: HashSet<SubscriptionId> = reachable.iter().map(|record| record.id()).collect();

        {
            let mut records = self.records.lock();
            records.retain(|id, _| ids.contains(id));

            for node in &reachable {
                let reference = &node.subscription;
                let captured = records
                    .get(&node.id())
                    .cloned()
                    .unwrap_or_else(|| SnapshotRecord::new(0));
                let values: Vec<ValueSnapshot> = captured.values.iter().cloned().collect();

                let observable = reference.observable();
                let entry = snapshot
                    .observables
                    .entry(observable.id())
                    .or_insert_with(|| ObservableSnapshot {
                        id: observable.id(),
                        tag: observable.tag().map(str::to_string),
                        kind: observable.kind(),
                        site: observable.site().clone(),
                        subscriptions: BTreeSet::new(),
                        values: Vec::new(),
                        values_flushed: 0,
                        tick: 0,
                        handle: observable.downgrade(),
                    });
                entry.subscriptions.insert(node.id());
                entry.values.extend(values.iter().cloned());
                entry.values_flushed += captured.values_flushed;
                entry.tick = entry.tick.max(captured.tick);

                let entry = snapshot
                    .subscribers
                    .entry(reference.subscriber())
                    .or_insert_with(|| SubscriberSnapshot {
                        id: reference.subscriber(),
                        subscriptions: BTreeSet::new(),
                        values: Vec::new(),
                        values_flushed: 0,
                        tick: 0,
                    });
                entry.subscriptions.insert(node.id());
                entry.values.extend(values.iter().cloned());
                entry.values_flushed += captured.values_flushed;
                entry.tick = entry.tick.max(captured.tick);

                snapshot.subscriptions.insert(
                    node.id(),
                    SubscriptionSnapshot {
                        id: node.id(),
                        observable: observable.id(),
                        subscriber: reference.subscriber(),
                        tick: captured.tick,
                        subscribed_at: captured.subscribed_at,
                        next_at: captured.next_at,
                        completed_at: captured.completed_at,
                        errored_at: captured.errored_at,
                        unsubscribed_at: captured.unsubscribed_at,
                        next_count: captured.next_count,
                        values,
                        values_flushed: captured.values_flushed,
                        error: captured.error,
                        query: captured.query,
                        stack_trace: stack.as_ref().and_then(|stack| stack.trace(node.id())),
                        depth: node.depth,
                        flattened: node.flattened,
                        sink: None,
                        root_sink: None,
                        sources: Vec::new(),
                        flattenings: Vec::new(),
                        flushed_sources: node.flushed_sources,
                        flushed_flattenings: node.flushed_flattenings,
                    },
                );
            }
        }

        if let Some(stack) = &stack {
            stack.retain(&ids);
        }

        for node in &reachable {
            let present = |id: &SubscriptionId| snapshot.subscriptions.contains_key(id);
            let sink = node.sink.filter(present);
            let root_sink = node.root_sink.filter(present);
            let sources: Vec<_> = node.sources.iter().copied().filter(present).collect();
            let flattenings: Vec<_> = node.flattenings.iter().copied().filter(present).collect();

            if let Some(linked) = snapshot.subscriptions.get_mut(&node.id()) {
                linked.sink = sink;
                linked.root_sink = root_sink;
                linked.sources = sources;
                linked.flattenings = flattenings;
            }
        }

        for observable in snapshot.observables.values_mut() {
            observable.values.sort_by_key(|value| value.tick);
        }
        for subscriber in snapshot.subscribers.values_mut() {
            subscriber.values.sort_by_key(|value| value.tick);
        }

        if let Some(since) = options.since {
            snapshot.prune(since);
        }

        tracing::debug!(
            tick = snapshot.tick,
            subscriptions = snapshot.subscriptions.len(),
            "snapshot"
        );
        snapshot
    }
}

impl Plugin for SnapshotPlugin {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn before_subscribe(&self, session: &Session, subscription: &SubscriptionRef) {
        if !self.flushes.is_watching() {
            self.flushes
                .watch(session.find_before::<GraphPlugin>(self), &self.records);
        }
        self.records
            .lock()
            .insert(subscription.id(), SnapshotRecord::new(session.tick()));
    }

    fn before_next(&self, session: &Session, subscription: &SubscriptionRef, value: &Value) {
        let kept = self.kept_values;
        let tick = session.tick();
        self.update(session, subscription, |record, now| {
            record.next_at = Some(now);
            record.next_count += 1;
            record.values.push_back(ValueSnapshot {
                tick,
                timestamp: now,
                value: value.clone(),
            });
            while record.values.len() > kept {
                record.values.pop_front();
                record.values_flushed += 1;
            }
        });
    }

    fn before_error(&self, session: &Session, subscription: &SubscriptionRef, error: &Value) {
        self.update(session, subscription, |record, now| {
            record.errored_at = Some(now);
            record.error = Some(error.clone());
        });
    }

    fn before_complete(&self, session: &Session, subscription: &SubscriptionRef) {
        self.update(session, subscription, |record, now| {
            record.completed_at = Some(now);
        });
    }

    fn before_unsubscribe(&self, session: &Session, subscription: &SubscriptionRef) {
        self.update(session, subscription, |record, now| {
            record.unsubscribed_at = Some(now);
        });
    }

    fn after_unsubscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        if !self.flushes.is_watching() {
            self.records.lock().remove(&subscription.id());
        }
    }

    fn teardown(&self) {
        self.records.lock().clear();
        self.flushes.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Retention, SpyConfig};
    use crate::identity::Match;
    use crate::scheduler::ManualScheduler;
    use crate::stream::{Observable, Subject, Subscriber, Teardown};
    use crate::types::Notification;
    use serde_json::json;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(SpyConfig::default().with_retention(Retention::Forever))
    }

    #[test]
    fn test_value_ring_is_bounded() {
        let session = Session::new(
            SpyConfig::default()
                .with_retention(Retention::Forever)
                .with_kept_values(2),
        );
        let subject = Subject::new();
        let subscription = session.subscribe(&subject.observable(), |_: Notification| {});
        for n in 0..5 {
            subject.next(json!(n));
        }

        let snapshot = session.snapshot().unwrap();
        let captured = snapshot.subscription(subscription.id().unwrap()).unwrap();
        assert_eq!(captured.next_count, 5);
        assert_eq!(captured.values_flushed, 3);
        let values: Vec<&Value> = captured.values.iter().map(|v| &v.value).collect();
        assert_eq!(values, vec![&json!(3), &json!(4)]);
    }

    #[test]
    fn test_snapshot_is_detached_from_live_state() {
        let session = session();
        let subject = Subject::new();
        let subscription = session.subscribe(&subject.observable(), |_: Notification| {});
        let id = subscription.id().unwrap();

        let before = session.snapshot().unwrap();
        subject.next(json!("later"));
        subscription.unsubscribe();

        let captured = before.subscription(id).unwrap();
        assert_eq!(captured.next_count, 0);
        assert!(captured.unsubscribed_at.is_none());

        let after = session.snapshot().unwrap();
        assert_eq!(after.subscription(id).unwrap().next_count, 1);
        assert!(after.subscription(id).unwrap().is_unsubscribed());
    }

    #[test]
    fn test_links_and_aggregates() {
        let session = session();
        let source = Observable::never().with_tag("source");
        let mapped = source.map(|v| v).with_tag("mapped");
        let subscription = session.subscribe(&mapped, |_: Notification| {});

        let snapshot = session.snapshot().unwrap();
        let root = snapshot.subscription(subscription.id().unwrap()).unwrap();
        assert_eq!(root.sources.len(), 1);

        let inner = snapshot.subscription(root.sources[0]).unwrap();
        assert_eq!(inner.sink, Some(root.id));
        assert_eq!(inner.root_sink, Some(root.id));
        assert!(inner.stack_trace.is_some());

        let observable = snapshot.observable(source.id()).unwrap();
        assert_eq!(observable.tag.as_deref(), Some("source"));
        assert!(observable.subscriptions.contains(&inner.id));
        assert_eq!(snapshot.root_subscriptions().len(), 1);
    }

    #[test]
    fn test_since_prunes_untouched_entries() {
        let session = session();
        let quiet = session.subscribe(&Observable::never(), |_: Notification| {});
        let subject = Subject::new();
        let busy = session.subscribe(&subject.observable(), |_: Notification| {});

        let mark = session.tick();
        subject.next(json!(1));

        let delta = session.snapshot_with(SnapshotOptions::since(mark)).unwrap();
        assert!(delta.subscription(busy.id().unwrap()).is_some());
        assert!(delta.subscription(quiet.id().unwrap()).is_none());
        assert_eq!(delta.observables.len(), 1);
    }

    #[test]
    fn test_flushed_subscriptions_release_their_records() {
        let session = Session::new(SpyConfig::default().with_retention(Retention::Immediate));
        let ids: Vec<SubscriptionId> = (0..1000)
            .map(|_| {
                let subscription = session.subscribe(&Observable::never(), |_: Notification| {});
                let id = subscription.id().unwrap();
                subscription.unsubscribe();
                id
            })
            .collect();

        let graph = session.find::<GraphPlugin>().unwrap();
        let snapshots = session.find::<SnapshotPlugin>().unwrap();
        let stack = session.find::<StackTracePlugin>().unwrap();
        assert!(graph.is_empty());
        assert!(snapshots.is_empty());
        assert!(stack.is_empty());
        assert!(ids.iter().all(|id| snapshots.record(*id).is_none()));
    }

    #[test]
    fn test_timed_flush_releases_records_when_the_timer_fires() {
        let scheduler = Arc::new(ManualScheduler::new());
        let session = Session::new(
            SpyConfig::default()
                .with_retention(Retention::For(Duration::from_millis(10)))
                .with_scheduler(scheduler.clone()),
        );
        let source = Observable::never();
        let subscription = session.subscribe(&source.map(|v| v), |_: Notification| {});
        let id = subscription.id().unwrap();
        subscription.unsubscribe();

        let snapshots = session.find::<SnapshotPlugin>().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.record(id).is_some());

        scheduler.advance(Duration::from_millis(10));
        assert!(snapshots.is_empty());
        assert!(session.find::<StackTracePlugin>().unwrap().is_empty());
    }

    #[test]
    fn test_records_without_a_graph_end_at_unsubscribe() {
        let session = Session::new(SpyConfig::bare());
        let snapshots = Arc::new(SnapshotPlugin::new(4));
        session.plug_arc(snapshots.clone());

        let subscription = session.subscribe(&Observable::never(), |_: Notification| {});
        assert_eq!(snapshots.len(), 1);
        subscription.unsubscribe();
        assert!(snapshots.is_empty());
    }

    #[test]
    fn test_held_snapshot_does_not_keep_producers_alive() {
        let session = Session::new(SpyConfig::default().with_retention(Retention::Immediate));
        let token = Arc::new(());
        let held = Arc::clone(&token);
        let observable = Observable::new(move |_: Subscriber| {
            let _ = &held;
            Teardown::Empty
        })
        .with_tag("held");
        let subscription = session.subscribe(&observable, |_: Notification| {});

        let snapshot = session.snapshot().unwrap();
        assert!(snapshot.find_subscription(&Match::from(&observable)).is_some());

        subscription.unsubscribe();
        drop(subscription);
        drop(observable);
        assert_eq!(Arc::strong_count(&token), 1);

        assert!(snapshot.find_subscription(&Match::from("held")).is_some());
        assert!(snapshot
            .find_subscription(&Match::predicate(|_, _| true))
            .is_none());
    }

    #[test]
    fn test_missing_graph_degrades() {
        let logger = std::sync::Arc::new(crate::logger::MemoryLogger::new());
        let session = Session::new(SpyConfig::bare().with_logger(logger.clone()));
        session.plug(SnapshotPlugin::new(4));

        let snapshot = session.snapshot().unwrap();
        assert!(snapshot.subscriptions.is_empty());
        assert!(logger.contains("Graph plugin not found"));
    }
}
