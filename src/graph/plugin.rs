//! Reconstructs sink/source/flattening relations from hook order.

use super::types::{Frame, GraphRecord};
use crate::config::Retention;
use crate::identity::Match;
use crate::plugins::Plugin;
use crate::scheduler::{Scheduler, TimerId};
use crate::session::Session;
use crate::stream::SubscriptionRef;
use crate::types::{SubscriptionId, Value};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type FlushListener = Box<dyn Fn(&[SubscriptionId]) + Send + Sync>;

#[derive(Default)]
struct GraphState {
    stack: Vec<Frame>,
    records: HashMap<SubscriptionId, GraphRecord>,
    /// Children of the sentinel, in subscribe order.
    roots: Vec<SubscriptionId>,
    flushed_roots: usize,
    timers: HashMap<SubscriptionId, TimerId>,
}

struct GraphInner {
    retention: Retention,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<GraphState>,
    listeners: Mutex<Vec<FlushListener>>,
}

/// Tracks the live subscription graph.
///
/// Nothing tells the graph who subscribed to whom. A subscription made while
/// another subscription's subscribe frame is open is its source; one made
/// while a value is being delivered is a flattening of the receiver's sink.
pub struct GraphPlugin {
    inner: Arc<GraphInner>,
}

impl GraphPlugin {
    pub fn new(retention: Retention, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                retention,
                scheduler,
                state: Mutex::new(GraphState::default()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn retention(&self) -> Retention {
        self.inner.retention
    }

    pub fn record(&self, id: SubscriptionId) -> Option<GraphRecord> {
        self.inner.state.lock().records.get(&id).cloned()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.inner.state.lock().records.contains_key(&id)
    }

    /// Number of subscriptions the graph holds.
    pub fn len(&self) -> usize {
        self.inner.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Roots flushed from the sentinel so far.
    pub fn flushed_roots(&self) -> usize {
        self.inner.state.lock().flushed_roots
    }

    /// The sentinel's children.
    pub fn find_root_subscriptions(&self) -> Vec<SubscriptionRef> {
        let state = self.inner.state.lock();
        state
            .roots
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(|record| record.subscription.clone())
            .collect()
    }

    /// Depth-first search from the sentinel, sources before flattenings.
    /// The first match wins.
    pub fn find_subscription(&self, matcher: &Match) -> Option<SubscriptionRef> {
        let state = self.inner.state.lock();
        let mut stack: Vec<SubscriptionId> = state.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let Some(record) = state.records.get(&id) else {
                continue;
            };
            if matcher.matches(&record.subscription) {
                return Some(record.subscription.clone());
            }
            let children: Vec<SubscriptionId> = record.children().collect();
            stack.extend(children.into_iter().rev());
        }
        None
    }

    /// Calls `listener` with the ids of every flushed subtree, after the
    /// graph lock is released.
    pub fn on_flush<F>(&self, listener: F)
    where
        F: Fn(&[SubscriptionId]) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    /// Every subscription reachable from the sentinel, depth first.
    pub fn reachable(&self) -> Vec<GraphRecord> {
        let state = self.inner.state.lock();
        let mut out = Vec::with_capacity(state.records.len());
        let mut seen = HashSet::new();
        let mut stack: Vec<SubscriptionId> = state.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(record) = state.records.get(&id) else {
                continue;
            };
            let children: Vec<SubscriptionId> = record.children().collect();
            stack.extend(children.into_iter().rev());
            out.push(record.clone());
        }
        out
    }
}

/// Keeps a per-subscription table in step with the graph: once watching,
/// entries are removed as the graph flushes their subscriptions.
pub(crate) struct FlushWatch {
    watching: AtomicBool,
}

impl FlushWatch {
    pub(crate) fn new() -> Self {
        Self {
            watching: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    /// Registers `table` with `graph` the first time a graph is given.
    pub(crate) fn watch<V>(
        &self,
        graph: Option<Arc<GraphPlugin>>,
        table: &Arc<Mutex<HashMap<SubscriptionId, V>>>,
    ) where
        V: Send + 'static,
    {
        let Some(graph) = graph else {
            return;
        };
        if self.watching.swap(true, Ordering::AcqRel) {
            return;
        }
        let table = Arc::downgrade(table);
        graph.on_flush(move |flushed| {
            if let Some(table) = table.upgrade() {
                let mut table = table.lock();
                for id in flushed {
                    table.remove(id);
                }
            }
        });
    }

    pub(crate) fn reset(&self) {
        self.watching.store(false, Ordering::Release);
    }
}

impl GraphInner {
    fn attach(state: &mut GraphState, subscription: &SubscriptionRef) {
        let id = subscription.id();
        let mut record = GraphRecord::new(subscription.clone());

        let attached = match state.stack.last().copied() {
            Some(Frame::Next(receiver)) => {
                let sink = state.records.get(&receiver).and_then(|r| r.sink);
                match sink.and_then(|sink| state.records.get_mut(&sink)) {
                    Some(sink) => {
                        sink.flattenings.push(id);
                        record.sink = Some(sink.id());
                        record.root_sink = Some(sink.root_sink.unwrap_or(sink.id()));
                        record.depth = sink.depth;
                        record.flattened = true;
                        true
                    }
                    None => false,
                }
            }
            _ => {
                let parent = state.stack.iter().rev().find_map(|frame| match frame {
                    Frame::Subscribe(parent) if state.records.contains_key(parent) => Some(*parent),
                    _ => None,
                });
                match parent.and_then(|parent| state.records.get_mut(&parent)) {
                    Some(parent) => {
                        parent.sources.push(id);
                        record.sink = Some(parent.id());
                        record.root_sink = Some(parent.root_sink.unwrap_or(parent.id()));
                        record.depth = parent.depth + 1;
                        true
                    }
                    None => false,
                }
            }
        };

        if !attached {
            state.roots.push(id);
        }

        tracing::trace!(
            subscription = %id,
            sink = ?record.sink,
            depth = record.depth,
            flattened = record.flattened,
            "graph attach"
        );
        state.records.insert(id, record);
    }

    fn pop(state: &mut GraphState, frame: Frame) {
        match state.stack.iter().rposition(|f| *f == frame) {
            Some(position) => {
                state.stack.remove(position);
            }
            None => tracing::debug!(?frame, "graph frame missing"),
        }
    }

    /// Whether `id` and every direct input are closed.
    fn quiescent(state: &GraphState, id: SubscriptionId) -> bool {
        state.records.get(&id).is_some_and(|record| {
            record.unsubscribed
                && record.children().all(|child| {
                    state
                        .records
                        .get(&child)
                        .map_or(true, |child| child.unsubscribed)
                })
        })
    }

    fn notify(&self, flushed: &[SubscriptionId]) {
        if flushed.is_empty() {
            return;
        }
        for listener in self.listeners.lock().iter() {
            listener(flushed);
        }
    }

    /// Flushes `id` now or arms its retention timer. Returns the ids
    /// flushed now.
    fn try_flush(inner: &Arc<Self>, state: &mut GraphState, id: SubscriptionId) -> Vec<SubscriptionId> {
        if !Self::quiescent(state, id) {
            return Vec::new();
        }
        match inner.retention {
            Retention::Immediate => return Self::flush(inner, state, id),
            Retention::For(delay) => {
                if !state.timers.contains_key(&id) {
                    let weak: Weak<Self> = Arc::downgrade(inner);
                    let timer = inner.scheduler.schedule(
                        delay,
                        Box::new(move || {
                            if let Some(inner) = weak.upgrade() {
                                let flushed = {
                                    let mut state = inner.state.lock();
                                    state.timers.remove(&id);
                                    Self::flush(&inner, &mut state, id)
                                };
                                inner.notify(&flushed);
                            }
                        }),
                    );
                    state.timers.insert(id, timer);
                }
            }
            Retention::Forever => {}
        }
        Vec::new()
    }

    /// Detaches `id` from its parent and drops its whole subtree. Returns
    /// the dropped ids.
    fn flush(inner: &Arc<Self>, state: &mut GraphState, id: SubscriptionId) -> Vec<SubscriptionId> {
        let Some(record) = state.records.get(&id) else {
            return Vec::new();
        };
        let (sink, flattened) = (record.sink, record.flattened);

        match sink.and_then(|sink| state.records.get_mut(&sink)) {
            Some(parent) if flattened => {
                parent.flattenings.retain(|child| *child != id);
                parent.flushed_flattenings += 1;
            }
            Some(parent) => {
                parent.sources.retain(|child| *child != id);
                parent.flushed_sources += 1;
            }
            None => {
                if let Some(position) = state.roots.iter().position(|root| *root == id) {
                    state.roots.remove(position);
                    state.flushed_roots += 1;
                }
            }
        }

        let mut pending = vec![id];
        let mut flushed = Vec::new();
        while let Some(id) = pending.pop() {
            if let Some(timer) = state.timers.remove(&id) {
                inner.scheduler.cancel(timer);
            }
            if let Some(record) = state.records.remove(&id) {
                pending.extend(record.children());
                flushed.push(id);
            }
        }
        tracing::trace!(subscription = %id, count = flushed.len(), "graph flush");
        flushed
    }
}

impl Plugin for GraphPlugin {
    fn name(&self) -> &'static str {
        "graph"
    }

    fn before_subscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        let mut state = self.inner.state.lock();
        GraphInner::attach(&mut state, subscription);
        state.stack.push(Frame::Subscribe(subscription.id()));
    }

    fn after_subscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        let mut state = self.inner.state.lock();
        GraphInner::pop(&mut state, Frame::Subscribe(subscription.id()));
    }

    fn before_next(&self, _: &Session, subscription: &SubscriptionRef, _: &Value) {
        self.inner
            .state
            .lock()
            .stack
            .push(Frame::Next(subscription.id()));
    }

    fn after_next(&self, _: &Session, subscription: &SubscriptionRef, _: &Value) {
        let mut state = self.inner.state.lock();
        GraphInner::pop(&mut state, Frame::Next(subscription.id()));
    }

    fn after_unsubscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        let id = subscription.id();
        let flushed = {
            let mut state = self.inner.state.lock();
            let sink = match state.records.get_mut(&id) {
                Some(record) => {
                    record.unsubscribed = true;
                    record.sink
                }
                None => return,
            };

            let mut flushed = GraphInner::try_flush(&self.inner, &mut state, id);
            if let Some(sink) = sink {
                flushed.extend(GraphInner::try_flush(&self.inner, &mut state, sink));
            }
            flushed
        };
        self.inner.notify(&flushed);
    }

    fn teardown(&self) {
        let mut state = self.inner.state.lock();
        for (_, timer) in state.timers.drain() {
            self.inner.scheduler.cancel(timer);
        }
        *state = GraphState::default();
        self.inner.listeners.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpyConfig;
    use crate::scheduler::ManualScheduler;
    use crate::stream::{Observable, Teardown};
    use crate::types::Notification;
    use serde_json::json;
    use std::time::Duration;

    fn session(retention: Retention) -> (Session, Arc<GraphPlugin>, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let session = Session::new(SpyConfig::bare().with_scheduler(scheduler.clone()));
        let graph = Arc::new(GraphPlugin::new(retention, scheduler.clone()));
        session.plug_arc(graph.clone());
        (session, graph, scheduler)
    }

    #[test]
    fn test_operator_chain_builds_sources() {
        let (session, graph, _) = session(Retention::Forever);
        let source = Observable::never();
        let mapped = source.map(|v| v).filter(|_| true);

        let subscription = session.subscribe(&mapped, |_: Notification| {});
        let root = graph.record(subscription.id().unwrap()).unwrap();
        assert!(root.is_root());
        assert_eq!(root.depth, 1);
        assert_eq!(root.sources.len(), 1);

        let map = graph.record(root.sources[0]).unwrap();
        assert_eq!(map.sink, Some(root.id()));
        assert_eq!(map.root_sink, Some(root.id()));
        assert_eq!(map.depth, 2);

        let never = graph.record(map.sources[0]).unwrap();
        assert_eq!(never.depth, 3);
        assert_eq!(never.root_sink, Some(root.id()));
        assert!(never.sources.is_empty());
    }

    #[test]
    fn test_merge_map_inner_is_flattening() {
        let (session, graph, _) = session(Retention::Forever);
        let inner = Observable::never().with_tag("inner");
        let outer = Observable::of(vec![json!(1)])
            .with_tag("outer")
            .merge_map(move |_| inner.clone());

        let subscription = session.subscribe(&outer, |_: Notification| {});
        let merged = graph.record(subscription.id().unwrap()).unwrap();

        assert_eq!(merged.sources.len(), 1);
        assert_eq!(merged.flattenings.len(), 1);

        let flattening = graph.record(merged.flattenings[0]).unwrap();
        assert!(flattening.flattened);
        assert_eq!(flattening.sink, Some(merged.id()));
        assert_eq!(flattening.depth, merged.depth);
        assert_eq!(flattening.subscription.observable().tag(), Some("inner"));

        let found = graph.find_subscription(&Match::from("inner")).unwrap();
        assert_eq!(found.id(), flattening.id());
    }

    #[test]
    fn test_immediate_flush_after_quiescence() {
        let (session, graph, _) = session(Retention::Immediate);
        let mapped = Observable::never().map(|v| v);

        let subscription = session.subscribe(&mapped, |_: Notification| {});
        assert_eq!(graph.len(), 2);

        subscription.unsubscribe();
        assert!(graph.is_empty());
        assert!(graph.find_root_subscriptions().is_empty());
        assert_eq!(graph.flushed_roots(), 1);
    }

    #[test]
    fn test_flush_waits_for_open_sources() {
        let (session, graph, _) = session(Retention::Immediate);
        let kept = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&kept);

        // The producer's inner subscription is not torn down with it.
        let leaky = Observable::new(move |subscriber| {
            let inner = subscriber.subscribe(&Observable::never(), |_: Notification| {});
            *slot.lock() = Some(inner);
            Teardown::Empty
        });

        let subscription = session.subscribe(&leaky, |_: Notification| {});
        let id = subscription.id().unwrap();
        subscription.unsubscribe();
        assert!(graph.record(id).is_some_and(|r| r.unsubscribed));

        let inner = kept.lock().take();
        if let Some(inner) = inner {
            inner.unsubscribe();
        }
        assert!(graph.record(id).is_none());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_deferred_flush() {
        let (session, graph, scheduler) = session(Retention::For(Duration::from_millis(10)));
        let subscription = session.subscribe(&Observable::never().map(|v| v), |_: Notification| {});
        let id = subscription.id().unwrap();
        subscription.unsubscribe();

        scheduler.advance(Duration::from_millis(5));
        assert_eq!(graph.record(id).map(|r| r.sources.len()), Some(1));

        scheduler.advance(Duration::from_millis(5));
        assert!(graph.is_empty());
    }
}
