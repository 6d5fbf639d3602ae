//! Immutable snapshot types.

use crate::identity::Match;
use crate::plugins::stack_trace::StackTrace;
use crate::stream::WeakObservable;
use crate::types::{ObservableId, StackFrame, SubscriberId, SubscriptionId, Timestamp, Value};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Options for [`SnapshotPlugin::snapshot_all`](super::SnapshotPlugin::snapshot_all).
#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotOptions {
    /// Only keep entries touched after this tick.
    pub since: Option<u64>,
}

impl SnapshotOptions {
    pub fn since(tick: u64) -> Self {
        Self { since: Some(tick) }
    }
}

/// A delivered value and when it was delivered.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValueSnapshot {
    pub tick: u64,
    pub timestamp: Timestamp,
    pub value: Value,
}

/// Live, mutable per-subscription capture owned by the snapshot plugin.
#[derive(Clone, Debug)]
pub struct SnapshotRecord {
    /// Last tick that touched this record.
    pub tick: u64,
    pub subscribed_at: Timestamp,
    pub next_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub errored_at: Option<Timestamp>,
    pub unsubscribed_at: Option<Timestamp>,
    pub next_count: usize,
    /// The most recent values; older ones are counted in `values_flushed`.
    pub values: VecDeque<ValueSnapshot>,
    pub values_flushed: usize,
    pub error: Option<Value>,
    /// Open extension map for fields derived by other plugins.
    pub query: serde_json::Map<String, Value>,
}

impl SnapshotRecord {
    pub(crate) fn new(tick: u64) -> Self {
        Self {
            tick,
            subscribed_at: Timestamp::now(),
            next_at: None,
            completed_at: None,
            errored_at: None,
            unsubscribed_at: None,
            next_count: 0,
            values: VecDeque::new(),
            values_flushed: 0,
            error: None,
            query: serde_json::Map::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SubscriptionSnapshot {
    pub id: SubscriptionId,
    pub observable: ObservableId,
    pub subscriber: SubscriberId,
    pub tick: u64,
    pub subscribed_at: Timestamp,
    pub next_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub errored_at: Option<Timestamp>,
    pub unsubscribed_at: Option<Timestamp>,
    pub next_count: usize,
    pub values: Vec<ValueSnapshot>,
    pub values_flushed: usize,
    pub error: Option<Value>,
    pub query: serde_json::Map<String, Value>,
    pub stack_trace: Option<StackTrace>,
    pub depth: usize,
    pub flattened: bool,
    pub sink: Option<SubscriptionId>,
    pub root_sink: Option<SubscriptionId>,
    pub sources: Vec<SubscriptionId>,
    pub flattenings: Vec<SubscriptionId>,
    pub flushed_sources: usize,
    pub flushed_flattenings: usize,
}

impl SubscriptionSnapshot {
    pub fn is_root(&self) -> bool {
        self.sink.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_errored(&self) -> bool {
        self.errored_at.is_some()
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed_at.is_some()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ObservableSnapshot {
    pub id: ObservableId,
    pub tag: Option<String>,
    pub kind: &'static str,
    pub site: StackFrame,
    pub subscriptions: BTreeSet<SubscriptionId>,
    pub values: Vec<ValueSnapshot>,
    pub values_flushed: usize,
    pub tick: u64,
    /// Lets reference and predicate matches run while the observable is
    /// alive, without keeping its producer alive.
    #[serde(skip)]
    pub handle: WeakObservable,
}

#[derive(Clone, Debug, Serialize)]
pub struct SubscriberSnapshot {
    pub id: SubscriberId,
    pub subscriptions: BTreeSet<SubscriptionId>,
    pub values: Vec<ValueSnapshot>,
    pub values_flushed: usize,
    pub tick: u64,
}

/// Self-contained picture of the graph at one tick.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Snapshot {
    pub tick: u64,
    pub observables: BTreeMap<ObservableId, ObservableSnapshot>,
    pub subscribers: BTreeMap<SubscriberId, SubscriberSnapshot>,
    pub subscriptions: BTreeMap<SubscriptionId, SubscriptionSnapshot>,
}

impl Snapshot {
    pub fn subscription(&self, id: SubscriptionId) -> Option<&SubscriptionSnapshot> {
        self.subscriptions.get(&id)
    }

    pub fn observable(&self, id: ObservableId) -> Option<&ObservableSnapshot> {
        self.observables.get(&id)
    }

    /// Subscriptions without a sink, in id order.
    pub fn root_subscriptions(&self) -> Vec<&SubscriptionSnapshot> {
        self.subscriptions.values().filter(|s| s.is_root()).collect()
    }

    /// Depth-first search from the roots, sources before flattenings.
    pub fn find_subscription(&self, matcher: &Match) -> Option<&SubscriptionSnapshot> {
        let mut stack: Vec<&SubscriptionSnapshot> = self.root_subscriptions();
        stack.reverse();
        while let Some(subscription) = stack.pop() {
            if self.matches(subscription, matcher) {
                return Some(subscription);
            }
            let children = subscription
                .sources
                .iter()
                .chain(&subscription.flattenings)
                .filter_map(|id| self.subscriptions.get(id));
            let mut children: Vec<_> = children.collect();
            children.reverse();
            stack.extend(children);
        }
        None
    }

    /// Whether `matcher` selects `subscription`.
    pub fn matches(&self, subscription: &SubscriptionSnapshot, matcher: &Match) -> bool {
        self.observables
            .get(&subscription.observable)
            .is_some_and(|observable| {
                let ids = [subscription.id.0, subscription.subscriber.0];
                match observable.handle.upgrade() {
                    Some(live) => matcher.matches_parts(&live, &ids),
                    None => matcher.matches_identity(observable.id, observable.tag.as_deref(), &ids),
                }
            })
    }

    /// Drops entries not touched after `tick`.
    pub(crate) fn prune(&mut self, tick: u64) {
        self.observables.retain(|_, o| o.tick > tick);
        self.subscribers.retain(|_, s| s.tick > tick);
        self.subscriptions.retain(|_, s| s.tick > tick);
    }
}
