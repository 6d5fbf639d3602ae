//! Graph records.

use crate::stream::SubscriptionRef;
use crate::types::SubscriptionId;

/// Dispatch frame pending on the graph's stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Subscribe(SubscriptionId),
    Next(SubscriptionId),
}

/// Topology of one subscription.
///
/// `sink` and `root_sink` are fixed at subscribe time. `sources` and
/// `flattenings` only shrink afterwards, as closed children are flushed.
#[derive(Clone, Debug)]
pub struct GraphRecord {
    pub subscription: SubscriptionRef,
    /// Subscription this one feeds; `None` for a root.
    pub sink: Option<SubscriptionId>,
    /// Top of the sink chain; `None` for a root.
    pub root_sink: Option<SubscriptionId>,
    pub sources: Vec<SubscriptionId>,
    pub flattenings: Vec<SubscriptionId>,
    pub flushed_sources: usize,
    pub flushed_flattenings: usize,
    /// 1 for roots; increases along source edges only.
    pub depth: usize,
    /// Created while a value was being delivered to its sink's source.
    pub flattened: bool,
    pub unsubscribed: bool,
}

impl GraphRecord {
    pub(crate) fn new(subscription: SubscriptionRef) -> Self {
        Self {
            subscription,
            sink: None,
            root_sink: None,
            sources: Vec::new(),
            flattenings: Vec::new(),
            flushed_sources: 0,
            flushed_flattenings: 0,
            depth: 1,
            flattened: false,
            unsubscribed: false,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    pub fn is_root(&self) -> bool {
        self.sink.is_none()
    }

    /// Direct inputs: sources followed by flattenings.
    pub fn children(&self) -> impl Iterator<Item = SubscriptionId> + '_ {
        self.sources.iter().chain(self.flattenings.iter()).copied()
    }
}
