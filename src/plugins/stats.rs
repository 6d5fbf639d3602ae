//! Running lifecycle and topology counters.

use super::Plugin;
use crate::graph::GraphPlugin;
use crate::logger::Logger;
use crate::session::Session;
use crate::stream::SubscriptionRef;
use crate::types::Value;
use parking_lot::Mutex;
use serde::Serialize;

/// Totals since the plugin was registered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub subscribes: usize,
    pub nexts: usize,
    pub errors: usize,
    pub completes: usize,
    pub unsubscribes: usize,
    /// Subscriptions without a sink.
    pub roots: usize,
    /// Subscriptions that had no inputs once subscribed.
    pub leaves: usize,
    pub flattened: usize,
    pub max_depth: usize,
    pub total_depth: usize,
}

impl SubscriptionStats {
    /// Mean depth of the subscriptions seen in the graph.
    pub fn mean_depth(&self) -> f64 {
        if self.subscribes == 0 {
            0.0
        } else {
            self.total_depth as f64 / self.subscribes as f64
        }
    }
}

/// Counts events and, with a graph registered before it, topology.
#[derive(Default)]
pub struct StatsPlugin {
    stats: Mutex<SubscriptionStats>,
}

impl StatsPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> SubscriptionStats {
        *self.stats.lock()
    }

    /// Writes the current totals through `logger`.
    pub fn log(&self, logger: &dyn Logger) {
        let stats = self.stats();
        logger.group("Stats");
        logger.log(&format!("Subscribes = {}", stats.subscribes));
        logger.log(&format!("Root subscribes = {}", stats.roots));
        logger.log(&format!("Leaf subscribes = {}", stats.leaves));
        logger.log(&format!("Flattened subscribes = {}", stats.flattened));
        logger.log(&format!("Nexts = {}", stats.nexts));
        logger.log(&format!("Errors = {}", stats.errors));
        logger.log(&format!("Completes = {}", stats.completes));
        logger.log(&format!("Unsubscribes = {}", stats.unsubscribes));
        logger.log(&format!("Max. depth = {}", stats.max_depth));
        logger.log(&format!("Avg. depth = {:.1}", stats.mean_depth()));
        logger.group_end();
    }
}

impl Plugin for StatsPlugin {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn after_subscribe(&self, session: &Session, subscription: &SubscriptionRef) {
        let topology = session
            .require_before::<GraphPlugin>(self, "Graph")
            .and_then(|graph| graph.record(subscription.id()));

        let mut stats = self.stats.lock();
        stats.subscribes += 1;
        if let Some(record) = topology {
            if record.is_root() {
                stats.roots += 1;
            }
            if record.sources.is_empty() && record.flattenings.is_empty() {
                stats.leaves += 1;
            }
            if record.flattened {
                stats.flattened += 1;
            }
            stats.max_depth = stats.max_depth.max(record.depth);
            stats.total_depth += record.depth;
        }
    }

    fn after_next(&self, _: &Session, _: &SubscriptionRef, _: &Value) {
        self.stats.lock().nexts += 1;
    }

    fn after_error(&self, _: &Session, _: &SubscriptionRef, _: &Value) {
        self.stats.lock().errors += 1;
    }

    fn after_complete(&self, _: &Session, _: &SubscriptionRef) {
        self.stats.lock().completes += 1;
    }

    fn after_unsubscribe(&self, _: &Session, _: &SubscriptionRef) {
        self.stats.lock().unsubscribes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Retention, SpyConfig};
    use crate::logger::MemoryLogger;
    use crate::stream::Observable;
    use crate::types::Notification;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_counts_events_and_topology() {
        let session = Session::new(SpyConfig::default().with_retention(Retention::Forever));
        let stats = Arc::new(StatsPlugin::new());
        session.plug_arc(stats.clone());

        let source = Observable::of(vec![json!(1), json!(2)]);
        let inner = Observable::of(vec![json!("x")]);
        let flattened = source.merge_map(move |_| inner.clone());
        session.subscribe(&flattened, |_: Notification| {});

        let totals = stats.stats();
        // merge_map, its source and two inner subscriptions.
        assert_eq!(totals.subscribes, 4);
        assert_eq!(totals.roots, 1);
        assert_eq!(totals.flattened, 2);
        assert_eq!(totals.max_depth, 2);
        assert_eq!(totals.unsubscribes, 4);
        assert_eq!(totals.completes, 4);
    }

    #[test]
    fn test_missing_graph_warns_once() {
        let logger = Arc::new(MemoryLogger::new());
        let session = Session::new(SpyConfig::bare().with_logger(logger.clone()));
        let stats = Arc::new(StatsPlugin::new());
        session.plug_arc(stats.clone());

        session.subscribe(&Observable::empty(), |_: Notification| {});
        session.subscribe(&Observable::empty(), |_: Notification| {});

        assert_eq!(stats.stats().subscribes, 2);
        assert_eq!(stats.stats().roots, 0);
        assert_eq!(logger.warnings().len(), 1);
        assert!(logger.contains("Graph plugin not found"));
    }
}
