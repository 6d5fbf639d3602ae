//! Differences between two snapshots.

use super::types::Snapshot;
use crate::types::SubscriptionId;
use serde::Serialize;

/// What changed between an earlier and a later snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub from_tick: u64,
    pub to_tick: u64,
    /// Subscriptions only in the later snapshot.
    pub added: Vec<SubscriptionId>,
    /// Subscriptions only in the earlier snapshot.
    pub removed: Vec<SubscriptionId>,
    /// Values delivered in between, counted on the later snapshot's
    /// subscriptions.
    pub nexts: usize,
}

impl SnapshotDiff {
    pub fn between(previous: &Snapshot, current: &Snapshot) -> Self {
        let added = current
            .subscriptions
            .keys()
            .filter(|id| !previous.subscriptions.contains_key(id))
            .copied()
            .collect();
        let removed = previous
            .subscriptions
            .keys()
            .filter(|id| !current.subscriptions.contains_key(id))
            .copied()
            .collect();
        let nexts = current
            .subscriptions
            .values()
            .map(|subscription| {
                let before = previous
                    .subscription(subscription.id)
                    .map_or(0, |earlier| earlier.next_count);
                subscription.next_count.saturating_sub(before)
            })
            .sum();

        Self {
            from_tick: previous.tick,
            to_tick: current.tick,
            added,
            removed,
            nexts,
        }
    }

    /// True when nothing was added, removed or delivered.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.nexts == 0
    }
}
