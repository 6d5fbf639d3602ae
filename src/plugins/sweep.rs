//! Keyed snapshot sweeps.

use super::Plugin;
use crate::session::Session;
use crate::snapshot::{Snapshot, SnapshotDiff, SubscriptionSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Remembers the last snapshot taken under each key so that successive
/// sweeps report only what changed.
#[derive(Default)]
pub struct SweepPlugin {
    sweeps: Mutex<HashMap<String, Snapshot>>,
}

impl SweepPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots the session and logs the difference from the previous
    /// sweep under `key`. The first sweep for a key compares against an
    /// empty snapshot. Returns `None` without a snapshot plugin.
    pub fn sweep(&self, session: &Session, key: &str) -> Option<SnapshotDiff> {
        let current = session.snapshot()?;
        let previous = self
            .sweeps
            .lock()
            .insert(key.to_string(), current.clone())
            .unwrap_or_default();

        let diff = SnapshotDiff::between(&previous, &current);
        tracing::debug!(
            key,
            added = diff.added.len(),
            removed = diff.removed.len(),
            nexts = diff.nexts,
            "sweep"
        );

        let logger = session.logger();
        logger.group(&format!("Sweep {key}"));
        logger.log(&format!("Added subscriptions = {}", diff.added.len()));
        for id in &diff.added {
            if let Some(subscription) = current.subscription(*id) {
                logger.log(&format!("  {}", describe(&current, subscription)));
            }
        }
        logger.log(&format!("Removed subscriptions = {}", diff.removed.len()));
        for id in &diff.removed {
            if let Some(subscription) = previous.subscription(*id) {
                logger.log(&format!("  {}", describe(&previous, subscription)));
            }
        }
        logger.log(&format!("Nexts = {}", diff.nexts));
        logger.group_end();

        Some(diff)
    }

    /// Forgets the snapshot kept under `key`.
    pub fn forget(&self, key: &str) -> bool {
        self.sweeps.lock().remove(key).is_some()
    }
}

fn describe(snapshot: &Snapshot, subscription: &SubscriptionSnapshot) -> String {
    let name = match snapshot
        .observable(subscription.observable)
        .and_then(|observable| observable.tag.as_deref())
    {
        Some(tag) => format!("Tag = {tag}"),
        None => format!("ID = {}", subscription.observable),
    };
    format!("{name}; subscription = {}", subscription.id)
}

impl Plugin for SweepPlugin {
    fn name(&self) -> &'static str {
        "sweep"
    }

    fn teardown(&self) {
        self.sweeps.lock().clear();
    }
}
