//! Reentrant `next` detection.

use super::Plugin;
use crate::session::Session;
use crate::snapshot::SnapshotPlugin;
use crate::stream::SubscriptionRef;
use crate::types::{SubscriptionId, Value};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;

/// Flags a `next` delivered to a subscription that is still handling an
/// earlier one.
///
/// Each detection increments the `cycles` query field of the subscription
/// when a snapshot plugin is registered before this one.
#[derive(Default)]
pub struct CyclePlugin {
    nexts: Mutex<Vec<SubscriptionId>>,
    warned: Mutex<HashSet<SubscriptionId>>,
}

impl CyclePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions a cycle was detected on.
    pub fn detected(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.warned.lock().iter().copied().collect();
        ids.sort();
        ids
    }
}

impl Plugin for CyclePlugin {
    fn name(&self) -> &'static str {
        "cycle"
    }

    fn before_next(&self, session: &Session, subscription: &SubscriptionRef, _: &Value) {
        let id = subscription.id();
        let cyclic = {
            let mut nexts = self.nexts.lock();
            let cyclic = nexts.contains(&id);
            nexts.push(id);
            cyclic
        };
        if !cyclic {
            return;
        }

        tracing::debug!(subscription = %id, "cyclic next");
        if self.warned.lock().insert(id) {
            let observable = subscription.observable();
            let name = match observable.tag() {
                Some(tag) => format!("tag = {tag}"),
                None => format!("id = {}", observable.id()),
            };
            session.logger().warn(&format!(
                "Cyclic next detected; {name}; subscription = {id}"
            ));
        }

        if let Some(snapshot) = session.find_before::<SnapshotPlugin>(self) {
            snapshot.update_query(id, "cycles", |current| {
                let count = current.and_then(Value::as_u64).unwrap_or(0);
                json!(count + 1)
            });
        }
    }

    fn after_next(&self, _: &Session, subscription: &SubscriptionRef, _: &Value) {
        let mut nexts = self.nexts.lock();
        if let Some(position) = nexts.iter().rposition(|id| *id == subscription.id()) {
            nexts.remove(position);
        }
    }

    fn after_unsubscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        self.warned.lock().remove(&subscription.id());
    }
}
