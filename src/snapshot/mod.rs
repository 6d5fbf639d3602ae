//! Point-in-time, self-contained captures of the subscription graph.
//!
//! A [`Snapshot`] owns everything it holds: later lifecycle events never
//! alter a snapshot that was already returned.

mod diff;
mod plugin;
mod types;

pub use diff::SnapshotDiff;
pub use plugin::SnapshotPlugin;
pub use types::{
    ObservableSnapshot, Snapshot, SnapshotOptions, SnapshotRecord, SubscriberSnapshot,
    SubscriptionSnapshot, ValueSnapshot,
};
