//! Live subscription graph.
//!
//! The graph is rebuilt purely from the order of lifecycle events:
//!
//! - a subscription made inside another subscription's subscribe call is a
//!   **source** of it (one level deeper);
//! - a subscription made while a value is delivered is a **flattening** of
//!   the receiving subscription's sink (same depth);
//! - anything else is a **root** under the sentinel.
//!
//! Closed subscriptions are flushed once they and their direct inputs are
//! closed, immediately or after the configured [`Retention`](crate::Retention).

mod plugin;
mod types;

pub(crate) use plugin::FlushWatch;
pub use plugin::GraphPlugin;
pub use types::GraphRecord;
