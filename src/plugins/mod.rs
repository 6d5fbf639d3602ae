//! Plugin contract and the diagnostic plugins that ship with the crate.
//!
//! Every hook is optional. Hooks run in registration order, synchronously,
//! with the [`Session`] that is dispatching, so a plugin can look up the
//! plugins it depends on with [`Session::find_before`].
//!
//! Panics raised by a hook are not caught: they abort the event dispatch.

pub mod buffer;
pub mod cycle;
pub mod log;
pub mod stack_trace;
pub mod stats;
pub mod sweep;

use crate::session::relay::Transform;
use crate::session::Session;
use crate::stream::SubscriptionRef;
use crate::types::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

pub use buffer::{BufferPlugin, DEFAULT_BUFFER_THRESHOLD};
pub use cycle::CyclePlugin;
pub use log::LogPlugin;
pub use stack_trace::{CachingResolver, StackResolver, StackTracePlugin};
pub use stats::{StatsPlugin, SubscriptionStats};
pub use sweep::SweepPlugin;

/// Handle returned by [`Session::plug`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(pub u64);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin-{}", self.0)
    }
}

/// Lets registered plugins be recovered by concrete type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Lifecycle hooks. Unimplemented hooks do nothing.
#[allow(unused_variables)]
pub trait Plugin: AsAny {
    /// Name used in log output.
    fn name(&self) -> &'static str;

    fn before_subscribe(&self, session: &Session, subscription: &SubscriptionRef) {}
    fn after_subscribe(&self, session: &Session, subscription: &SubscriptionRef) {}

    fn before_next(&self, session: &Session, subscription: &SubscriptionRef, value: &Value) {}
    fn after_next(&self, session: &Session, subscription: &SubscriptionRef, value: &Value) {}

    fn before_error(&self, session: &Session, subscription: &SubscriptionRef, error: &Value) {}
    fn after_error(&self, session: &Session, subscription: &SubscriptionRef, error: &Value) {}

    fn before_complete(&self, session: &Session, subscription: &SubscriptionRef) {}
    fn after_complete(&self, session: &Session, subscription: &SubscriptionRef) {}

    fn before_unsubscribe(&self, session: &Session, subscription: &SubscriptionRef) {}
    fn after_unsubscribe(&self, session: &Session, subscription: &SubscriptionRef) {}

    /// Transform to splice into the subscription's delivery path, if any.
    /// Must return the same `Arc` for as long as the selection is unchanged.
    fn select(&self, subscription: &SubscriptionRef) -> Option<Arc<dyn Transform>> {
        None
    }

    /// Called once when the plugin is unplugged or the session is torn down.
    fn teardown(&self) {}
}

/// Address of a plugin without its vtable.
pub(crate) fn plugin_addr(plugin: &dyn Plugin) -> *const () {
    plugin as *const dyn Plugin as *const ()
}
