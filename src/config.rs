//! Session configuration.

use crate::logger::{Logger, TracingLogger};
use crate::plugins::stack_trace::StackResolver;
use crate::scheduler::{Scheduler, ThreadScheduler};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long an unsubscribed, quiescent subscription stays in the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    /// Flush as soon as the subscription and its inputs are closed.
    Immediate,
    /// Flush after the given delay on the shared deferred-flush queue.
    For(Duration),
    /// Never flush; keep everything for post-mortem inspection.
    Forever,
}

impl Retention {
    /// Builds a retention from milliseconds; zero means immediate.
    pub fn from_millis(millis: u64) -> Self {
        Duration::from_millis(millis).into()
    }
}

impl From<Duration> for Retention {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Retention::Immediate
        } else if duration == Duration::MAX {
            Retention::Forever
        } else {
            Retention::For(duration)
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Retention::Immediate
    }
}

/// Configuration for a [`Session`](crate::Session).
#[derive(Clone)]
pub struct SpyConfig {
    /// Coalescing window for audited log output (zero = log synchronously).
    pub audit: Duration,

    /// Graph retention for closed subscriptions.
    pub retention: Retention,

    /// Number of values kept per subscription in the snapshot ring.
    /// Default: 4
    pub kept_values: usize,

    /// Register the stack-trace, graph and snapshot plugins on creation.
    pub default_plugins: bool,

    /// Warn when an error notification carries a non error-like payload.
    pub warn_on_non_error: bool,

    /// Resolved-frame cache size (number of frames).
    pub stack_cache_size: usize,

    /// Where human-readable output goes.
    pub logger: Arc<dyn Logger>,

    /// Timer source for audits and deferred flushes.
    pub scheduler: Arc<dyn Scheduler>,

    /// Optional asynchronous stack-frame resolution, used for display only.
    pub resolver: Option<Arc<dyn StackResolver>>,
}

impl Default for SpyConfig {
    fn default() -> Self {
        Self {
            audit: Duration::ZERO,
            retention: Retention::Immediate,
            kept_values: 4,
            default_plugins: true,
            warn_on_non_error: true,
            stack_cache_size: 1000,
            logger: Arc::new(TracingLogger::new()),
            scheduler: Arc::new(ThreadScheduler::new()),
            resolver: None,
        }
    }
}

impl SpyConfig {
    /// A configuration with no plugins registered up front.
    #[must_use]
    pub fn bare() -> Self {
        Self {
            default_plugins: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Duration) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: impl Into<Retention>) -> Self {
        self.retention = retention.into();
        self
    }

    #[must_use]
    pub fn with_kept_values(mut self, kept_values: usize) -> Self {
        self.kept_values = kept_values;
        self
    }

    #[must_use]
    pub fn with_default_plugins(mut self, enabled: bool) -> Self {
        self.default_plugins = enabled;
        self
    }

    #[must_use]
    pub fn with_warn_on_non_error(mut self, enabled: bool) -> Self {
        self.warn_on_non_error = enabled;
        self
    }

    #[must_use]
    pub fn with_stack_cache_size(mut self, size: usize) -> Self {
        self.stack_cache_size = size;
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn StackResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

impl fmt::Debug for SpyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpyConfig")
            .field("audit", &self.audit)
            .field("retention", &self.retention)
            .field("kept_values", &self.kept_values)
            .field("default_plugins", &self.default_plugins)
            .field("warn_on_non_error", &self.warn_on_non_error)
            .field("stack_cache_size", &self.stack_cache_size)
            .field("resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}
