//! Call-site capture and optional asynchronous frame resolution.

use super::Plugin;
use crate::graph::{FlushWatch, GraphPlugin};
use crate::session::Session;
use crate::stream::SubscriptionRef;
use crate::types::{StackFrame, SubscriptionId};
use futures::future::{self, BoxFuture, FutureExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Maps raw frames to display frames (e.g. through debug info).
///
/// Returns one frame per input frame, in order. Only awaited for display.
pub trait StackResolver: Send + Sync {
    fn resolve(&self, frames: Vec<StackFrame>) -> BoxFuture<'static, Vec<StackFrame>>;
}

/// Remembers resolved frames so each raw frame is resolved once.
pub struct CachingResolver {
    inner: Arc<dyn StackResolver>,
    cache: Arc<Mutex<LruCache<StackFrame, StackFrame>>>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn StackResolver>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Number of cached frames.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl StackResolver for CachingResolver {
    fn resolve(&self, frames: Vec<StackFrame>) -> BoxFuture<'static, Vec<StackFrame>> {
        let known: Vec<Option<StackFrame>> = {
            let mut cache = self.cache.lock();
            frames.iter().map(|frame| cache.get(frame).cloned()).collect()
        };
        let missing: Vec<StackFrame> = frames
            .iter()
            .zip(&known)
            .filter(|(_, known)| known.is_none())
            .map(|(frame, _)| frame.clone())
            .collect();

        if missing.is_empty() {
            return future::ready(known.into_iter().flatten().collect()).boxed();
        }

        let pending = self.inner.resolve(missing.clone());
        let cache = Arc::clone(&self.cache);
        async move {
            let fresh = pending.await;
            let mut fresh = missing.into_iter().zip(fresh.into_iter().map(Some).chain(std::iter::repeat(None)));

            let mut cache = cache.lock();
            frames
                .into_iter()
                .zip(known)
                .map(|(raw, known)| match known {
                    Some(resolved) => resolved,
                    None => match fresh.next() {
                        Some((missing, Some(resolved))) => {
                            cache.put(missing, resolved.clone());
                            resolved
                        }
                        _ => raw,
                    },
                })
                .collect()
        }
        .boxed()
    }
}

/// Where a subscription was made and where its observable was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StackTrace {
    pub subscribe: StackFrame,
    pub observable: StackFrame,
}

impl StackTrace {
    pub fn frames(&self) -> Vec<StackFrame> {
        vec![self.subscribe.clone(), self.observable.clone()]
    }
}

/// Records a [`StackTrace`] per subscription, kept while the graph holds
/// the subscription.
pub struct StackTracePlugin {
    resolver: Option<Arc<CachingResolver>>,
    traces: Arc<Mutex<HashMap<SubscriptionId, StackTrace>>>,
    flushes: FlushWatch,
}

impl StackTracePlugin {
    pub fn new(resolver: Option<Arc<dyn StackResolver>>, cache_size: usize) -> Self {
        Self {
            resolver: resolver.map(|inner| Arc::new(CachingResolver::new(inner, cache_size))),
            traces: Arc::new(Mutex::new(HashMap::new())),
            flushes: FlushWatch::new(),
        }
    }

    /// Number of recorded traces.
    pub fn len(&self) -> usize {
        self.traces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.lock().is_empty()
    }

    pub fn trace(&self, id: SubscriptionId) -> Option<StackTrace> {
        self.traces.lock().get(&id).cloned()
    }

    /// The caching resolver, if one was configured.
    pub fn resolver(&self) -> Option<Arc<dyn StackResolver>> {
        self.resolver
            .as_ref()
            .map(|resolver| Arc::clone(resolver) as Arc<dyn StackResolver>)
    }

    /// Resolves `frames`, or hands them back unchanged without a resolver.
    pub fn resolve(&self, frames: Vec<StackFrame>) -> BoxFuture<'static, Vec<StackFrame>> {
        match &self.resolver {
            Some(resolver) => resolver.resolve(frames),
            None => future::ready(frames).boxed(),
        }
    }

    /// Drops traces of subscriptions not in `keep`.
    pub(crate) fn retain(&self, keep: &HashSet<SubscriptionId>) {
        self.traces.lock().retain(|id, _| keep.contains(id));
    }
}

impl Plugin for StackTracePlugin {
    fn name(&self) -> &'static str {
        "stack-trace"
    }

    fn before_subscribe(&self, session: &Session, subscription: &SubscriptionRef) {
        if !self.flushes.is_watching() {
            self.flushes.watch(session.find::<GraphPlugin>(), &self.traces);
        }
        self.traces.lock().insert(
            subscription.id(),
            StackTrace {
                subscribe: subscription.site().clone(),
                observable: subscription.observable().site().clone(),
            },
        );
    }

    fn after_unsubscribe(&self, _: &Session, subscription: &SubscriptionRef) {
        if !self.flushes.is_watching() {
            self.traces.lock().remove(&subscription.id());
        }
    }

    fn teardown(&self) {
        self.traces.lock().clear();
        self.flushes.reset();
    }
}
