//! Interception core.
//!
//! A [`Session`] activates observables on behalf of the caller, assigns
//! identities, advances the logical tick and runs the before/between/after
//! protocol for every lifecycle event across the registered plugins.
//!
//! ## Dispatch order
//!
//! For each event: the tick increments, every plugin's `before_*` hook runs
//! in registration order, the real delivery happens, then every plugin's
//! `after_*` hook runs in registration order. The plugin list is read once
//! per event, so plugging or unplugging from inside a hook takes effect on
//! the next event.

mod global;
pub mod relay;

pub use global::{install, installed};

use crate::config::SpyConfig;
use crate::deck::{Deck, PausePlugin};
use crate::error::Result;
use crate::events::{EventFilter, EventsHandle, EventsPlugin};
use crate::graph::GraphPlugin;
use crate::identity::Match;
use crate::logger::{Logger, WarnOnce};
use crate::plugins::{plugin_addr, LogPlugin, Plugin, PluginId, StackTracePlugin, SweepPlugin};
use crate::query::{self, QueryRequest, QueryResult};
use crate::scheduler::Scheduler;
use crate::snapshot::{Snapshot, SnapshotDiff, SnapshotOptions, SnapshotPlugin};
use crate::stream::{Observable, Observer, Subscriber, Subscription, SubscriptionCell, SubscriptionRef};
use crate::types::{is_error_like, NotificationKind, SubscriptionId, Value};
use parking_lot::{Mutex, RwLock};
use relay::Transform;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A lifecycle event as seen by the hooks.
#[derive(Clone, Copy, Debug)]
pub enum Event<'a> {
    Subscribe,
    Next(&'a Value),
    Error(&'a Value),
    Complete,
    Unsubscribe,
}

impl Event<'_> {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Event::Subscribe => NotificationKind::Subscribe,
            Event::Next(_) => NotificationKind::Next,
            Event::Error(_) => NotificationKind::Error,
            Event::Complete => NotificationKind::Complete,
            Event::Unsubscribe => NotificationKind::Unsubscribe,
        }
    }
}

#[derive(Clone)]
struct PluginEntry {
    id: PluginId,
    plugin: Arc<dyn Plugin>,
}

struct SessionInner {
    config: SpyConfig,
    plugins: RwLock<Arc<Vec<PluginEntry>>>,
    next_plugin: AtomicU64,
    tick: AtomicU64,
    live: Mutex<BTreeMap<SubscriptionId, Weak<SubscriptionCell>>>,
    active: AtomicBool,
    warnings: WarnOnce,
}

/// Explicit interception context. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning handle to a [`Session`].
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    /// Creates a session. With `default_plugins`, the stack-trace, graph
    /// and snapshot plugins are registered in that order.
    pub fn new(config: SpyConfig) -> Self {
        let defaults = config.default_plugins;
        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                plugins: RwLock::new(Arc::new(Vec::new())),
                next_plugin: AtomicU64::new(1),
                tick: AtomicU64::new(0),
                live: Mutex::new(BTreeMap::new()),
                active: AtomicBool::new(true),
                warnings: WarnOnce::default(),
            }),
        };

        if defaults {
            let config = &session.inner.config;
            session.plug(StackTracePlugin::new(
                config.resolver.clone(),
                config.stack_cache_size,
            ));
            session.plug(GraphPlugin::new(config.retention, Arc::clone(&config.scheduler)));
            session.plug(SnapshotPlugin::new(config.kept_values));
        }
        session
    }

    pub fn config(&self) -> &SpyConfig {
        &self.inner.config
    }

    pub fn logger(&self) -> &dyn Logger {
        self.inner.config.logger.as_ref()
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::clone(&self.inner.config.scheduler)
    }

    /// Current value of the logical clock.
    pub fn tick(&self) -> u64 {
        self.inner.tick.load(Ordering::SeqCst)
    }

    /// False once [`Session::teardown`] has run.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // --- Activation ---

    /// Activates `observable` under this session.
    ///
    /// After teardown the observable is activated directly.
    #[track_caller]
    pub fn subscribe<O>(&self, observable: &Observable, observer: O) -> Subscription
    where
        O: Observer + 'static,
    {
        if !self.is_active() {
            return observable.subscribe_direct(observer);
        }

        let reference = SubscriptionRef::new(observable.clone(), Location::caller());
        let cell = Arc::new(SubscriptionCell::instrumented(
            reference.clone(),
            self.clone(),
            Box::new(observer),
        ));
        self.inner
            .live
            .lock()
            .insert(reference.id(), Arc::downgrade(&cell));
        cell.resolve(self.transforms_for(&reference));

        let subscriber = Subscriber::new(Arc::clone(&cell), Some(self.clone()));
        self.dispatch(Event::Subscribe, &reference, || {
            let teardown = observable.produce(subscriber);
            cell.add(teardown);
        });

        Subscription::new(cell)
    }

    /// Runs one event through the hooks, with `between` as the real delivery.
    pub(crate) fn dispatch<R>(
        &self,
        event: Event<'_>,
        subscription: &SubscriptionRef,
        between: impl FnOnce() -> R,
    ) -> R {
        let tick = self.inner.tick.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(
            tick,
            event = %event.kind(),
            subscription = %subscription.id(),
            "dispatch"
        );

        if let Event::Error(error) = event {
            if self.inner.config.warn_on_non_error && !is_error_like(error) {
                let message = format!(
                    "Value is not an error; subscription {} received {}",
                    subscription.id(),
                    error
                );
                tracing::warn!("{}", message);
                self.logger().warn(&message);
            }
        }

        let plugins = self.plugins();
        for entry in plugins.iter() {
            before(entry.plugin.as_ref(), self, event, subscription);
        }
        let result = between();
        for entry in plugins.iter() {
            after(entry.plugin.as_ref(), self, event, subscription);
        }
        result
    }

    pub(crate) fn forget(&self, id: SubscriptionId) {
        self.inner.live.lock().remove(&id);
    }

    // --- Plugins ---

    fn plugins(&self) -> Arc<Vec<PluginEntry>> {
        Arc::clone(&self.inner.plugins.read())
    }

    /// Registers `plugin` after every plugin already registered.
    pub fn plug<P: Plugin>(&self, plugin: P) -> PluginId {
        self.plug_arc(Arc::new(plugin))
    }

    pub fn plug_arc(&self, plugin: Arc<dyn Plugin>) -> PluginId {
        let id = PluginId(self.inner.next_plugin.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(plugin = plugin.name(), %id, "plug");
        {
            let mut plugins = self.inner.plugins.write();
            let mut next = Vec::clone(&plugins);
            next.push(PluginEntry { id, plugin });
            *plugins = Arc::new(next);
        }
        self.resolve_all();
        id
    }

    /// Unregisters a plugin and runs its teardown. Returns false for an
    /// unknown id.
    pub fn unplug(&self, id: PluginId) -> bool {
        let removed = {
            let mut plugins = self.inner.plugins.write();
            let Some(position) = plugins.iter().position(|entry| entry.id == id) else {
                return false;
            };
            let mut next = Vec::clone(&plugins);
            let removed = next.remove(position);
            *plugins = Arc::new(next);
            removed
        };

        tracing::debug!(plugin = removed.plugin.name(), %id, "unplug");
        removed.plugin.teardown();
        self.resolve_all();
        true
    }

    /// First registered plugin of type `T`.
    pub fn find<T: Plugin>(&self) -> Option<Arc<T>> {
        self.plugins().iter().find_map(downcast::<T>)
    }

    /// First plugin of type `T` registered before `me`. A plugin that is
    /// not registered yet sees every registered plugin as before it.
    pub fn find_before<T: Plugin>(&self, me: &dyn Plugin) -> Option<Arc<T>> {
        let plugins = self.plugins();
        let limit = plugins
            .iter()
            .position(|entry| plugin_addr(entry.plugin.as_ref()) == plugin_addr(me))
            .unwrap_or(plugins.len());

        plugins[..limit].iter().find_map(downcast::<T>)
    }

    /// Like [`Session::find_before`], logging a one-time warning when the
    /// dependency is missing or registered too late.
    pub fn require_before<T: Plugin>(&self, me: &dyn Plugin, dependency: &str) -> Option<Arc<T>> {
        let found = self.find_before::<T>(me);
        if found.is_none() {
            self.warn_once(&format!(
                "{dependency} plugin not found; it must be registered before the {} plugin",
                me.name()
            ));
        }
        found
    }

    /// Logs `message` once per session.
    pub fn warn_once(&self, message: &str) -> bool {
        self.inner.warnings.warn(self.logger(), message)
    }

    fn transforms_for(&self, subscription: &SubscriptionRef) -> Vec<Arc<dyn Transform>> {
        self.plugins()
            .iter()
            .filter_map(|entry| entry.plugin.select(subscription))
            .collect()
    }

    fn live_cells(&self) -> Vec<Arc<SubscriptionCell>> {
        let mut live = self.inner.live.lock();
        live.retain(|_, cell| cell.strong_count() > 0);
        live.values().filter_map(Weak::upgrade).collect()
    }

    /// Re-selects the transforms of every live subscription.
    fn resolve_all(&self) {
        for cell in self.live_cells() {
            if let Some(reference) = cell.reference() {
                let transforms = self.transforms_for(reference);
                cell.resolve(transforms);
            }
        }
    }

    /// Stops intercepting: plugins are torn down in registration order,
    /// relays are detached and the session is uninstalled. Calling it again
    /// does nothing.
    pub fn teardown(&self) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let plugins = std::mem::take(&mut *self.inner.plugins.write());
        for entry in plugins.iter() {
            entry.plugin.teardown();
        }
        for cell in self.live_cells() {
            cell.resolve(Vec::new());
        }
        self.inner.live.lock().clear();
        global::release(self);
        tracing::debug!("session torn down");
    }

    // --- Conveniences ---

    /// Snapshot of everything the graph currently holds.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot_with(SnapshotOptions::default())
    }

    pub fn snapshot_with(&self, options: SnapshotOptions) -> Option<Snapshot> {
        let Some(plugin) = self.find::<SnapshotPlugin>() else {
            self.warn_once("Snapshot plugin not found");
            return None;
        };
        Some(plugin.snapshot_all(self, options))
    }

    /// Runs a query and logs its rendered result.
    pub fn query(&self, request: QueryRequest) -> Result<QueryResult> {
        let result = query::execute(self, &request)?;
        result.log(self.logger());
        Ok(result)
    }

    /// Pauses matching subscriptions behind a new deck.
    pub fn pause(&self, matcher: impl Into<Match>) -> Arc<Deck> {
        let plugin = PausePlugin::new(matcher.into());
        let deck = plugin.deck();
        self.plug(plugin);
        deck
    }

    /// Unplugs the pause plugin owning `deck`, resuming it.
    pub fn release(&self, deck: &Arc<Deck>) -> bool {
        let id = self.plugins().iter().find_map(|entry| {
            let plugin = (*entry.plugin).as_any().downcast_ref::<PausePlugin>()?;
            Arc::ptr_eq(&plugin.deck(), deck).then_some(entry.id)
        });
        id.is_some_and(|id| self.unplug(id))
    }

    /// Logs the lifecycle of matching subscriptions.
    pub fn log(&self, matcher: impl Into<Match>) -> PluginId {
        let plugin = LogPlugin::new(
            matcher.into(),
            self.inner.config.audit,
            Arc::clone(&self.inner.config.logger),
            self.scheduler(),
        );
        self.plug(plugin)
    }

    /// Listens to lifecycle events over a bounded channel.
    pub fn events(&self, filter: EventFilter) -> EventsHandle {
        self.find_or_plug(EventsPlugin::new).listen(filter)
    }

    /// Logs what changed since the previous sweep under `key`.
    pub fn sweep(&self, key: &str) -> Option<SnapshotDiff> {
        self.find_or_plug(SweepPlugin::new).sweep(self, key)
    }

    fn find_or_plug<T: Plugin>(&self, create: impl FnOnce() -> T) -> Arc<T> {
        match self.find::<T>() {
            Some(plugin) => plugin,
            None => {
                let plugin = Arc::new(create());
                self.plug_arc(plugin.clone());
                plugin
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.plugins().iter().map(|e| e.plugin.name()).collect();
        f.debug_struct("Session")
            .field("tick", &self.tick())
            .field("active", &self.is_active())
            .field("plugins", &names)
            .finish()
    }
}

fn downcast<T: Plugin>(entry: &PluginEntry) -> Option<Arc<T>> {
    if !(*entry.plugin).as_any().is::<T>() {
        return None;
    }
    Arc::clone(&entry.plugin).into_any().downcast::<T>().ok()
}

fn before(plugin: &dyn Plugin, session: &Session, event: Event<'_>, subscription: &SubscriptionRef) {
    match event {
        Event::Subscribe => plugin.before_subscribe(session, subscription),
        Event::Next(value) => plugin.before_next(session, subscription, value),
        Event::Error(error) => plugin.before_error(session, subscription, error),
        Event::Complete => plugin.before_complete(session, subscription),
        Event::Unsubscribe => plugin.before_unsubscribe(session, subscription),
    }
}

fn after(plugin: &dyn Plugin, session: &Session, event: Event<'_>, subscription: &SubscriptionRef) {
    match event {
        Event::Subscribe => plugin.after_subscribe(session, subscription),
        Event::Next(value) => plugin.after_next(session, subscription, value),
        Event::Error(error) => plugin.after_error(session, subscription, error),
        Event::Complete => plugin.after_complete(session, subscription),
        Event::Unsubscribe => plugin.after_unsubscribe(session, subscription),
    }
}
