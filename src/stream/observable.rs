//! Observables, observers and teardown logic.

use super::subscriber::{Subscriber, Subscription, SubscriptionCell};
use crate::identity;
use crate::session;
use crate::types::{Notification, ObservableId, StackFrame, Value};
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, OnceLock, Weak};

/// Producer run once per activation.
pub type Producer = dyn Fn(Subscriber) -> Teardown + Send + Sync;

/// Receives the notifications of one activation.
pub trait Observer: Send {
    fn next(&mut self, value: Value);

    fn error(&mut self, error: Value) {
        let _ = error;
    }

    fn complete(&mut self) {}

    fn accept(&mut self, notification: Notification) {
        match notification {
            Notification::Next(value) => self.next(value),
            Notification::Error(error) => self.error(error),
            Notification::Complete => self.complete(),
        }
    }
}

impl<F> Observer for F
where
    F: FnMut(Notification) + Send,
{
    fn next(&mut self, value: Value) {
        self(Notification::Next(value))
    }

    fn error(&mut self, error: Value) {
        self(Notification::Error(error))
    }

    fn complete(&mut self) {
        self(Notification::Complete)
    }
}

/// Cleanup returned by a producer, run when its activation closes.
#[derive(Default)]
pub enum Teardown {
    #[default]
    Empty,
    Call(Box<dyn FnOnce() + Send>),
    Unsubscribe(Subscription),
    Many(Vec<Teardown>),
}

impl Teardown {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Teardown::Call(Box::new(f))
    }

    pub fn run(self) {
        match self {
            Teardown::Empty => {}
            Teardown::Call(f) => f(),
            Teardown::Unsubscribe(subscription) => subscription.unsubscribe(),
            Teardown::Many(all) => all.into_iter().for_each(Teardown::run),
        }
    }
}

impl From<Subscription> for Teardown {
    fn from(subscription: Subscription) -> Self {
        Teardown::Unsubscribe(subscription)
    }
}

impl From<Vec<Teardown>> for Teardown {
    fn from(all: Vec<Teardown>) -> Self {
        Teardown::Many(all)
    }
}

struct ObservableInner {
    id: OnceLock<ObservableId>,
    tag: Option<String>,
    kind: &'static str,
    site: StackFrame,
    producer: Arc<Producer>,
}

/// A value-producing stream. Cheap to clone; clones share one identity.
#[derive(Clone)]
pub struct Observable {
    inner: Arc<ObservableInner>,
}

impl Observable {
    /// Creates an observable from a producer. The producer runs once per
    /// subscription and returns the teardown for that subscription.
    #[track_caller]
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(Subscriber) -> Teardown + Send + Sync + 'static,
    {
        let function = function_name::<F>();
        Self::build("new", Location::caller(), function, Arc::new(producer))
    }

    pub(crate) fn build(
        kind: &'static str,
        location: &'static Location<'static>,
        function: Option<String>,
        producer: Arc<Producer>,
    ) -> Self {
        Self {
            inner: Arc::new(ObservableInner {
                id: OnceLock::new(),
                tag: None,
                kind,
                site: StackFrame::from_location(location, function),
                producer,
            }),
        }
    }

    /// Identity, assigned on first use and stable afterwards.
    pub fn id(&self) -> ObservableId {
        *self.inner.id.get_or_init(identity::next_observable_id)
    }

    pub fn tag(&self) -> Option<&str> {
        self.inner.tag.as_deref()
    }

    /// Operator that produced this observable (`"new"`, `"map"`, ...).
    pub fn kind(&self) -> &'static str {
        self.inner.kind
    }

    /// Where the observable was created.
    pub fn site(&self) -> &StackFrame {
        &self.inner.site
    }

    /// A tagged observable sharing this one's producer, with its own identity.
    #[track_caller]
    pub fn with_tag(&self, tag: impl Into<String>) -> Observable {
        Observable {
            inner: Arc::new(ObservableInner {
                id: OnceLock::new(),
                tag: Some(tag.into()),
                kind: self.inner.kind,
                site: StackFrame::from_location(Location::caller(), self.inner.site.function.clone()),
                producer: Arc::clone(&self.inner.producer),
            }),
        }
    }

    pub fn ptr_eq(&self, other: &Observable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A handle that does not keep the producer alive.
    pub fn downgrade(&self) -> WeakObservable {
        WeakObservable {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Activates the observable, through the installed session if any.
    #[track_caller]
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer + 'static,
    {
        match session::installed() {
            Some(session) => session.subscribe(self, observer),
            None => self.subscribe_direct(observer),
        }
    }

    /// Activates the observable without instrumentation.
    pub fn subscribe_direct<O>(&self, observer: O) -> Subscription
    where
        O: Observer + 'static,
    {
        let cell = Arc::new(SubscriptionCell::direct(Box::new(observer)));
        let teardown = self.produce(Subscriber::new(Arc::clone(&cell), None));
        cell.add(teardown);
        Subscription::new(cell)
    }

    pub(crate) fn produce(&self, subscriber: Subscriber) -> Teardown {
        (self.inner.producer)(subscriber)
    }
}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.id())
            .field("tag", &self.tag())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Non-owning [`Observable`] handle.
#[derive(Clone)]
pub struct WeakObservable {
    inner: Weak<ObservableInner>,
}

impl WeakObservable {
    pub fn upgrade(&self) -> Option<Observable> {
        self.inner.upgrade().map(|inner| Observable { inner })
    }
}

impl fmt::Debug for WeakObservable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(observable) => write!(f, "WeakObservable({})", observable.id()),
            None => f.write_str("WeakObservable(dropped)"),
        }
    }
}

/// Path of the function that defined closure `F`, if `F` is a closure.
pub(crate) fn function_name<F>() -> Option<String> {
    let mut name = std::any::type_name::<F>();
    let mut trimmed = false;
    while let Some(stripped) = name.strip_suffix("::{{closure}}") {
        name = stripped;
        trimmed = true;
    }
    trimmed.then(|| name.to_string())
}
