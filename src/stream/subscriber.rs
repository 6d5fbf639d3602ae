//! Activation state: the per-subscription cell, the producer-facing
//! [`Subscriber`] and the consumer-facing [`Subscription`] handle.
//!
//! A cell moves notifications through three steps:
//! `push` (source side, optionally into a relay) → `dispatch` (hooks, exactly
//! one terminal) → `deliver` (the observer, reentrant calls queued).

use super::observable::{Observable, Observer, Teardown};
use crate::identity;
use crate::session::relay::{Relay, Transform};
use crate::session::{Event, Session};
use crate::types::{Notification, StackFrame, SubscriberId, SubscriptionId, Value};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

struct SubscriptionInfo {
    id: SubscriptionId,
    subscriber: SubscriberId,
    observable: Observable,
    site: StackFrame,
}

/// What plugins see of a live subscription.
#[derive(Clone)]
pub struct SubscriptionRef {
    info: Arc<SubscriptionInfo>,
}

impl SubscriptionRef {
    pub(crate) fn new(observable: Observable, location: &'static Location<'static>) -> Self {
        Self {
            info: Arc::new(SubscriptionInfo {
                id: identity::next_subscription_id(),
                subscriber: identity::next_subscriber_id(),
                observable,
                site: StackFrame::from_location(location, None),
            }),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.info.id
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.info.subscriber
    }

    pub fn observable(&self) -> &Observable {
        &self.info.observable
    }

    /// Where `subscribe` was called.
    pub fn site(&self) -> &StackFrame {
        &self.info.site
    }
}

impl fmt::Debug for SubscriptionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRef")
            .field("id", &self.info.id)
            .field("observable", &self.info.observable.id())
            .field("tag", &self.info.observable.tag())
            .finish()
    }
}

#[derive(Default)]
struct CellState {
    /// The producer has sent a terminal notification.
    source_done: bool,
    /// A terminal notification has passed the hooks.
    terminated: bool,
    closed: bool,
    teardowns: Vec<Teardown>,
}

struct Destination {
    observer: Option<Box<dyn Observer>>,
    busy: bool,
    backlog: VecDeque<Notification>,
}

/// Shared state of one activation.
pub(crate) struct SubscriptionCell {
    reference: Option<SubscriptionRef>,
    session: Option<Session>,
    state: Mutex<CellState>,
    destination: Mutex<Destination>,
    relay: Mutex<Option<Relay>>,
}

impl SubscriptionCell {
    pub(crate) fn direct(observer: Box<dyn Observer>) -> Self {
        Self::build(None, None, observer)
    }

    pub(crate) fn instrumented(
        reference: SubscriptionRef,
        session: Session,
        observer: Box<dyn Observer>,
    ) -> Self {
        Self::build(Some(reference), Some(session), observer)
    }

    fn build(
        reference: Option<SubscriptionRef>,
        session: Option<Session>,
        observer: Box<dyn Observer>,
    ) -> Self {
        Self {
            reference,
            session,
            state: Mutex::new(CellState::default()),
            destination: Mutex::new(Destination {
                observer: Some(observer),
                busy: false,
                backlog: VecDeque::new(),
            }),
            relay: Mutex::new(None),
        }
    }

    pub(crate) fn reference(&self) -> Option<&SubscriptionRef> {
        self.reference.as_ref()
    }

    /// The session and reference, while the session is still intercepting.
    fn hooks(&self) -> Option<(&Session, &SubscriptionRef)> {
        match (&self.session, &self.reference) {
            (Some(session), Some(reference)) if session.is_active() => Some((session, reference)),
            _ => None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Adds cleanup; runs it right away if the cell is already closed.
    pub(crate) fn add(&self, teardown: Teardown) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            teardown.run();
        } else {
            state.teardowns.push(teardown);
        }
    }

    /// Source side: routes through the relay when one is installed.
    pub(crate) fn push(self: &Arc<Self>, notification: Notification) {
        {
            let mut state = self.state.lock();
            if state.closed || state.source_done {
                return;
            }
            if notification.is_terminal() {
                state.source_done = true;
            }
        }

        let input = self.relay.lock().as_ref().map(Relay::input);
        match input {
            Some(input) => input(notification),
            None => self.dispatch(notification),
        }
    }

    /// Runs the before/deliver/after protocol for one notification.
    pub(crate) fn dispatch(self: &Arc<Self>, notification: Notification) {
        let terminal = notification.is_terminal();
        {
            let mut state = self.state.lock();
            if state.closed || state.terminated {
                return;
            }
            if terminal {
                state.terminated = true;
            }
        }

        match self.hooks() {
            Some((session, reference)) => {
                let delivered = notification.clone();
                let event = match &notification {
                    Notification::Next(value) => Event::Next(value),
                    Notification::Error(error) => Event::Error(error),
                    Notification::Complete => Event::Complete,
                };
                session.dispatch(event, reference, || self.deliver(delivered));
            }
            None => self.deliver(notification),
        }

        if terminal {
            self.unsubscribe();
        }
    }

    /// Hands a notification to the observer. A reentrant call made while the
    /// observer is running is queued and drained by the outer call.
    fn deliver(&self, notification: Notification) {
        let mut observer = {
            let mut destination = self.destination.lock();
            if destination.busy {
                destination.backlog.push_back(notification);
                return;
            }
            match destination.observer.take() {
                Some(observer) => {
                    destination.busy = true;
                    observer
                }
                None => return,
            }
        };

        let mut pending = Some(notification);
        while let Some(notification) = pending.take() {
            observer.accept(notification);

            let mut destination = self.destination.lock();
            pending = destination.backlog.pop_front();
            if pending.is_none() {
                destination.busy = false;
                if !self.is_closed() {
                    destination.observer = Some(observer);
                    return;
                }
            }
        }
    }

    pub(crate) fn unsubscribe(self: &Arc<Self>) {
        let teardowns = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.teardowns)
        };

        let release = || {
            let relay = self.relay.lock().take();
            if let Some(relay) = relay {
                relay.teardown();
            }
            for teardown in teardowns {
                teardown.run();
            }
            let observer = {
                let mut destination = self.destination.lock();
                destination.backlog.clear();
                destination.observer.take()
            };
            drop(observer);
        };

        match self.hooks() {
            Some((session, reference)) => {
                session.dispatch(Event::Unsubscribe, reference, release);
                session.forget(reference.id());
            }
            None => release(),
        }
    }

    /// Installs, swaps or removes the relay for the given transform chain.
    /// An identical chain keeps the existing relay (and whatever it buffers).
    /// The replacement is attached before the previous relay detaches.
    pub(crate) fn resolve(self: &Arc<Self>, transforms: Vec<Arc<dyn Transform>>) {
        let unchanged = match self.relay.lock().as_ref() {
            Some(current) => current.uses(&transforms),
            None => transforms.is_empty(),
        };
        if unchanged {
            return;
        }

        let next = match &self.reference {
            Some(reference) if !transforms.is_empty() && !self.is_closed() => {
                let weak = Arc::downgrade(self);
                Some(Relay::build(
                    reference,
                    transforms,
                    Arc::new(move |notification: Notification| {
                        if let Some(cell) = weak.upgrade() {
                            cell.dispatch(notification);
                        }
                    }),
                ))
            }
            _ => None,
        };

        let previous = std::mem::replace(&mut *self.relay.lock(), next);
        if let Some(previous) = previous {
            previous.teardown();
        }
    }
}

/// Producer-facing side of an activation.
#[derive(Clone)]
pub struct Subscriber {
    cell: Arc<SubscriptionCell>,
    context: Option<Session>,
}

impl Subscriber {
    pub(crate) fn new(cell: Arc<SubscriptionCell>, context: Option<Session>) -> Self {
        Self { cell, context }
    }

    pub fn next(&self, value: Value) {
        self.cell.push(Notification::Next(value));
    }

    pub fn error(&self, error: Value) {
        self.cell.push(Notification::Error(error));
    }

    pub fn complete(&self) {
        self.cell.push(Notification::Complete);
    }

    pub fn notify(&self, notification: Notification) {
        self.cell.push(notification);
    }

    pub fn is_closed(&self) -> bool {
        self.cell.is_closed()
    }

    /// Registers cleanup for this activation.
    pub fn add(&self, teardown: impl Into<Teardown>) {
        self.cell.add(teardown.into());
    }

    /// Identity of this activation, when it is instrumented.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.cell.reference().map(SubscriptionRef::id)
    }

    /// Subscribes to an upstream observable in the same context as this
    /// activation, so inner activations are observed by the same session.
    #[track_caller]
    pub fn subscribe<O>(&self, source: &Observable, observer: O) -> Subscription
    where
        O: Observer + 'static,
    {
        match &self.context {
            Some(session) => session.subscribe(source, observer),
            None => source.subscribe(observer),
        }
    }
}

/// Consumer-facing handle of an activation.
#[derive(Clone)]
pub struct Subscription {
    cell: Arc<SubscriptionCell>,
}

impl Subscription {
    pub(crate) fn new(cell: Arc<SubscriptionCell>) -> Self {
        Self { cell }
    }

    /// Closes the activation. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        self.cell.unsubscribe();
    }

    pub fn is_closed(&self) -> bool {
        self.cell.is_closed()
    }

    /// Identity of the activation, when it is instrumented.
    pub fn id(&self) -> Option<SubscriptionId> {
        self.cell.reference().map(SubscriptionRef::id)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
