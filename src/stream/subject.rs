//! Hot multicast source.

use super::observable::{Observable, Teardown};
use super::subscriber::Subscriber;
use crate::types::{Notification, Value};
use parking_lot::Mutex;
use std::panic::Location;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct SubjectState {
    next_key: u64,
    observers: Vec<(u64, Subscriber)>,
    terminal: Option<Notification>,
}

struct SubjectInner {
    state: Mutex<SubjectState>,
    observable: Observable,
}

/// Pushes values to every current subscriber. Late subscribers only see
/// the terminal notification, if one was sent.
#[derive(Clone)]
pub struct Subject {
    inner: Arc<SubjectInner>,
}

impl Subject {
    #[track_caller]
    pub fn new() -> Self {
        let location = Location::caller();
        let inner = Arc::new_cyclic(|weak: &Weak<SubjectInner>| {
            let weak = weak.clone();
            SubjectInner {
                state: Mutex::new(SubjectState::default()),
                observable: Observable::build(
                    "subject",
                    location,
                    None,
                    Arc::new(move |subscriber: Subscriber| match weak.upgrade() {
                        Some(inner) => SubjectInner::attach(&inner, subscriber),
                        None => {
                            subscriber.complete();
                            Teardown::Empty
                        }
                    }),
                ),
            }
        });
        Self { inner }
    }

    pub fn observable(&self) -> Observable {
        self.inner.observable.clone()
    }

    pub fn next(&self, value: Value) {
        let observers = self.observers();
        for subscriber in observers {
            subscriber.next(value.clone());
        }
    }

    pub fn error(&self, error: Value) {
        self.terminate(Notification::Error(error));
    }

    pub fn complete(&self) {
        self.terminate(Notification::Complete);
    }

    /// Number of attached subscribers.
    pub fn observer_count(&self) -> usize {
        self.inner.state.lock().observers.len()
    }

    fn observers(&self) -> Vec<Subscriber> {
        let state = self.inner.state.lock();
        if state.terminal.is_some() {
            return Vec::new();
        }
        state.observers.iter().map(|(_, s)| s.clone()).collect()
    }

    fn terminate(&self, notification: Notification) {
        let observers = {
            let mut state = self.inner.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(notification.clone());
            std::mem::take(&mut state.observers)
        };
        for (_, subscriber) in observers {
            subscriber.notify(notification.clone());
        }
    }
}

impl Default for Subject {
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

impl SubjectInner {
    fn attach(inner: &Arc<Self>, subscriber: Subscriber) -> Teardown {
        let key = {
            let mut state = inner.state.lock();
            if let Some(terminal) = state.terminal.clone() {
                drop(state);
                subscriber.notify(terminal);
                return Teardown::Empty;
            }
            state.next_key += 1;
            let key = state.next_key;
            state.observers.push((key, subscriber));
            key
        };

        let weak = Arc::downgrade(inner);
        Teardown::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().observers.retain(|(k, _)| *k != key);
            }
        })
    }
}
