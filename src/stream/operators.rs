//! Constructors and the handful of operators the instrumentation is
//! exercised with.

use super::observable::{function_name, Observable, Teardown};
use super::subscriber::{Subscriber, Subscription};
use crate::types::{Notification, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

impl Observable {
    /// Emits each value, then completes.
    #[track_caller]
    pub fn of(values: impl IntoIterator<Item = Value>) -> Self {
        let values: Vec<Value> = values.into_iter().collect();
        Self::build(
            "of",
            Location::caller(),
            None,
            Arc::new(move |subscriber: Subscriber| {
                for value in &values {
                    if subscriber.is_closed() {
                        return Teardown::Empty;
                    }
                    subscriber.next(value.clone());
                }
                subscriber.complete();
                Teardown::Empty
            }),
        )
    }

    /// Completes immediately.
    #[track_caller]
    pub fn empty() -> Self {
        Self::build(
            "empty",
            Location::caller(),
            None,
            Arc::new(|subscriber: Subscriber| {
                subscriber.complete();
                Teardown::Empty
            }),
        )
    }

    /// Never emits and never terminates.
    #[track_caller]
    pub fn never() -> Self {
        Self::build(
            "never",
            Location::caller(),
            None,
            Arc::new(|_: Subscriber| Teardown::Empty),
        )
    }

    /// Errors immediately with `error`.
    #[track_caller]
    pub fn throw(error: Value) -> Self {
        Self::build(
            "throw",
            Location::caller(),
            None,
            Arc::new(move |subscriber: Subscriber| {
                subscriber.error(error.clone());
                Teardown::Empty
            }),
        )
    }

    #[track_caller]
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Self::build(
            "map",
            Location::caller(),
            function_name::<F>(),
            Arc::new(move |subscriber: Subscriber| {
                let f = Arc::clone(&f);
                let downstream = subscriber.clone();
                let upstream = subscriber.subscribe(&source, move |notification: Notification| match notification {
                    Notification::Next(value) => downstream.next(f(value)),
                    other => downstream.notify(other),
                });
                Teardown::from(upstream)
            }),
        )
    }

    #[track_caller]
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let source = self.clone();
        let predicate = Arc::new(predicate);
        Self::build(
            "filter",
            Location::caller(),
            function_name::<F>(),
            Arc::new(move |subscriber: Subscriber| {
                let predicate = Arc::clone(&predicate);
                let downstream = subscriber.clone();
                let upstream = subscriber.subscribe(&source, move |notification: Notification| match notification {
                    Notification::Next(value) => {
                        if predicate(&value) {
                            downstream.next(value);
                        }
                    }
                    other => downstream.notify(other),
                });
                Teardown::from(upstream)
            }),
        )
    }

    /// Emits the first `count` values, then completes and unsubscribes
    /// from the source.
    #[track_caller]
    pub fn take(&self, count: usize) -> Self {
        let source = self.clone();
        Self::build(
            "take",
            Location::caller(),
            None,
            Arc::new(move |subscriber: Subscriber| {
                if count == 0 {
                    subscriber.complete();
                    return Teardown::Empty;
                }
                let downstream = subscriber.clone();
                let mut remaining = count;
                let upstream = subscriber.subscribe(&source, move |notification: Notification| match notification {
                    Notification::Next(value) => {
                        if remaining == 0 {
                            return;
                        }
                        remaining -= 1;
                        downstream.next(value);
                        if remaining == 0 {
                            downstream.complete();
                        }
                    }
                    other => downstream.notify(other),
                });
                Teardown::from(upstream)
            }),
        )
    }

    /// Maps each value to an inner observable and merges the inner outputs.
    /// Completes once the source and every inner observable have completed.
    #[track_caller]
    pub fn merge_map<F>(&self, project: F) -> Self
    where
        F: Fn(Value) -> Observable + Send + Sync + 'static,
    {
        let source = self.clone();
        let project = Arc::new(project);
        Self::build(
            "merge_map",
            Location::caller(),
            function_name::<F>(),
            Arc::new(move |subscriber: Subscriber| {
                let merge = Arc::new(Mutex::new(MergeState::default()));
                let inners: Arc<Mutex<HashMap<u64, Subscription>>> = Arc::new(Mutex::new(HashMap::new()));

                let project = Arc::clone(&project);
                let outer_merge = Arc::clone(&merge);
                let outer_inners = Arc::clone(&inners);
                let context = subscriber.clone();
                let downstream = subscriber.clone();

                let outer = subscriber.subscribe(&source, move |notification: Notification| match notification {
                    Notification::Next(value) => {
                        let inner = project(value);
                        let key = outer_merge.lock().inner_started();
                        let ended = Arc::new(AtomicBool::new(false));

                        let merge = Arc::clone(&outer_merge);
                        let downstream = downstream.clone();
                        let inners = Arc::clone(&outer_inners);
                        let inner_ended = Arc::clone(&ended);
                        let release = move || {
                            let finished = {
                                let mut inners = inners.lock();
                                inner_ended.store(true, Ordering::Release);
                                inners.remove(&key)
                            };
                            drop(finished);
                        };
                        let subscription = context.subscribe(&inner, move |notification: Notification| {
                            match notification {
                                Notification::Next(value) => downstream.next(value),
                                Notification::Error(error) => {
                                    release();
                                    downstream.error(error);
                                }
                                Notification::Complete => {
                                    release();
                                    if merge.lock().inner_completed() {
                                        downstream.complete();
                                    }
                                }
                            }
                        });

                        let mut inners = outer_inners.lock();
                        if !ended.load(Ordering::Acquire) {
                            inners.insert(key, subscription);
                        }
                    }
                    Notification::Error(error) => downstream.error(error),
                    Notification::Complete => {
                        if outer_merge.lock().outer_completed() {
                            downstream.complete();
                        }
                    }
                });

                Teardown::Many(vec![
                    Teardown::from(outer),
                    Teardown::new(move || {
                        let open = std::mem::take(&mut *inners.lock());
                        for subscription in open.into_values() {
                            subscription.unsubscribe();
                        }
                    }),
                ])
            }),
        )
    }
}

#[derive(Default)]
struct MergeState {
    active: usize,
    outer_done: bool,
    next_key: u64,
}

impl MergeState {
    /// Counts a new inner activation and returns its key.
    fn inner_started(&mut self) -> u64 {
        self.active += 1;
        self.next_key += 1;
        self.next_key
    }

    /// Returns true when the merged output should complete.
    fn inner_completed(&mut self) -> bool {
        self.active = self.active.saturating_sub(1);
        self.outer_done && self.active == 0
    }

    fn outer_completed(&mut self) -> bool {
        self.outer_done = true;
        self.active == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpyConfig;
    use crate::session::Session;
    use crate::stream::Subject;
    use serde_json::json;

    fn run(observable: &Observable) -> Vec<Notification> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        observable.subscribe_direct(move |n: Notification| sink.lock().push(n));
        let out = seen.lock().clone();
        out
    }

    #[test]
    fn test_map_filter() {
        let source = Observable::of(vec![json!(1), json!(2), json!(3), json!(4)]);
        let doubled_even = source
            .filter(|v| v.as_i64().is_some_and(|n| n % 2 == 0))
            .map(|v| json!(v.as_i64().unwrap_or(0) * 10));

        assert_eq!(
            run(&doubled_even),
            vec![
                Notification::Next(json!(20)),
                Notification::Next(json!(40)),
                Notification::Complete
            ]
        );
    }

    #[test]
    fn test_take_stops_early() {
        let source = Observable::of(vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(
            run(&source.take(2)),
            vec![
                Notification::Next(json!("a")),
                Notification::Next(json!("b")),
                Notification::Complete
            ]
        );
        assert_eq!(run(&source.take(0)), vec![Notification::Complete]);
    }

    #[test]
    fn test_merge_map_waits_for_inners() {
        let source = Observable::of(vec![json!(1), json!(2)]);
        let merged = source.merge_map(|v| Observable::of(vec![v.clone(), v]));

        let seen = run(&merged);
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&Notification::Complete));
    }

    #[test]
    fn test_merge_map_releases_finished_inners() {
        let session = Session::new(SpyConfig::bare());
        let token = Arc::new(());
        let held = Arc::clone(&token);
        let subject = Subject::new();
        let merged = subject.observable().merge_map(move |value| {
            let held = Arc::clone(&held);
            Observable::new(move |subscriber: Subscriber| {
                let _ = &held;
                subscriber.next(value.clone());
                subscriber.complete();
                Teardown::Empty
            })
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = session.subscribe(&merged, move |n: Notification| sink.lock().push(n));
        for n in 0..10 {
            subject.next(json!(n));
        }

        assert_eq!(seen.lock().len(), 10);
        // The test's handle and the projection's copy.
        assert_eq!(Arc::strong_count(&token), 2);
    }

    #[test]
    fn test_merge_map_never_inner_keeps_open() {
        let merged = Observable::of(vec![json!(1)]).merge_map(|_| Observable::never());
        assert_eq!(run(&merged), Vec::<Notification>::new());
    }

    #[test]
    fn test_throw_and_empty() {
        assert_eq!(
            run(&Observable::throw(json!("boom"))),
            vec![Notification::Error(json!("boom"))]
        );
        assert_eq!(run(&Observable::empty()), vec![Notification::Complete]);
    }
}
