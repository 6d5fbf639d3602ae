//! Swappable pipe stage spliced between a producer and its hooks.
//!
//! A relay is built from the transforms selected by the plugins, composed so
//! the first registered plugin sits closest to the source. Its final emitter
//! delivers through the normal hook path, which accepts one terminal only.

use crate::stream::SubscriptionRef;
use crate::types::Notification;
use std::sync::Arc;

/// Receives materialized notifications.
pub type Emit = Arc<dyn Fn(Notification) + Send + Sync>;

/// One attached transform: where upstream pushes, and how to detach.
pub struct Stage {
    pub input: Emit,
    pub teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Stage {
    pub fn new(input: Emit) -> Self {
        Self {
            input,
            teardown: None,
        }
    }

    #[must_use]
    pub fn with_teardown<F>(mut self, teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.teardown = Some(Box::new(teardown));
        self
    }
}

/// Redirects a subscription's notifications, e.g. to buffer them.
pub trait Transform: Send + Sync {
    /// Attaches to `subscription`, forwarding whatever it releases to
    /// `downstream`.
    fn attach(&self, subscription: &SubscriptionRef, downstream: Emit) -> Stage;
}

pub(crate) struct Relay {
    transforms: Vec<Arc<dyn Transform>>,
    input: Emit,
    teardowns: Vec<Box<dyn FnOnce() + Send>>,
}

impl Relay {
    pub(crate) fn build(
        subscription: &SubscriptionRef,
        transforms: Vec<Arc<dyn Transform>>,
        sink: Emit,
    ) -> Self {
        let mut downstream = sink;
        let mut teardowns = Vec::with_capacity(transforms.len());
        for transform in transforms.iter().rev() {
            let stage = transform.attach(subscription, downstream);
            downstream = stage.input;
            teardowns.extend(stage.teardown);
        }
        // Source-most stage detaches first.
        teardowns.reverse();

        tracing::debug!(
            subscription = %subscription.id(),
            stages = transforms.len(),
            "relay attached"
        );

        Self {
            transforms,
            input: downstream,
            teardowns,
        }
    }

    pub(crate) fn input(&self) -> Emit {
        Arc::clone(&self.input)
    }

    /// Whether this relay was built from exactly these transforms.
    pub(crate) fn uses(&self, transforms: &[Arc<dyn Transform>]) -> bool {
        self.transforms.len() == transforms.len()
            && self
                .transforms
                .iter()
                .zip(transforms)
                .all(|(a, b)| same_transform(a, b))
    }

    pub(crate) fn teardown(self) {
        for teardown in self.teardowns {
            teardown();
        }
    }
}

fn same_transform(a: &Arc<dyn Transform>, b: &Arc<dyn Transform>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Observable;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::panic::Location;

    struct Tagger(&'static str, Arc<Mutex<Vec<&'static str>>>);

    impl Transform for Tagger {
        fn attach(&self, _: &SubscriptionRef, downstream: Emit) -> Stage {
            let label = self.0;
            let detached = Arc::clone(&self.1);
            Stage::new(Arc::new(move |notification: Notification| match notification {
                Notification::Next(value) => {
                    let text = format!("{}{}", value.as_str().unwrap_or_default(), label);
                    downstream(Notification::Next(json!(text)))
                }
                other => downstream(other),
            }))
            .with_teardown(move || detached.lock().push(label))
        }
    }

    #[test]
    fn test_first_transform_is_closest_to_source() {
        let detached = Arc::new(Mutex::new(Vec::new()));
        let transforms: Vec<Arc<dyn Transform>> = vec![
            Arc::new(Tagger("a", Arc::clone(&detached))),
            Arc::new(Tagger("b", Arc::clone(&detached))),
        ];
        let reference = SubscriptionRef::new(Observable::never(), Location::caller());

        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        let relay = Relay::build(
            &reference,
            transforms.clone(),
            Arc::new(move |n: Notification| sink.lock().push(n)),
        );

        (relay.input())(Notification::Next(json!("x")));
        assert_eq!(*out.lock(), vec![Notification::Next(json!("xab"))]);

        assert!(relay.uses(&transforms));
        assert!(!relay.uses(&transforms[..1]));

        relay.teardown();
        assert_eq!(*detached.lock(), vec!["a", "b"]);
    }
}
