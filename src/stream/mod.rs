//! Minimal push-based stream runtime observed by a [`Session`](crate::Session).
//!
//! Producers receive a [`Subscriber`]; consumers hold a [`Subscription`].
//! Inner activations made through [`Subscriber::subscribe`] stay in the
//! context of the outer activation.

mod observable;
mod operators;
mod subject;
mod subscriber;

pub use observable::{Observable, Observer, Producer, Teardown, WeakObservable};
pub use subject::Subject;
pub use subscriber::{Subscriber, Subscription, SubscriptionRef};

pub(crate) use subscriber::SubscriptionCell;
