//! Read-only lifecycle event surface.
//!
//! Listeners receive [`SpyEvent`]s over bounded channels:
//! - one event per subscribe, next, error, complete and unsubscribe
//! - filtered by event kind and by [`Match`](crate::Match)
//! - a listener that falls `buffer_size` events behind is dropped
//!
//! # Example
//!
//! ```ignore
//! let handle = session.events(EventFilter::matching("people"));
//!
//! loop {
//!     match handle.recv() {
//!         Ok(SpyEvent::Lifecycle { kind, value, .. }) => println!("{kind}: {value:?}"),
//!         Ok(SpyEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod plugin;
mod types;

pub use manager::EventsManager;
pub use plugin::EventsPlugin;
pub use types::{DropReason, EventFilter, EventsHandle, ListenerId, SpyEvent};
