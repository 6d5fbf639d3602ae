//! Flow control for matched subscriptions.
//!
//! [`Session::pause`](crate::Session::pause) plugs a [`PausePlugin`] whose
//! [`Deck`] buffers the notifications of every subscription its matcher
//! selects. The deck starts paused. Buffered notifications can be stepped
//! through one at a time, skipped, cleared or released all at once with
//! `resume`. Error and complete notifications are buffered like values;
//! once one is released or discarded the subscription accepts nothing more.
//!
//! ```ignore
//! let deck = session.pause("people");
//! people.next(json!("alice"));   // buffered
//! deck.step();                   // delivered
//! deck.resume();                 // everything else delivered, pass-through
//! ```

mod controller;
mod plugin;

pub use controller::{Deck, DeckStats};
pub use plugin::PausePlugin;
