//! Event and filter types for lifecycle listeners.

use crate::identity::Match;
use crate::types::{NotificationKind, ObservableId, SubscriptionId, Value};
use serde::Serialize;

/// What a listener wants to receive.
#[derive(Clone, Debug)]
pub struct EventFilter {
    /// Max buffered events before the listener is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    /// Event kinds to receive (None = all kinds).
    pub kinds: Option<Vec<NotificationKind>>,

    /// Only subscriptions this selects (None = all subscriptions).
    pub matcher: Option<Match>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            kinds: None,
            matcher: None,
        }
    }
}

impl EventFilter {
    /// Every event of every subscription.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the given event kinds.
    pub fn kinds(kinds: Vec<NotificationKind>) -> Self {
        Self {
            kinds: Some(kinds),
            ..Default::default()
        }
    }

    /// Only subscriptions `matcher` selects.
    pub fn matching(matcher: impl Into<Match>) -> Self {
        Self {
            matcher: Some(matcher.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// Events delivered to listeners.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpyEvent {
    /// A lifecycle event, sent before it is delivered.
    Lifecycle {
        kind: NotificationKind,
        tick: u64,
        subscription: SubscriptionId,
        observable: ObservableId,
        tag: Option<String>,
        /// The value or error payload, for next and error events.
        value: Option<Value>,
    },

    /// The listener was dropped; nothing follows.
    Dropped { reason: DropReason },
}

/// Why a listener was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly removed.
    Unsubscribed,
    /// The events plugin was unplugged or the session torn down.
    SessionEnded,
}

/// Unique identifier for a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Receiving end of a listener.
pub struct EventsHandle {
    pub id: ListenerId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<SpyEvent>,
}

impl EventsHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<SpyEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<SpyEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<SpyEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything received so far, without blocking.
    pub fn drain(&self) -> Vec<SpyEvent> {
        self.receiver.try_iter().collect()
    }
}
