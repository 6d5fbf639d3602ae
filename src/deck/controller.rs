//! The deck: a pausable buffer spliced into matched subscriptions.

use crate::session::relay::{Emit, Stage, Transform};
use crate::stream::SubscriptionRef;
use crate::types::{Notification, SubscriptionId};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Capacity of each stats listener's channel. Stats that do not fit are
/// skipped for that listener.
const STATS_BUFFER: usize = 64;

/// State broadcast to [`Deck::stats`] listeners on every change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DeckStats {
    pub notification_count: usize,
    pub paused: bool,
}

struct Entry {
    downstream: Emit,
    /// Bumped each time the subscription's relay is rebuilt.
    generation: u64,
    /// A terminal was released or discarded.
    terminated: bool,
}

struct DeckState {
    paused: bool,
    torn_down: bool,
    queue: VecDeque<(SubscriptionId, Notification)>,
    entries: HashMap<SubscriptionId, Entry>,
    listeners: Vec<Sender<DeckStats>>,
}

impl DeckState {
    fn stats(&self) -> DeckStats {
        DeckStats {
            notification_count: self.queue.len(),
            paused: self.paused,
        }
    }

    fn broadcast(&mut self) {
        let stats = self.stats();
        self.listeners.retain(|listener| match listener.try_send(stats) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Removes the oldest queued notification, marking its subscription
    /// terminated if it ends it.
    fn pop(&mut self) -> Option<(Option<Emit>, Notification)> {
        let (id, notification) = self.queue.pop_front()?;
        let downstream = self.entries.get_mut(&id).map(|entry| {
            if notification.is_terminal() {
                entry.terminated = true;
            }
            Arc::clone(&entry.downstream)
        });
        Some((downstream, notification))
    }
}

/// Buffers the notifications of every subscription it is attached to while
/// paused, in arrival order across subscriptions.
///
/// A subscription's buffered notifications survive relay rebuilds: a new
/// attachment takes over the entry and the stale stage's teardown is ignored.
/// Buffers are unbounded.
pub struct Deck {
    state: Arc<Mutex<DeckState>>,
}

impl Deck {
    /// A deck that starts paused.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeckState {
                paused: true,
                torn_down: false,
                queue: VecDeque::new(),
                entries: HashMap::new(),
                listeners: Vec::new(),
            })),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Number of buffered notifications.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Buffered notifications, oldest first.
    pub fn notifications(&self) -> Vec<(SubscriptionId, Notification)> {
        self.state.lock().queue.iter().cloned().collect()
    }

    pub fn current_stats(&self) -> DeckStats {
        self.state.lock().stats()
    }

    /// Receives the current stats immediately, then every change.
    pub fn stats(&self) -> Receiver<DeckStats> {
        let (sender, receiver) = bounded(STATS_BUFFER);
        let mut state = self.state.lock();
        let _ = sender.try_send(state.stats());
        state.listeners.push(sender);
        receiver
    }

    /// Starts buffering again.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.torn_down || state.paused {
            return;
        }
        state.paused = true;
        state.broadcast();
        tracing::debug!("deck paused");
    }

    /// Releases everything buffered, in order, then passes notifications
    /// straight through.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            if !state.paused {
                return;
            }
            state.paused = false;
            state.broadcast();
        }
        tracing::debug!("deck resumed");
        self.drain();
    }

    /// Releases the oldest buffered notification. Returns false if there
    /// was none.
    pub fn step(&self) -> bool {
        let released = {
            let mut state = self.state.lock();
            let released = state.pop();
            if released.is_some() {
                state.broadcast();
            }
            released
        };
        match released {
            Some((downstream, notification)) => {
                if let Some(downstream) = downstream {
                    downstream(notification);
                }
                true
            }
            None => false,
        }
    }

    /// Discards the oldest buffered notification without releasing it.
    pub fn skip(&self) -> bool {
        let mut state = self.state.lock();
        let skipped = state.pop().is_some();
        if skipped {
            state.broadcast();
        }
        skipped
    }

    /// Discards every buffered notification.
    pub fn clear(&self) -> usize {
        self.clear_where(|_, _| true)
    }

    /// Discards the buffered notifications `predicate` selects.
    pub fn clear_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(SubscriptionId, &Notification) -> bool,
    {
        let mut state = self.state.lock();
        let before = state.queue.len();
        let mut kept = VecDeque::with_capacity(before);
        let mut ended = Vec::new();
        for (id, notification) in state.queue.drain(..) {
            if predicate(id, &notification) {
                if notification.is_terminal() {
                    ended.push(id);
                }
            } else {
                kept.push_back((id, notification));
            }
        }
        state.queue = kept;
        for id in ended {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.terminated = true;
            }
        }

        let cleared = before - state.queue.len();
        if cleared > 0 {
            state.broadcast();
        }
        cleared
    }

    /// Force-resumes and detaches from every subscription. Later
    /// notifications pass straight through.
    pub fn teardown(&self) {
        self.resume();
        let mut state = self.state.lock();
        state.torn_down = true;
        state.entries.clear();
        state.listeners.clear();
    }

    fn drain(&self) {
        loop {
            let released = {
                let mut state = self.state.lock();
                if state.paused {
                    return;
                }
                let released = state.pop();
                if released.is_some() {
                    state.broadcast();
                }
                released
            };
            match released {
                Some((Some(downstream), notification)) => downstream(notification),
                Some((None, _)) => {}
                None => return,
            }
        }
    }
}

impl Default for Deck {
    fn default() -> Self {
        Self::new()
    }
}

fn input(state: &Mutex<DeckState>, id: SubscriptionId, downstream: &Emit, notification: Notification) {
    {
        let mut state = state.lock();
        if !state.torn_down {
            if state.entries.get(&id).is_some_and(|entry| entry.terminated) {
                return;
            }
            if state.paused || !state.queue.is_empty() {
                state.queue.push_back((id, notification));
                state.broadcast();
                return;
            }
        }
    }
    downstream(notification);
}

/// Drops a subscription's entry and buffer, unless a newer attachment
/// took it over.
fn detach(state: &Mutex<DeckState>, id: SubscriptionId, generation: u64) {
    let mut state = state.lock();
    let current = state
        .entries
        .get(&id)
        .is_some_and(|entry| entry.generation == generation);
    if !current {
        return;
    }
    state.entries.remove(&id);
    let before = state.queue.len();
    state.queue.retain(|(queued, _)| *queued != id);
    if state.queue.len() != before {
        state.broadcast();
    }
}

impl Transform for Deck {
    fn attach(&self, subscription: &SubscriptionRef, downstream: Emit) -> Stage {
        let id = subscription.id();
        let generation = {
            let mut state = self.state.lock();
            let entry = state.entries.entry(id).or_insert_with(|| Entry {
                downstream: Arc::clone(&downstream),
                generation: 0,
                terminated: false,
            });
            entry.downstream = Arc::clone(&downstream);
            entry.generation += 1;
            entry.generation
        };

        let state = Arc::clone(&self.state);
        let emit: Emit = Arc::new(move |notification: Notification| {
            input(&state, id, &downstream, notification)
        });
        let state = Arc::clone(&self.state);
        Stage::new(emit).with_teardown(move || detach(&state, id, generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Observable;
    use serde_json::json;
    use std::panic::Location;

    fn attached(deck: &Arc<Deck>) -> (Emit, Stage, Arc<Mutex<Vec<Notification>>>) {
        let reference = SubscriptionRef::new(Observable::never(), Location::caller());
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        let downstream: Emit = Arc::new(move |n: Notification| sink.lock().push(n));
        let stage = deck.attach(&reference, downstream);
        (Arc::clone(&stage.input), stage, out)
    }

    #[test]
    fn test_resume_releases_in_arrival_order() {
        let deck = Arc::new(Deck::new());
        let (input, _stage, out) = attached(&deck);

        for n in 0..3 {
            input(Notification::Next(json!(n)));
        }
        assert!(out.lock().is_empty());
        assert_eq!(deck.len(), 3);

        deck.resume();
        let expected: Vec<_> = (0..3).map(|n| Notification::Next(json!(n))).collect();
        assert_eq!(*out.lock(), expected);

        input(Notification::Next(json!(3)));
        assert_eq!(out.lock().len(), 4);
    }

    #[test]
    fn test_step_and_skip() {
        let deck = Arc::new(Deck::new());
        let (input, _stage, out) = attached(&deck);
        for n in 0..3 {
            input(Notification::Next(json!(n)));
        }

        assert!(deck.step());
        assert!(deck.skip());
        assert_eq!(*out.lock(), vec![Notification::Next(json!(0))]);
        assert_eq!(deck.notifications().len(), 1);
    }

    #[test]
    fn test_nothing_accepted_after_released_terminal() {
        let deck = Arc::new(Deck::new());
        let (input, _stage, out) = attached(&deck);
        input(Notification::Complete);
        deck.step();
        input(Notification::Next(json!("late")));

        assert_eq!(*out.lock(), vec![Notification::Complete]);
        assert!(deck.is_empty());
    }

    #[test]
    fn test_clear_where_discards_selected() {
        let deck = Arc::new(Deck::new());
        let (input, _stage, out) = attached(&deck);
        for n in 0..4 {
            input(Notification::Next(json!(n)));
        }

        let cleared = deck.clear_where(|_, n| matches!(n, Notification::Next(v) if v.as_i64().unwrap_or(0) % 2 == 0));
        assert_eq!(cleared, 2);
        deck.resume();
        assert_eq!(
            *out.lock(),
            vec![Notification::Next(json!(1)), Notification::Next(json!(3))]
        );
    }

    #[test]
    fn test_stats_broadcast() {
        let deck = Arc::new(Deck::new());
        let stats = deck.stats();
        let (input, _stage, _out) = attached(&deck);

        input(Notification::Next(json!(1)));
        deck.resume();

        let seen: Vec<DeckStats> = stats.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                DeckStats { notification_count: 0, paused: true },
                DeckStats { notification_count: 1, paused: true },
                DeckStats { notification_count: 1, paused: false },
                DeckStats { notification_count: 0, paused: false },
            ]
        );
    }

    #[test]
    fn test_stale_stage_teardown_keeps_buffer() {
        let deck = Arc::new(Deck::new());
        let reference = SubscriptionRef::new(Observable::never(), Location::caller());
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        let downstream: Emit = Arc::new(move |n: Notification| sink.lock().push(n));

        let first = deck.attach(&reference, Arc::clone(&downstream));
        (first.input)(Notification::Next(json!("kept")));
        let second = deck.attach(&reference, downstream);
        if let Some(teardown) = first.teardown {
            teardown();
        }
        assert_eq!(deck.len(), 1);

        if let Some(teardown) = second.teardown {
            teardown();
        }
        assert!(deck.is_empty());
        assert!(out.lock().is_empty());
    }
}
