//! Coalescing scheduler for audited output.
//!
//! `audit(key, task)` defers `task` by the configured duration. Repeated audits
//! of a queued key collapse into one call: the entry keeps its original
//! timestamp, moves to the tail and counts how many audits it swallowed.
//! A single timer is pending per auditor at any time.

use crate::scheduler::{Scheduler, TimerId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Audited work; receives the number of audits that were coalesced into it.
pub type AuditTask = Box<dyn FnOnce(usize) + Send>;

struct AuditEntry {
    key: String,
    task: AuditTask,
    timestamp: Instant,
    /// First-audit order, breaks timestamp ties.
    sequence: u64,
    ignored: usize,
}

#[derive(Default)]
struct AuditState {
    queue: VecDeque<AuditEntry>,
    timer: Option<TimerId>,
    sequence: u64,
}

struct AuditorInner {
    duration: Duration,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<AuditState>,
}

/// Debounces keyed tasks while preserving first-audit order.
#[derive(Clone)]
pub struct Auditor {
    inner: Arc<AuditorInner>,
}

impl Auditor {
    pub fn new(duration: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(AuditorInner {
                duration,
                scheduler,
                state: Mutex::new(AuditState::default()),
            }),
        }
    }

    pub fn duration(&self) -> Duration {
        self.inner.duration
    }

    /// Queues `task` under `key`, or runs it immediately when the duration
    /// is zero.
    pub fn audit<F>(&self, key: impl Into<String>, task: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        if self.inner.duration.is_zero() {
            task(0);
            return;
        }

        let key = key.into();
        let now = self.inner.scheduler.now();
        let mut state = self.inner.state.lock();

        match state.queue.iter().position(|entry| entry.key == key) {
            Some(position) => {
                if let Some(mut entry) = state.queue.remove(position) {
                    entry.ignored += 1;
                    entry.task = Box::new(task);
                    state.queue.push_back(entry);
                }
            }
            None => {
                state.sequence += 1;
                let sequence = state.sequence;
                state.queue.push_back(AuditEntry {
                    key,
                    task: Box::new(task),
                    timestamp: now,
                    sequence,
                    ignored: 0,
                });
            }
        }

        if state.timer.is_none() {
            AuditorInner::arm(&self.inner, &mut state);
        }
    }

    /// Number of queued audits.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Drops every queued audit without running it.
    pub fn teardown(&self) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            self.inner.scheduler.cancel(timer);
        }
        state.queue.clear();
    }
}

impl AuditorInner {
    /// Schedules the timer for the earliest queued deadline.
    fn arm(inner: &Arc<Self>, state: &mut AuditState) {
        let Some(earliest) = state.queue.iter().map(|entry| entry.timestamp).min() else {
            return;
        };
        let delay = (earliest + inner.duration).saturating_duration_since(inner.scheduler.now());
        let weak: Weak<Self> = Arc::downgrade(inner);
        let timer = inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    AuditorInner::fire(&inner);
                }
            }),
        );
        state.timer = Some(timer);
    }

    fn fire(inner: &Arc<Self>) {
        let due = {
            let mut state = inner.state.lock();
            state.timer = None;

            let now = inner.scheduler.now();
            let (mut due, rest): (Vec<_>, Vec<_>) = state
                .queue
                .drain(..)
                .partition(|entry| entry.timestamp + inner.duration <= now);
            state.queue = rest.into();

            due.sort_by_key(|entry| (entry.timestamp, entry.sequence));

            if !state.queue.is_empty() {
                Self::arm(inner, &mut state);
            }
            due
        };

        for entry in due {
            tracing::trace!(key = %entry.key, ignored = entry.ignored, "audit fired");
            (entry.task)(entry.ignored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;

    fn recorder() -> (Arc<Mutex<Vec<(String, usize)>>>, impl Fn(&str) -> AuditTask) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let make = move |label: &str| -> AuditTask {
            let sink = Arc::clone(&sink);
            let label = label.to_string();
            Box::new(move |ignored| sink.lock().push((label, ignored)))
        };
        (fired, make)
    }

    #[test]
    fn test_zero_duration_runs_synchronously() {
        let scheduler = Arc::new(ManualScheduler::new());
        let auditor = Auditor::new(Duration::ZERO, scheduler.clone());
        let (fired, make) = recorder();

        auditor.audit("k", make("t"));
        assert_eq!(*fired.lock(), vec![("t".to_string(), 0)]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_coalesces_and_preserves_deadline() {
        let scheduler = Arc::new(ManualScheduler::new());
        let auditor = Auditor::new(Duration::from_millis(10), scheduler.clone());
        let (fired, make) = recorder();

        auditor.audit("k1", make("t1"));
        scheduler.advance(Duration::from_millis(2));
        auditor.audit("k2", make("t2"));
        scheduler.advance(Duration::from_millis(2));
        auditor.audit("k1", make("t1b"));

        // k1 is due at 10ms even though it was re-audited at 4ms.
        scheduler.advance(Duration::from_millis(6));
        assert_eq!(*fired.lock(), vec![("t1b".to_string(), 1)]);

        scheduler.advance(Duration::from_millis(2));
        assert_eq!(
            *fired.lock(),
            vec![("t1b".to_string(), 1), ("t2".to_string(), 0)]
        );
        assert_eq!(auditor.pending(), 0);
    }

    #[test]
    fn test_same_window_fires_in_original_order() {
        let scheduler = Arc::new(ManualScheduler::new());
        let auditor = Auditor::new(Duration::from_millis(10), scheduler.clone());
        let (fired, make) = recorder();

        auditor.audit("k1", make("t1"));
        auditor.audit("k2", make("t2"));
        auditor.audit("k1", make("t1b"));

        scheduler.advance(Duration::from_millis(10));
        assert_eq!(
            *fired.lock(),
            vec![("t1b".to_string(), 1), ("t2".to_string(), 0)]
        );
    }

    #[test]
    fn test_single_pending_timer() {
        let scheduler = Arc::new(ManualScheduler::new());
        let auditor = Auditor::new(Duration::from_millis(10), scheduler.clone());
        let (_fired, make) = recorder();

        for key in ["a", "b", "c", "a"] {
            auditor.audit(key, make(key));
        }
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(auditor.pending(), 3);
    }

    #[test]
    fn test_teardown_drops_queue() {
        let scheduler = Arc::new(ManualScheduler::new());
        let auditor = Auditor::new(Duration::from_millis(10), scheduler.clone());
        let (fired, make) = recorder();

        auditor.audit("k", make("t"));
        auditor.teardown();
        scheduler.advance(Duration::from_millis(20));

        assert!(fired.lock().is_empty());
        assert_eq!(scheduler.pending(), 0);
    }
}
