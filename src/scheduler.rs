//! Timer sources for audits and deferred graph flushes.
//!
//! The instrumentation layer never suspends on its own; the only deferred work
//! is scheduled through a [`Scheduler`]. [`ThreadScheduler`] runs tasks on a
//! background timer thread, [`ManualScheduler`] runs them when its virtual
//! clock is advanced.

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a scheduled task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Source of time and one-shot timers.
pub trait Scheduler: Send + Sync {
    fn now(&self) -> Instant;

    /// Runs `task` once, `delay` from now.
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancels a task that has not run yet. Unknown ids are ignored.
    fn cancel(&self, id: TimerId);
}

enum Command {
    Schedule {
        id: TimerId,
        deadline: Instant,
        task: Task,
    },
    Cancel(TimerId),
}

/// Runs tasks on a dedicated timer thread, spawned on first use.
pub struct ThreadScheduler {
    next_id: AtomicU64,
    sender: OnceLock<Option<Sender<Command>>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sender: OnceLock::new(),
        }
    }

    fn sender(&self) -> Option<&Sender<Command>> {
        self.sender
            .get_or_init(|| {
                let (sender, receiver) = unbounded::<Command>();
                let spawned = std::thread::Builder::new()
                    .name("streamspy-timer".into())
                    .spawn(move || {
                        let mut deadlines: BinaryHeap<Reverse<(Instant, TimerId)>> =
                            BinaryHeap::new();
                        let mut tasks: HashMap<TimerId, Task> = HashMap::new();

                        loop {
                            let command = match deadlines.peek() {
                                Some(Reverse((deadline, _))) => {
                                    let wait = deadline.saturating_duration_since(Instant::now());
                                    match receiver.recv_timeout(wait) {
                                        Ok(command) => Some(command),
                                        Err(RecvTimeoutError::Timeout) => None,
                                        Err(RecvTimeoutError::Disconnected) => break,
                                    }
                                }
                                None => match receiver.recv() {
                                    Ok(command) => Some(command),
                                    Err(_) => break,
                                },
                            };

                            match command {
                                Some(Command::Schedule { id, deadline, task }) => {
                                    deadlines.push(Reverse((deadline, id)));
                                    tasks.insert(id, task);
                                }
                                Some(Command::Cancel(id)) => {
                                    tasks.remove(&id);
                                }
                                None => {}
                            }

                            let now = Instant::now();
                            while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
                                if deadline > now {
                                    break;
                                }
                                deadlines.pop();
                                if let Some(task) = tasks.remove(&id) {
                                    task();
                                }
                            }
                        }
                    });

                match spawned {
                    Ok(_) => Some(sender),
                    Err(e) => {
                        tracing::error!("Failed to spawn timer thread: {e}");
                        None
                    }
                }
            })
            .as_ref()
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let deadline = Instant::now() + delay;
        match self.sender() {
            Some(sender) => {
                if sender.send(Command::Schedule { id, deadline, task }).is_err() {
                    tracing::warn!("Timer thread is gone; dropping task {:?}", id);
                }
            }
            None => tracing::warn!("No timer thread; dropping task {:?}", id),
        }
        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some(sender) = self.sender() {
            let _ = sender.send(Command::Cancel(id));
        }
    }
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    next_id: u64,
    queue: BTreeMap<(Duration, TimerId), Task>,
    index: HashMap<TimerId, Duration>,
}

/// Virtual clock. Tasks only run inside [`ManualScheduler::advance`].
pub struct ManualScheduler {
    origin: Instant,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Moves the clock forward, running every task that falls due in
    /// deadline order. Tasks scheduled by running tasks are honoured.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().elapsed + by;

        loop {
            let due = {
                let mut state = self.state.lock();
                let key = match state.queue.keys().next() {
                    Some(key) if key.0 <= target => *key,
                    _ => break,
                };
                state.index.remove(&key.1);
                state.elapsed = state.elapsed.max(key.0);
                state.queue.remove(&key)
            };

            if let Some(task) = due {
                task();
            }
        }

        self.state.lock().elapsed = target;
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().elapsed
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        let deadline = state.elapsed + delay;
        state.queue.insert((deadline, id), task);
        state.index.insert(id, deadline);
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.state.lock();
        if let Some(deadline) = state.index.remove(&id) {
            state.queue.remove(&(deadline, id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_manual_runs_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, label) in [(30, "c"), (10, "a"), (20, "b")] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || order.lock().push(label)),
            );
        }

        scheduler.advance(Duration::from_millis(15));
        assert_eq!(*order.lock(), vec!["a"]);

        scheduler.advance(Duration::from_millis(15));
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_manual_cancel() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);

        let id = scheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || *flag.lock() = true),
        );
        scheduler.cancel(id);
        scheduler.advance(Duration::from_millis(10));

        assert!(!*fired.lock());
    }

    #[test]
    fn test_manual_now_tracks_advance() {
        let scheduler = ManualScheduler::new();
        let start = scheduler.now();
        scheduler.advance(Duration::from_millis(25));
        assert_eq!(scheduler.now() - start, Duration::from_millis(25));
    }

    #[test]
    fn test_thread_scheduler_fires() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = crossbeam_channel::bounded(1);

        scheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                let _ = tx.send(42);
            }),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    }
}
