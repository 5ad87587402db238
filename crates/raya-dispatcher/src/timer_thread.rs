//! Background deadline thread
//!
//! A single thread per registry that fires one-shot actions at their
//! deadlines. It waits for the earliest deadline with a condvar timeout
//! instead of polling. Actions run on the timer thread itself, so they must be
//! short: flip a flag or post an operation to a dispatcher.

use crate::error::DispatcherError;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type TimerAction = Box<dyn FnOnce() + Send>;

/// Heap size at which cancelled entries are first swept out
const PURGE_THRESHOLD: usize = 64;

/// Handle used to cancel a scheduled action
#[derive(Debug, Clone, Default)]
pub struct TimerToken {
    cancelled: Arc<AtomicBool>,
}

impl TimerToken {
    /// Cancel the action; a no-op if it already fired
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    /// Check whether the action has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

/// Entry in the deadline heap
struct DeadlineEntry {
    /// When to fire
    wake_at: Instant,
    /// Insertion order, breaks ties so equal deadlines fire FIFO
    seq: u64,
    /// Cancellation flag shared with the caller
    token: TimerToken,
    /// Action to run
    action: TimerAction,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for DeadlineEntry {}

/// Timer thread state
struct TimerState {
    /// Pending deadlines (min-heap)
    pending: BinaryHeap<DeadlineEntry>,
    /// Next insertion sequence number
    next_seq: u64,
    /// Heap size that triggers the next sweep of cancelled entries
    purge_at: usize,
}

impl TimerState {
    /// Remove cancelled entries, returning them so they can be dropped
    /// outside the lock
    fn purge_cancelled(&mut self) -> Vec<DeadlineEntry> {
        let (live, cancelled): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_vec()
            .into_iter()
            .partition(|entry| !entry.token.is_cancelled());
        self.pending = BinaryHeap::from(live);
        self.purge_at = (self.pending.len() * 2).max(PURGE_THRESHOLD);
        cancelled
    }
}

/// State shared between the timer thread and its owner
struct TimerShared {
    /// Pending deadlines protected by mutex
    state: Mutex<TimerState>,
    /// Condvar to wake the thread when an earlier entry arrives or on stop
    notify: Condvar,
    /// Shutdown signal
    shutdown: AtomicBool,
}

/// Background thread firing one-shot deadlines
pub struct TimerThread {
    /// Thread name
    name: String,
    /// State shared with the running thread
    shared: Arc<TimerShared>,
    /// Thread handle, spawned lazily on first schedule
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Create a timer thread; the OS thread starts on first `schedule`
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    pending: BinaryHeap::new(),
                    next_seq: 0,
                    purge_at: PURGE_THRESHOLD,
                }),
                notify: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        })
    }

    /// Run `action` on the timer thread once `wake_at` is reached
    ///
    /// Fails with `TimerStopped` once `stop()` has been called.
    pub fn schedule<F>(&self, wake_at: Instant, action: F) -> Result<TimerToken, DispatcherError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_started()?;

        let token = TimerToken::default();
        let mut state = self.shared.state.lock();
        // Checked under the lock so nothing is queued after stop() drained
        if self.shared.shutdown.load(AtomicOrdering::Acquire) {
            return Err(DispatcherError::TimerStopped(self.name.clone()));
        }
        let stale = if state.pending.len() >= state.purge_at {
            state.purge_cancelled()
        } else {
            Vec::new()
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(DeadlineEntry {
            wake_at,
            seq,
            token: token.clone(),
            action: Box::new(action),
        });
        // The new entry may be earlier than the one currently waited for
        self.shared.notify.notify_one();
        drop(state);
        drop(stale);
        Ok(token)
    }

    /// Run `action` once `delay` has elapsed
    ///
    /// A delay too large to represent never fires.
    pub fn schedule_after<F>(
        &self,
        delay: Duration,
        action: F,
    ) -> Result<TimerToken, DispatcherError>
    where
        F: FnOnce() + Send + 'static,
    {
        match Instant::now().checked_add(delay) {
            Some(wake_at) => self.schedule(wake_at, action),
            None => Ok(TimerToken::default()),
        }
    }

    fn ensure_started(&self) -> Result<(), DispatcherError> {
        let mut handle = self.handle.lock();
        if self.shared.shutdown.load(AtomicOrdering::Acquire) {
            return Err(DispatcherError::TimerStopped(self.name.clone()));
        }
        if handle.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || shared.run_loop())?;
        tracing::debug!(name = %self.name, "timer thread started");
        *handle = Some(spawned);
        Ok(())
    }

    /// Stop the timer thread, dropping all pending actions
    ///
    /// Later `schedule` calls fail. Runs automatically when the last handle
    /// is dropped.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        {
            let _state = self.shared.state.lock();
            self.shared.notify.notify_one();
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // Stopped from inside an action: the loop exits on its own once
            // the action returns.
            if handle.thread().id() != thread::current().id() {
                let start = Instant::now();
                let timeout = Duration::from_secs(2);
                loop {
                    if handle.is_finished() {
                        let _ = handle.join();
                        break;
                    }
                    if start.elapsed() > timeout {
                        drop(handle);
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
            tracing::debug!(name = %self.name, "timer thread stopped");
        }
        let drained = std::mem::take(&mut self.shared.state.lock().pending);
        // Dropped outside the lock: an action may hold the last reference to a
        // dispatcher.
        drop(drained);
    }

    /// Whether `stop()` has been called
    pub fn is_stopped(&self) -> bool {
        self.shared.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Number of scheduled, not yet fired entries (cancelled ones not yet
    /// swept included)
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl TimerShared {
    /// Timer thread main loop
    fn run_loop(&self) {
        loop {
            let mut due = Vec::new();
            {
                let mut state = self.state.lock();

                // Checked under the lock so a stop() notification cannot be lost
                if self.shutdown.load(AtomicOrdering::Acquire) {
                    break;
                }

                let now = Instant::now();
                while state.pending.peek().is_some_and(|entry| entry.wake_at <= now) {
                    if let Some(entry) = state.pending.pop() {
                        due.push(entry);
                    }
                }

                if due.is_empty() {
                    match state.pending.peek().map(|entry| entry.wake_at) {
                        Some(wake_at) => {
                            self.notify.wait_until(&mut state, wake_at);
                        }
                        None => self.notify.wait(&mut state),
                    }
                    continue;
                }
            }

            // Actions run without the lock: they may schedule again
            for entry in due {
                if !entry.token.is_cancelled() {
                    (entry.action)();
                }
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.stop();
    }
}
