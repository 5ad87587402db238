//! Operations: queued units of work with an observable lifecycle
//!
//! ```text
//! Pending ──dequeued──▶ Executing ──callback returns──▶ Completed
//!    │
//!    └──abort()──▶ Aborted
//! ```
//!
//! Status changes happen under the operation's own lock, so `abort()` racing
//! the pump either wins (the pump skips the entry) or loses (the callback
//! runs and `abort()` returns false).

use crate::dispatcher::Dispatcher;
use crate::error::{CallbackError, CallbackPanic, CallbackResult, DispatcherError};
use crate::frame::DispatcherFrame;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Unique identifier for an Operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

impl OperationId {
    /// Generate a new unique OperationId
    pub fn new() -> Self {
        OperationId(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of an Operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// Queued, not yet picked up by the owner thread
    Pending,
    /// Callback currently running on the owner thread
    Executing,
    /// Callback returned (successfully or with a routed error)
    Completed,
    /// Removed before it started
    Aborted,
}

impl OperationStatus {
    /// Whether the status is terminal
    pub fn is_finished(self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Aborted)
    }
}

type Callback<T> = Box<dyn FnOnce() -> CallbackResult<T> + Send>;
type FinishHook = Box<dyn FnOnce(OperationStatus) + Send>;

/// Mutable part of an operation
struct OperationSlot<T> {
    status: OperationStatus,
    /// Taken when the operation starts or is aborted
    callback: Option<Callback<T>>,
    result: Option<T>,
    /// Message of the callback error that completed the operation
    failure: Option<String>,
    /// Run once, on completion or abort; keyed so a waiter can withdraw its own
    hooks: Vec<(u64, FinishHook)>,
    /// Key for the next registered hook
    next_hook: u64,
}

/// Shared state behind an [`Operation`] handle
pub(crate) struct OperationCell<T> {
    id: OperationId,
    dispatcher: Arc<Dispatcher>,
    slot: Mutex<OperationSlot<T>>,
    /// Notified when the operation reaches a terminal status
    finished: Condvar,
}

/// Outcome of handing an operation to the pump
pub(crate) enum Execution {
    /// Already aborted, nothing ran
    Skipped,
    /// Callback ran; any error was handled
    Completed,
    /// Callback failed and the exception handler declined the error
    Unhandled(CallbackError),
}

/// Type-erased view of an operation, as stored in the dispatcher queue
pub(crate) trait Dispatchable: Send + Sync {
    /// Operation ID
    fn id(&self) -> OperationId;

    /// Run the callback if still pending. `on_error` decides whether a
    /// callback error is handled.
    fn execute(&self, on_error: &dyn Fn(&CallbackError) -> bool) -> Execution;

    /// Abort if still pending
    fn abort(&self) -> bool;
}

impl<T: Send + 'static> OperationCell<T> {
    fn finish(
        &self,
        mut slot: parking_lot::MutexGuard<'_, OperationSlot<T>>,
        status: OperationStatus,
    ) {
        slot.status = status;
        let hooks = std::mem::take(&mut slot.hooks);
        self.finished.notify_all();
        drop(slot);

        for (_, hook) in hooks {
            hook(status);
        }
    }

    /// Register `hook`, or run it now if the operation already finished
    ///
    /// Returns the key to withdraw a registered hook with.
    fn on_finished(&self, hook: FinishHook) -> Option<u64> {
        let mut slot = self.slot.lock();
        if slot.status.is_finished() {
            let status = slot.status;
            drop(slot);
            hook(status);
            None
        } else {
            let key = slot.next_hook;
            slot.next_hook += 1;
            slot.hooks.push((key, hook));
            Some(key)
        }
    }

    /// Withdraw a hook that has not run yet
    fn remove_hook(&self, key: u64) {
        let removed = {
            let mut slot = self.slot.lock();
            slot.hooks
                .iter()
                .position(|(entry, _)| *entry == key)
                .map(|index| slot.hooks.swap_remove(index))
        };
        // Captured state is dropped outside the lock
        drop(removed);
    }
}

impl<T: Send + 'static> Dispatchable for OperationCell<T> {
    fn id(&self) -> OperationId {
        self.id
    }

    fn execute(&self, on_error: &dyn Fn(&CallbackError) -> bool) -> Execution {
        let callback = {
            let mut slot = self.slot.lock();
            if slot.status != OperationStatus::Pending {
                return Execution::Skipped;
            }
            slot.status = OperationStatus::Executing;
            slot.callback.take()
        };

        let outcome = match callback {
            Some(callback) => panic::catch_unwind(AssertUnwindSafe(callback)).unwrap_or_else(
                |payload| Err(Box::new(CallbackPanic::from_payload(payload)) as CallbackError),
            ),
            None => Err("operation callback already consumed".into()),
        };

        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (None, Some(err)),
        };
        let failure = error.as_ref().map(|err| err.to_string());
        // The handler runs while the operation is still Executing
        let unhandled = error.filter(|err| !on_error(err));

        let mut slot = self.slot.lock();
        slot.result = result;
        slot.failure = failure;
        self.finish(slot, OperationStatus::Completed);

        match unhandled {
            Some(err) => Execution::Unhandled(err),
            None => Execution::Completed,
        }
    }

    fn abort(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.status != OperationStatus::Pending {
            return false;
        }
        let callback = slot.callback.take();
        self.finish(slot, OperationStatus::Aborted);
        // Captured state is dropped outside the lock
        drop(callback);

        self.dispatcher.record_aborted();
        tracing::trace!(operation = self.id.as_u64(), "operation aborted");
        true
    }
}

/// Handle to an operation posted to a [`Dispatcher`]
///
/// Handles are cheap to clone; all clones observe the same operation.
pub struct Operation<T> {
    cell: Arc<OperationCell<T>>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.cell.id)
            .field("status", &self.cell.slot.lock().status)
            .finish()
    }
}

impl<T: Send + 'static> Operation<T> {
    pub(crate) fn new<F>(dispatcher: Arc<Dispatcher>, callback: F) -> Self
    where
        F: FnOnce() -> CallbackResult<T> + Send + 'static,
    {
        Self {
            cell: Arc::new(OperationCell {
                id: OperationId::new(),
                dispatcher,
                slot: Mutex::new(OperationSlot {
                    status: OperationStatus::Pending,
                    callback: Some(Box::new(callback)),
                    result: None,
                    failure: None,
                    hooks: Vec::new(),
                    next_hook: 0,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    /// Type-erased handle for the dispatcher queue
    pub(crate) fn dispatchable(&self) -> Arc<dyn Dispatchable> {
        self.cell.clone()
    }

    /// Get the operation's unique ID
    pub fn id(&self) -> OperationId {
        self.cell.id
    }

    /// Get the dispatcher the operation was posted to
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.cell.dispatcher
    }

    /// Get the current status
    pub fn status(&self) -> OperationStatus {
        self.cell.slot.lock().status
    }

    /// Abort the operation if it has not started yet
    ///
    /// Returns false if it is already executing or finished; the status is
    /// then left untouched.
    pub fn abort(&self) -> bool {
        self.cell.abort()
    }

    /// Take the result out of a completed operation
    pub fn take_result(&self) -> Option<T> {
        self.cell.slot.lock().result.take()
    }

    /// Message of the error that completed the operation, if its callback failed
    pub fn failure(&self) -> Option<String> {
        self.cell.slot.lock().failure.clone()
    }

    /// Run `hook` once the operation completes
    ///
    /// Runs immediately if it already has. Never runs if the operation is
    /// aborted.
    pub fn on_completed<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cell.on_finished(Box::new(move |status| {
            if status == OperationStatus::Completed {
                hook();
            }
        }));
    }

    /// Run `hook` once the operation is aborted
    ///
    /// Runs immediately if it already was. Never runs if the operation
    /// completes.
    pub fn on_aborted<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cell.on_finished(Box::new(move |status| {
            if status == OperationStatus::Aborted {
                hook();
            }
        }));
    }

    /// Wait for the operation to finish
    ///
    /// `None` waits without limit; `Some(Duration::ZERO)` only polls. On the
    /// owner thread the wait pumps other queued operations in a nested frame;
    /// on any other thread it blocks the caller.
    ///
    /// Returns the status at the moment waiting stopped. A timeout leaves the
    /// operation queued: it may still run later.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<OperationStatus, DispatcherError> {
        let status = self.status();
        if status.is_finished() || timeout == Some(Duration::ZERO) {
            return Ok(status);
        }

        if self.cell.dispatcher.check_access() {
            self.wait_on_owner(timeout)
        } else {
            Ok(self.wait_foreign(timeout))
        }
    }

    fn wait_on_owner(
        &self,
        timeout: Option<Duration>,
    ) -> Result<OperationStatus, DispatcherError> {
        let dispatcher = &self.cell.dispatcher;
        if self.status() == OperationStatus::Executing {
            // Only this thread could ever advance it
            return Err(DispatcherError::SelfWait(self.cell.id));
        }

        let frame = DispatcherFrame::with_exit_when_requested(false);
        let hook = {
            let frame = Arc::clone(&frame);
            self.cell.on_finished(Box::new(move |_| frame.set_continue(false)))
        };

        let deadline = match timeout {
            Some(timeout) => {
                let frame = Arc::clone(&frame);
                let scheduled = dispatcher
                    .timer()
                    .schedule_after(timeout, move || frame.set_continue(false));
                match scheduled {
                    Ok(token) => Some(token),
                    Err(err) => {
                        if let Some(key) = hook {
                            self.cell.remove_hook(key);
                        }
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        let pumped = dispatcher.push_frame(&frame);
        if let Some(deadline) = deadline {
            deadline.cancel();
        }
        // A timed-out or failed wait leaves the operation unfinished
        if let Some(key) = hook {
            self.cell.remove_hook(key);
        }
        pumped?;

        Ok(self.status())
    }

    fn wait_foreign(&self, timeout: Option<Duration>) -> OperationStatus {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut slot = self.cell.slot.lock();
        while !slot.status.is_finished() {
            match deadline {
                Some(deadline) => {
                    if self.cell.finished.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cell.finished.wait(&mut slot),
            }
        }
        slot.status
    }
}

impl<T: Clone + Send + 'static> Operation<T> {
    /// Get a copy of the result, if the operation completed with one
    pub fn result(&self) -> Option<T> {
        self.cell.slot.lock().result.clone()
    }
}
