//! Dispatcher frames: one reentrant instance of the pump loop
//!
//! A frame keeps pumping while its continue predicate holds:
//! `continue_flag && (!exit_when_requested || !dispatcher.has_shutdown_started())`.
//! Frames nest on the owner thread; the dispatcher keeps them on an explicit
//! stack.

use crate::dispatcher::Dispatcher;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A resumable execution-loop context
pub struct DispatcherFrame {
    /// Local continue flag, writable from any thread
    continue_flag: AtomicBool,
    /// Whether a dispatcher shutdown request ends this frame
    exit_when_requested: bool,
    /// Dispatcher the frame was last pushed on
    dispatcher: Mutex<Weak<Dispatcher>>,
}

impl DispatcherFrame {
    /// Create a frame that exits when dispatcher shutdown is requested
    pub fn new() -> Arc<Self> {
        Self::with_exit_when_requested(true)
    }

    /// Create a frame, choosing whether it obeys a shutdown request
    pub fn with_exit_when_requested(exit_when_requested: bool) -> Arc<Self> {
        Arc::new(Self {
            continue_flag: AtomicBool::new(true),
            exit_when_requested,
            dispatcher: Mutex::new(Weak::new()),
        })
    }

    /// Whether a dispatcher shutdown request ends this frame
    pub fn exit_when_requested(&self) -> bool {
        self.exit_when_requested
    }

    /// Evaluate the continue predicate
    pub fn should_continue(&self) -> bool {
        let dispatcher = self.dispatcher.lock().upgrade();
        match dispatcher {
            Some(dispatcher) => self.continues_on(&dispatcher),
            None => self.continue_flag.load(Ordering::Acquire),
        }
    }

    /// Set the local continue flag and wake the pump so it re-evaluates
    ///
    /// Safe to call from any thread.
    pub fn set_continue(&self, value: bool) {
        self.continue_flag.store(value, Ordering::Release);
        let dispatcher = self.dispatcher.lock().upgrade();
        if let Some(dispatcher) = dispatcher {
            dispatcher.wake();
        }
    }

    /// Continue predicate against a known dispatcher
    pub(crate) fn continues_on(&self, dispatcher: &Dispatcher) -> bool {
        self.continue_flag.load(Ordering::Acquire)
            && (!self.exit_when_requested || !dispatcher.has_shutdown_started())
    }

    pub(crate) fn attach(&self, dispatcher: Weak<Dispatcher>) {
        *self.dispatcher.lock() = dispatcher;
    }
}

impl std::fmt::Debug for DispatcherFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherFrame")
            .field("continue", &self.continue_flag.load(Ordering::Relaxed))
            .field("exit_when_requested", &self.exit_when_requested)
            .finish()
    }
}
