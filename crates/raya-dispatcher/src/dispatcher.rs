//! Thread-affine dispatcher
//!
//! Any thread may post work; only the owner thread runs it. The owner pumps
//! the queue inside frames: `run()` pushes the outermost one, and a wait on
//! the owner thread pushes a nested one so queued work keeps draining while
//! the caller "blocks".
//!
//! Shutdown has two phases. `request_shutdown` marks the dispatcher as
//! shutting down; frames created with `exit_when_requested` then unwind. Once
//! no frame is left, `finish_shutdown` aborts everything still queued and
//! unregisters the dispatcher.

use crate::config::DispatcherConfig;
use crate::error::{CallbackError, CallbackResult, DispatcherError};
use crate::frame::DispatcherFrame;
use crate::operation::{Dispatchable, Execution, Operation};
use crate::registry::{self, DispatcherRegistry};
use crate::signal::WakeSignal;
use crate::timer_thread::TimerThread;
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Unique identifier for a Dispatcher
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DispatcherId(u64);

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

impl DispatcherId {
    /// Generate a new unique DispatcherId
    pub fn new() -> Self {
        DispatcherId(NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for DispatcherId {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    /// Operations accepted by `post`
    pub operations_posted: u64,

    /// Operations whose callback ran
    pub operations_completed: u64,

    /// Operations aborted before starting
    pub operations_aborted: u64,

    /// Entries currently in the queue (aborted ones not yet skipped included)
    pub queued: usize,

    /// Frames currently active on the owner thread
    pub frame_depth: usize,
}

type ExceptionHandler = Arc<dyn Fn(&CallbackError) -> bool + Send + Sync>;
type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Thread-affine cooperative scheduler
pub struct Dispatcher {
    /// Unique identifier
    id: DispatcherId,

    /// Self reference handed to operations
    this: Weak<Dispatcher>,

    /// Owner thread, fixed at construction
    thread: ThreadId,

    /// Owner thread name (for diagnostics)
    thread_name: Option<String>,

    /// FIFO work queue, multi-producer, drained only by the owner
    queue: Injector<Arc<dyn Dispatchable>>,

    /// Wakes an idle pump
    wake: WakeSignal,

    /// Active frames, innermost last
    frames: Mutex<Vec<Arc<DispatcherFrame>>>,

    /// Set once `request_shutdown` was accepted
    shutdown_requested: AtomicBool,

    /// Set after the "shutdown started" notification fired
    shutdown_started: AtomicBool,

    /// Set once the finish sequence began
    finishing: AtomicBool,

    /// Set after the "shutdown finished" notification fired; `post` checks
    /// it under the read lock so nothing lands in the queue after the drain
    shutdown_finished: RwLock<bool>,

    /// Callback error handler
    exception_handler: RwLock<Option<ExceptionHandler>>,

    /// "Shutdown started" notifications
    shutdown_started_hooks: Mutex<Vec<ShutdownHook>>,

    /// "Shutdown finished" notifications
    shutdown_finished_hooks: Mutex<Vec<ShutdownHook>>,

    operations_posted: AtomicU64,
    operations_completed: AtomicU64,
    operations_aborted: AtomicU64,

    /// Registries listing the dispatcher
    registries: Mutex<Vec<Weak<DispatcherRegistry>>>,

    /// Deadline source for wait timeouts and timers
    timer: Arc<TimerThread>,

    /// Configuration copied from the registry
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher owned by the calling thread
    pub(crate) fn for_current_thread(
        registry: &Arc<DispatcherRegistry>,
        config: DispatcherConfig,
        timer: Arc<TimerThread>,
    ) -> Arc<Self> {
        let current = thread::current();
        Arc::new_cyclic(|this| Self {
            id: DispatcherId::new(),
            this: this.clone(),
            thread: current.id(),
            thread_name: current.name().map(str::to_string),
            queue: Injector::new(),
            wake: WakeSignal::new(),
            frames: Mutex::new(Vec::new()),
            shutdown_requested: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            shutdown_finished: RwLock::new(false),
            exception_handler: RwLock::new(None),
            shutdown_started_hooks: Mutex::new(Vec::new()),
            shutdown_finished_hooks: Mutex::new(Vec::new()),
            operations_posted: AtomicU64::new(0),
            operations_completed: AtomicU64::new(0),
            operations_aborted: AtomicU64::new(0),
            registries: Mutex::new(vec![Arc::downgrade(registry)]),
            timer,
            config,
        })
    }

    /// Record that `registry` also lists this dispatcher
    pub(crate) fn add_registry(&self, registry: &Arc<DispatcherRegistry>) {
        let mut registries = self.registries.lock();
        registries.retain(|entry| entry.strong_count() > 0);
        let listed = registries
            .iter()
            .any(|entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(registry)));
        if !listed {
            registries.push(Arc::downgrade(registry));
        }
    }

    /// Get (creating if necessary) the calling thread's dispatcher
    ///
    /// A dispatcher the thread already owns, from any registry, wins over
    /// creating one in the global registry.
    pub fn current() -> Arc<Dispatcher> {
        registry::thread_dispatcher()
            .unwrap_or_else(|| DispatcherRegistry::global().current())
    }

    /// Look up the dispatcher owned by `thread` in the global registry
    pub fn from_thread(thread: ThreadId) -> Option<Arc<Dispatcher>> {
        DispatcherRegistry::global().from_thread(thread)
    }

    /// Get the dispatcher's unique ID
    pub fn id(&self) -> DispatcherId {
        self.id
    }

    /// Get the owner thread
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// Get the owner thread's name, if it had one
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Get the configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Whether the calling thread is the owner thread
    pub fn check_access(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Fail unless the calling thread is the owner thread
    pub fn verify_access(&self) -> Result<(), DispatcherError> {
        let caller = thread::current().id();
        if caller == self.thread {
            Ok(())
        } else {
            Err(DispatcherError::WrongThread {
                dispatcher: self.id,
                owner: self.thread,
                caller,
            })
        }
    }

    // =========================================================================
    // Posting work
    // =========================================================================

    /// Queue `callback` for execution on the owner thread
    ///
    /// Returns `None` once shutdown has finished: the work is dropped and the
    /// caller must not assume it was accepted.
    pub fn post<F, T>(&self, callback: F) -> Option<Operation<T>>
    where
        F: FnOnce() -> CallbackResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.this.upgrade()?;
        let finished = self.shutdown_finished.read();
        if *finished {
            tracing::debug!(dispatcher = self.id.as_u64(), "post refused, shutdown finished");
            return None;
        }

        let operation = Operation::new(this, callback);
        self.queue.push(operation.dispatchable());
        drop(finished);

        self.operations_posted.fetch_add(1, Ordering::Relaxed);
        self.wake.set();
        tracing::trace!(
            dispatcher = self.id.as_u64(),
            operation = operation.id().as_u64(),
            "operation posted"
        );
        Some(operation)
    }

    /// Queue `callback(arg)` for execution on the owner thread
    pub fn post_with<A, F, T>(&self, callback: F, arg: A) -> Option<Operation<T>>
    where
        A: Send + 'static,
        F: FnOnce(A) -> CallbackResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.post(move || callback(arg))
    }

    /// Post `callback` and wait for its result
    ///
    /// `None` in the returned value means the operation was refused, aborted,
    /// timed out, or completed with a handled error.
    pub fn send<F, T>(
        &self,
        callback: F,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, DispatcherError>
    where
        F: FnOnce() -> CallbackResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let Some(operation) = self.post(callback) else {
            return Ok(None);
        };
        operation.wait(timeout)?;
        Ok(operation.take_result())
    }

    // =========================================================================
    // Pump
    // =========================================================================

    /// Pump the queue on the owner thread until shutdown
    pub fn run(&self) -> Result<(), DispatcherError> {
        self.push_frame(&DispatcherFrame::new())
    }

    /// Pump the queue in a nested frame until the frame stops continuing
    ///
    /// Only the owner thread may push frames.
    pub fn push_frame(&self, frame: &Arc<DispatcherFrame>) -> Result<(), DispatcherError> {
        self.verify_access()?;
        if self.has_shutdown_finished() {
            return Err(DispatcherError::ShutdownFinished(self.id));
        }

        let _guard = FrameGuard::enter(self, frame);
        while frame.continues_on(self) {
            match self.dequeue() {
                Some(operation) => self.execute(operation)?,
                None => {
                    self.wake.wait_for(self.config.idle_wait);
                }
            }
        }
        Ok(())
    }

    fn dequeue(&self) -> Option<Arc<dyn Dispatchable>> {
        loop {
            match self.queue.steal() {
                Steal::Success(operation) => return Some(operation),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn execute(&self, operation: Arc<dyn Dispatchable>) -> Result<(), DispatcherError> {
        let id = operation.id().as_u64();
        match operation.execute(&|err| self.handle_callback_error(err)) {
            Execution::Skipped => {
                tracing::trace!(
                    dispatcher = self.id.as_u64(),
                    operation = id,
                    "skipped aborted operation"
                );
                Ok(())
            }
            Execution::Completed => {
                self.operations_completed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    dispatcher = self.id.as_u64(),
                    operation = id,
                    "operation executed"
                );
                Ok(())
            }
            Execution::Unhandled(err) => {
                self.operations_completed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    dispatcher = self.id.as_u64(),
                    operation = id,
                    error = %err,
                    "unhandled callback error"
                );
                Err(DispatcherError::Unhandled(err))
            }
        }
    }

    fn handle_callback_error(&self, err: &CallbackError) -> bool {
        let handler = self.exception_handler.read().clone();
        match handler {
            Some(handler) => handler(err),
            None => false,
        }
    }

    /// Install the callback error handler
    ///
    /// The handler returns true if it handled the error. A declined error
    /// ends the current pump with `DispatcherError::Unhandled`.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&CallbackError) -> bool + Send + Sync + 'static,
    {
        *self.exception_handler.write() = Some(Arc::new(handler));
    }

    /// Remove the callback error handler
    pub fn clear_exception_handler(&self) {
        *self.exception_handler.write() = None;
    }

    /// Number of active frames
    pub fn frame_depth(&self) -> usize {
        self.frames.lock().len()
    }

    pub(crate) fn wake(&self) {
        self.wake.set();
    }

    pub(crate) fn timer(&self) -> &Arc<TimerThread> {
        &self.timer
    }

    pub(crate) fn record_aborted(&self) {
        self.operations_aborted.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Whether shutdown has started
    pub fn has_shutdown_started(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    /// Whether shutdown has finished
    pub fn has_shutdown_finished(&self) -> bool {
        *self.shutdown_finished.read()
    }

    /// Register a notification fired when shutdown starts
    pub fn on_shutdown_started<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shutdown_started_hooks.lock().push(Box::new(hook));
    }

    /// Register a notification fired when shutdown finishes
    pub fn on_shutdown_finished<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shutdown_finished_hooks.lock().push(Box::new(hook));
    }

    /// Start shutting down
    ///
    /// Owner thread only, and only once. With no active frame the shutdown
    /// finishes before this returns; otherwise it finishes when the outermost
    /// frame exits.
    pub fn request_shutdown(&self) -> Result<(), DispatcherError> {
        self.verify_access()?;
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return Err(DispatcherError::ShutdownAlreadyRequested(self.id));
        }
        self.start_shutdown();
        Ok(())
    }

    /// Ask the owner thread to shut down, from any thread
    ///
    /// Returns the posted request, or `None` if the dispatcher already
    /// finished shutting down.
    pub fn begin_invoke_shutdown(&self) -> Option<Operation<()>> {
        let this = self.this.clone();
        self.post(move || {
            if let Some(dispatcher) = this.upgrade() {
                if !dispatcher.shutdown_requested.load(Ordering::Acquire) {
                    dispatcher.request_shutdown()?;
                }
            }
            Ok(())
        })
    }

    /// Shut down from any thread, waiting until the owner accepted the request
    pub fn invoke_shutdown(&self) -> Result<(), DispatcherError> {
        if self.check_access() {
            if self.shutdown_requested.load(Ordering::Acquire) {
                return Ok(());
            }
            return self.request_shutdown();
        }
        if let Some(request) = self.begin_invoke_shutdown() {
            request.wait(None)?;
        }
        Ok(())
    }

    fn start_shutdown(&self) {
        tracing::debug!(dispatcher = self.id.as_u64(), "shutdown started");
        let hooks = std::mem::take(&mut *self.shutdown_started_hooks.lock());
        for hook in hooks {
            hook();
        }
        self.shutdown_started.store(true, Ordering::Release);
        self.wake.set();

        let depth = self.frame_depth();
        if depth == 0 {
            self.finish_shutdown();
        } else {
            tracing::debug!(
                dispatcher = self.id.as_u64(),
                depth,
                "shutdown deferred until frames unwind"
            );
        }
    }

    fn finish_shutdown(&self) {
        if self.finishing.swap(true, Ordering::AcqRel) {
            return;
        }

        let hooks = std::mem::take(&mut *self.shutdown_finished_hooks.lock());
        for hook in hooks {
            hook();
        }
        *self.shutdown_finished.write() = true;

        let mut aborted = 0usize;
        while let Some(operation) = self.dequeue() {
            if operation.abort() {
                aborted += 1;
            }
        }

        let registries = std::mem::take(&mut *self.registries.lock());
        for registry in registries.iter().filter_map(Weak::upgrade) {
            registry.unregister(self);
        }
        registry::release_thread_dispatcher(self);

        tracing::debug!(dispatcher = self.id.as_u64(), aborted, "shutdown finished");
    }

    /// Finish shutdown when the owner thread exits without having done so
    pub(crate) fn shutdown_on_thread_exit(&self) {
        if self.has_shutdown_finished() {
            return;
        }
        tracing::debug!(dispatcher = self.id.as_u64(), "owner thread exiting");
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            let hooks = std::mem::take(&mut *self.shutdown_started_hooks.lock());
            for hook in hooks {
                hook();
            }
            self.shutdown_started.store(true, Ordering::Release);
        }
        self.finish_shutdown();
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            operations_posted: self.operations_posted.load(Ordering::Relaxed),
            operations_completed: self.operations_completed.load(Ordering::Relaxed),
            operations_aborted: self.operations_aborted.load(Ordering::Relaxed),
            queued: self.queue.len(),
            frame_depth: self.frame_depth(),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("thread_name", &self.thread_name)
            .field("shutdown_started", &self.has_shutdown_started())
            .field("shutdown_finished", &self.has_shutdown_finished())
            .finish()
    }
}

/// Pushes a frame on entry and restores the stack on every exit path
struct FrameGuard<'a> {
    dispatcher: &'a Dispatcher,
}

impl<'a> FrameGuard<'a> {
    fn enter(dispatcher: &'a Dispatcher, frame: &Arc<DispatcherFrame>) -> Self {
        frame.attach(dispatcher.this.clone());
        let depth = {
            let mut frames = dispatcher.frames.lock();
            frames.push(Arc::clone(frame));
            frames.len()
        };
        tracing::trace!(dispatcher = dispatcher.id.as_u64(), depth, "frame pushed");
        Self { dispatcher }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let dispatcher = self.dispatcher;
        let (popped, depth) = {
            let mut frames = dispatcher.frames.lock();
            let popped = frames.pop();
            (popped, frames.len())
        };
        drop(popped);
        tracing::trace!(dispatcher = dispatcher.id.as_u64(), depth, "frame popped");

        if depth == 0 && dispatcher.has_shutdown_started() && !dispatcher.has_shutdown_finished() {
            dispatcher.finish_shutdown();
        }
    }
}
