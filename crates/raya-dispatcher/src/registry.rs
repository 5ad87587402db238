//! Registry mapping threads to their dispatchers
//!
//! The table holds weak handles. Each owner thread keeps the strong reference
//! in a thread-local; when the thread exits, that guard finishes the
//! dispatcher's shutdown (aborting whatever is still queued) and removes the
//! entry.
//!
//! A thread owns at most one live dispatcher. A registry asked for the
//! dispatcher of a thread that already owns one from another registry lists
//! that dispatcher instead of creating a second one.

use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::timer_thread::TimerThread;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

static GLOBAL_REGISTRY: Lazy<Arc<DispatcherRegistry>> = Lazy::new(DispatcherRegistry::new);

/// Table of live dispatchers, keyed by owner thread
pub struct DispatcherRegistry {
    /// Owner thread to dispatcher
    dispatchers: DashMap<ThreadId, Weak<Dispatcher>>,

    /// Last dispatcher handed out by `current()`
    last: RwLock<Weak<Dispatcher>>,

    /// Configuration for new dispatchers
    config: DispatcherConfig,

    /// Deadline source shared by the dispatchers this registry creates;
    /// stopped when the last of them and the registry are gone
    timer: Arc<TimerThread>,
}

impl DispatcherRegistry {
    /// Create an empty registry with default configuration
    pub fn new() -> Arc<Self> {
        Self::with_config(DispatcherConfig::default())
    }

    /// Create an empty registry
    pub fn with_config(config: DispatcherConfig) -> Arc<Self> {
        let timer = TimerThread::new(config.timer_thread_name.clone());
        Arc::new(Self {
            dispatchers: DashMap::new(),
            last: RwLock::new(Weak::new()),
            config,
            timer,
        })
    }

    /// Get the process-wide registry
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Get the configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Get (creating if necessary) the calling thread's dispatcher
    ///
    /// A dispatcher the thread already owns through another registry is
    /// listed here and returned as is, keeping its own configuration.
    pub fn current(self: &Arc<Self>) -> Arc<Dispatcher> {
        let thread = thread::current().id();

        let cached = self.last.read().upgrade();
        if let Some(dispatcher) = cached {
            if dispatcher.thread_id() == thread && !dispatcher.has_shutdown_finished() {
                return dispatcher;
            }
        }

        let dispatcher = match self.from_thread(thread) {
            Some(dispatcher) => dispatcher,
            None => match thread_dispatcher() {
                Some(owned) => self.adopt(owned),
                None => self.create_for_current_thread(),
            },
        };
        *self.last.write() = Arc::downgrade(&dispatcher);
        dispatcher
    }

    /// Look up the dispatcher owned by `thread`
    pub fn from_thread(&self, thread: ThreadId) -> Option<Arc<Dispatcher>> {
        self.dispatchers
            .get(&thread)
            .and_then(|entry| entry.upgrade())
            .filter(|dispatcher| !dispatcher.has_shutdown_finished())
    }

    /// Number of registered dispatchers
    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    /// Whether no dispatcher is registered
    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    /// List a dispatcher created by another registry
    fn adopt(self: &Arc<Self>, dispatcher: Arc<Dispatcher>) -> Arc<Dispatcher> {
        dispatcher.add_registry(self);
        self.dispatchers
            .insert(dispatcher.thread_id(), Arc::downgrade(&dispatcher));
        tracing::debug!(
            dispatcher = dispatcher.id().as_u64(),
            thread = ?dispatcher.thread_id(),
            "dispatcher adopted from another registry"
        );
        dispatcher
    }

    fn create_for_current_thread(self: &Arc<Self>) -> Arc<Dispatcher> {
        let dispatcher =
            Dispatcher::for_current_thread(self, self.config.clone(), Arc::clone(&self.timer));
        self.dispatchers
            .insert(dispatcher.thread_id(), Arc::downgrade(&dispatcher));
        retain_thread_dispatcher(Arc::clone(&dispatcher));

        tracing::debug!(
            dispatcher = dispatcher.id().as_u64(),
            thread = ?dispatcher.thread_id(),
            name = dispatcher.thread_name().unwrap_or("<unnamed>"),
            "dispatcher created"
        );
        dispatcher
    }

    /// Remove `dispatcher` from the table (called when its shutdown finishes)
    pub(crate) fn unregister(&self, dispatcher: &Dispatcher) {
        let removed = self
            .dispatchers
            .remove_if(&dispatcher.thread_id(), |_, entry| {
                std::ptr::eq(entry.as_ptr(), dispatcher)
            })
            .is_some();

        let mut last = self.last.write();
        if std::ptr::eq(last.as_ptr(), dispatcher) {
            *last = Weak::new();
        }
        drop(last);

        if removed {
            tracing::debug!(dispatcher = dispatcher.id().as_u64(), "dispatcher unregistered");
        }
    }
}

// =========================================================================
// Owner-thread strong references
// =========================================================================

/// Strong references to the dispatchers owned by the current thread
#[derive(Default)]
struct ThreadDispatchers(Vec<Arc<Dispatcher>>);

impl Drop for ThreadDispatchers {
    fn drop(&mut self) {
        for dispatcher in self.0.drain(..) {
            dispatcher.shutdown_on_thread_exit();
        }
    }
}

thread_local! {
    static THREAD_DISPATCHERS: RefCell<ThreadDispatchers> =
        RefCell::new(ThreadDispatchers::default());
}

fn retain_thread_dispatcher(dispatcher: Arc<Dispatcher>) {
    let _ = THREAD_DISPATCHERS.try_with(|owned| owned.borrow_mut().0.push(dispatcher));
}

/// Most recently created live dispatcher owned by the calling thread
pub(crate) fn thread_dispatcher() -> Option<Arc<Dispatcher>> {
    THREAD_DISPATCHERS
        .try_with(|owned| {
            let owned = owned.try_borrow().ok()?;
            owned
                .0
                .iter()
                .rev()
                .find(|dispatcher| !dispatcher.has_shutdown_finished())
                .cloned()
        })
        .ok()
        .flatten()
}

/// Drop the owner thread's strong reference to `dispatcher`
///
/// A no-op while the thread-local is being torn down.
pub(crate) fn release_thread_dispatcher(dispatcher: &Dispatcher) {
    let released = THREAD_DISPATCHERS
        .try_with(|owned| {
            let Ok(mut owned) = owned.try_borrow_mut() else {
                return Vec::new();
            };
            let (released, kept) = std::mem::take(&mut owned.0)
                .into_iter()
                .partition(|entry| std::ptr::eq(Arc::as_ptr(entry), dispatcher));
            owned.0 = kept;
            released
        })
        .unwrap_or_default();
    // Released outside the borrow
    drop(released);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_registry_creation() {
        let registry = DispatcherRegistry::new();
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_current_is_stable_per_thread() {
        let registry = DispatcherRegistry::new();
        let first = registry.current();
        let second = registry.current();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        let found = registry.from_thread(thread::current().id()).unwrap();
        assert!(Arc::ptr_eq(&first, &found));
    }

    #[test]
    fn test_one_dispatcher_per_thread() {
        let registry = DispatcherRegistry::new();
        let local = registry.current();

        let remote_registry = Arc::clone(&registry);
        let (remote_id, remote_thread) = thread::spawn(move || {
            let dispatcher = remote_registry.current();
            (dispatcher.id(), dispatcher.thread_id())
        })
        .join()
        .unwrap();

        assert_ne!(local.id(), remote_id);
        assert_ne!(local.thread_id(), remote_thread);
    }

    #[test]
    fn test_thread_exit_unregisters() {
        let registry = DispatcherRegistry::new();

        let remote_registry = Arc::clone(&registry);
        let (dispatcher, pending) = thread::spawn(move || {
            let dispatcher = remote_registry.current();
            let pending = dispatcher.post(|| Ok(())).unwrap();
            (dispatcher, pending)
        })
        .join()
        .unwrap();

        assert!(dispatcher.has_shutdown_finished());
        assert_eq!(pending.status(), crate::operation::OperationStatus::Aborted);
        assert!(registry.from_thread(dispatcher.thread_id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_new_dispatcher_after_shutdown() {
        let registry = DispatcherRegistry::new();
        let first = registry.current();
        first.request_shutdown().unwrap();
        assert!(registry.is_empty());

        let second = registry.current();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.has_shutdown_started());
    }

    #[test]
    fn test_one_dispatcher_per_thread_across_registries() {
        let a = DispatcherRegistry::new();
        let b = DispatcherRegistry::new();
        let from_a = a.current();
        let from_b = b.current();
        assert!(Arc::ptr_eq(&from_a, &from_b));
        assert!(Arc::ptr_eq(&Dispatcher::current(), &from_a));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);

        let found = b.from_thread(thread::current().id()).unwrap();
        assert!(Arc::ptr_eq(&found, &from_a));

        // Shutdown removes it from every registry listing it
        from_a.request_shutdown().unwrap();
        assert!(a.is_empty());
        assert!(b.is_empty());
    }

    #[test]
    fn test_dispatcher_outlives_registry() {
        let dispatcher = DispatcherRegistry::new().current();
        assert!(!dispatcher.timer().is_stopped());

        // Owner-thread timeouts still fire through the shared timer
        let (tx, rx) = crossbeam::channel::bounded(1);
        dispatcher
            .timer()
            .schedule_after(Duration::from_millis(5), move || {
                let _ = tx.send(());
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_global_registry_is_shared() {
        let a = DispatcherRegistry::global();
        let b = DispatcherRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
        let spawned = thread::spawn(move || Arc::ptr_eq(&Dispatcher::current(), &a.current()))
            .join()
            .unwrap();
        assert!(spawned);
    }

    #[test]
    fn test_current_prefers_owned_dispatcher() {
        let registry = DispatcherRegistry::new();
        let private = registry.current();
        assert!(Arc::ptr_eq(&Dispatcher::current(), &private));
        assert!(DispatcherRegistry::global()
            .from_thread(thread::current().id())
            .is_none());
    }
}
