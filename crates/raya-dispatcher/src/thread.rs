//! Dedicated owner threads
//!
//! Spawns a named thread, creates its dispatcher and pumps it until shutdown.
//! The dispatcher handle is returned to the spawning thread once it exists.

use crate::dispatcher::Dispatcher;
use crate::error::{CallbackPanic, DispatcherError};
use crate::registry::DispatcherRegistry;
use crossbeam::channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Thread running a dispatcher's pump
pub struct DispatcherThread {
    dispatcher: Arc<Dispatcher>,
    handle: JoinHandle<Result<(), DispatcherError>>,
}

impl DispatcherThread {
    /// Spawn an owner thread registered in the global registry
    pub fn spawn(name: impl Into<String>) -> Result<Self, DispatcherError> {
        Self::spawn_in(&DispatcherRegistry::global(), name)
    }

    /// Spawn an owner thread registered in `registry`
    pub fn spawn_in(
        registry: &Arc<DispatcherRegistry>,
        name: impl Into<String>,
    ) -> Result<Self, DispatcherError> {
        let (tx, rx) = channel::bounded(1);
        let registry = Arc::clone(registry);

        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let dispatcher = registry.current();
            if tx.send(Arc::clone(&dispatcher)).is_err() {
                return Ok(());
            }
            dispatcher.run()
        })?;

        let dispatcher = rx.recv().map_err(|_| DispatcherError::OwnerThreadExited)?;
        Ok(Self { dispatcher, handle })
    }

    /// Get the thread's dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Get the owner thread ID
    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// Whether the pump has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request shutdown and wait for the thread to exit
    pub fn shutdown(self) -> Result<(), DispatcherError> {
        self.dispatcher.invoke_shutdown()?;
        self.join()
    }

    /// Wait for the pump to return
    pub fn join(self) -> Result<(), DispatcherError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(payload) => Err(DispatcherError::Unhandled(Box::new(
                CallbackPanic::from_payload(payload),
            ))),
        }
    }
}
