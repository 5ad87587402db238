//! Thread-affinity guard for objects owned by a dispatcher

use crate::dispatcher::Dispatcher;
use crate::error::DispatcherError;
use std::sync::Arc;

/// Associates an object with a dispatcher
///
/// Objects that are not associated with any dispatcher are free-threaded and
/// pass every access check.
#[derive(Debug, Clone)]
pub struct DispatcherObject {
    dispatcher: Option<Arc<Dispatcher>>,
}

impl DispatcherObject {
    /// Associate with the calling thread's dispatcher
    pub fn new() -> Self {
        Self::with_dispatcher(Dispatcher::current())
    }

    /// Associate with a specific dispatcher
    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher: Some(dispatcher),
        }
    }

    /// Create an object that any thread may access
    pub fn free_threaded() -> Self {
        Self { dispatcher: None }
    }

    /// Get the associated dispatcher
    pub fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher.as_ref()
    }

    /// Drop the association, making the object free-threaded
    pub fn detach(&mut self) {
        self.dispatcher = None;
    }

    /// Whether the calling thread may access the object
    pub fn check_access(&self) -> bool {
        self.dispatcher
            .as_ref()
            .map_or(true, |dispatcher| dispatcher.check_access())
    }

    /// Fail unless the calling thread may access the object
    pub fn verify_access(&self) -> Result<(), DispatcherError> {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.verify_access(),
            None => Ok(()),
        }
    }
}

impl Default for DispatcherObject {
    fn default() -> Self {
        Self::new()
    }
}

/// Types whose state belongs to one dispatcher's owner thread
///
/// Implementors call `verify_access()?` at the top of every method that
/// mutates owner-only state.
pub trait DispatcherAffine {
    /// The embedded affinity record
    fn dispatcher_object(&self) -> &DispatcherObject;

    /// Get the associated dispatcher
    fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher_object().dispatcher()
    }

    /// Whether the calling thread may access the object
    fn check_access(&self) -> bool {
        self.dispatcher_object().check_access()
    }

    /// Fail unless the calling thread may access the object
    fn verify_access(&self) -> Result<(), DispatcherError> {
        self.dispatcher_object().verify_access()
    }
}

impl DispatcherAffine for DispatcherObject {
    fn dispatcher_object(&self) -> &DispatcherObject {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DispatcherRegistry;
    use std::thread;

    struct Counter {
        object: DispatcherObject,
        value: u32,
    }

    impl DispatcherAffine for Counter {
        fn dispatcher_object(&self) -> &DispatcherObject {
            &self.object
        }
    }

    impl Counter {
        fn increment(&mut self) -> Result<u32, DispatcherError> {
            self.verify_access()?;
            self.value += 1;
            Ok(self.value)
        }
    }

    #[test]
    fn test_owner_thread_has_access() {
        let registry = DispatcherRegistry::new();
        let mut counter = Counter {
            object: DispatcherObject::with_dispatcher(registry.current()),
            value: 0,
        };
        assert!(counter.check_access());
        assert_eq!(counter.increment().unwrap(), 1);
        assert!(counter.dispatcher().is_some());
    }

    #[test]
    fn test_foreign_thread_is_rejected() {
        let registry = DispatcherRegistry::new();
        let mut counter = Counter {
            object: DispatcherObject::with_dispatcher(registry.current()),
            value: 0,
        };

        let (allowed, result, counter) = thread::spawn(move || {
            let allowed = counter.check_access();
            let result = counter.increment();
            (allowed, result, counter)
        })
        .join()
        .unwrap();

        assert!(!allowed);
        assert!(matches!(result, Err(DispatcherError::WrongThread { .. })));
        assert_eq!(counter.value, 0);
    }

    #[test]
    fn test_free_threaded_object() {
        let mut counter = Counter {
            object: DispatcherObject::free_threaded(),
            value: 0,
        };
        let counter = thread::spawn(move || {
            assert!(counter.check_access());
            counter.increment().unwrap();
            counter
        })
        .join()
        .unwrap();
        assert_eq!(counter.value, 1);
        assert!(counter.dispatcher().is_none());
    }

    #[test]
    fn test_detach() {
        let registry = DispatcherRegistry::new();
        let mut object = DispatcherObject::with_dispatcher(registry.current());
        object.detach();

        let allowed = thread::spawn(move || object.check_access()).join().unwrap();
        assert!(allowed);
    }
}
