//! Error types for the dispatcher

use crate::dispatcher::DispatcherId;
use crate::operation::OperationId;
use std::any::Any;
use std::thread::ThreadId;

/// Error produced by a user callback.
///
/// Callbacks return [`CallbackResult`], so `?` works with any error type.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by user callbacks
pub type CallbackResult<T> = Result<T, CallbackError>;

/// Errors raised by the dispatcher itself
///
/// Every variant except `Unhandled` is a programming error: the call was made
/// from the wrong thread or at the wrong point of the dispatcher lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    /// Owner-thread-only API called from another thread
    #[error("Dispatcher {dispatcher:?} is owned by thread {owner:?}, called from {caller:?}")]
    WrongThread {
        /// Dispatcher that was accessed
        dispatcher: DispatcherId,
        /// Owner thread of the dispatcher
        owner: ThreadId,
        /// Thread that made the call
        caller: ThreadId,
    },

    /// `request_shutdown` called after shutdown had already been requested
    #[error("Shutdown of dispatcher {0:?} was already requested")]
    ShutdownAlreadyRequested(DispatcherId),

    /// Pump or wait entered after the dispatcher finished shutting down
    #[error("Dispatcher {0:?} has finished shutting down")]
    ShutdownFinished(DispatcherId),

    /// An operation waited on itself from its own callback
    #[error("Operation {0:?} cannot wait on itself while executing")]
    SelfWait(OperationId),

    /// A callback failed and the exception handler declined it
    #[error("Unhandled callback error: {0}")]
    Unhandled(CallbackError),

    /// A background or owner thread could not be started
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// A deadline was scheduled on a timer thread that has been stopped
    #[error("Timer thread '{0}' has been stopped")]
    TimerStopped(String),

    /// The owner thread exited before handing out its dispatcher
    #[error("Owner thread exited before its dispatcher was available")]
    OwnerThreadExited,
}

/// A callback panicked while executing on the owner thread
#[derive(Debug, Clone, thiserror::Error)]
#[error("Callback panicked: {message}")]
pub struct CallbackPanic {
    /// Panic payload rendered as text
    pub message: String,
}

impl CallbackPanic {
    /// Build from a `catch_unwind` payload
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }
}
