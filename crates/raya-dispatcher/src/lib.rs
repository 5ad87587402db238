//! Raya Dispatcher
//!
//! Thread-affine cooperative scheduling: any thread posts work, one owner
//! thread runs it.
//!
//! - **Dispatcher**: FIFO work queue, reentrant pump loop, two-phase shutdown
//!   (`dispatcher` module)
//! - **Operation**: posted unit of work with an observable lifecycle
//!   (`operation` module)
//! - **Frames**: nested pump loops, used by owner-thread waits (`frame` module)
//! - **Affinity**: owner-thread checks for associated objects (`object` module)
//! - **Timers**: periodic ticks delivered on the owner thread (`timer` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use raya_dispatcher::DispatcherThread;
//!
//! let owner = DispatcherThread::spawn("ui")?;
//! let answer = owner.dispatcher().send(|| Ok(6 * 7), None)?;
//! assert_eq!(answer, Some(42));
//! owner.shutdown()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod object;
pub mod operation;
pub mod registry;
pub mod signal;
pub mod thread;
pub mod timer;
pub mod timer_thread;

pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherId, DispatcherStats};
pub use error::{CallbackError, CallbackPanic, CallbackResult, DispatcherError};
pub use frame::DispatcherFrame;
pub use object::{DispatcherAffine, DispatcherObject};
pub use operation::{Operation, OperationId, OperationStatus};
pub use registry::DispatcherRegistry;
pub use signal::WakeSignal;
pub use thread::DispatcherThread;
pub use timer::DispatcherTimer;
pub use timer_thread::{TimerThread, TimerToken};
