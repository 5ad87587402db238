//! Timers whose ticks run on a dispatcher's owner thread
//!
//! The deadline itself is tracked by the background [`TimerThread`]; when it
//! fires, the timer posts a tick operation to its dispatcher. Tick handlers
//! therefore always run on the owner thread, in FIFO order with other posted
//! work. The next deadline is armed after the tick ran, so a busy owner thread
//! never accumulates a backlog of ticks.
//!
//! [`TimerThread`]: crate::timer_thread::TimerThread

use crate::dispatcher::Dispatcher;
use crate::error::DispatcherError;
use crate::timer_thread::TimerToken;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type TickHandler = Arc<dyn Fn(&DispatcherTimer) + Send + Sync>;

/// Arming state, guarded by one lock
struct TimerSchedule {
    interval: Duration,
    enabled: bool,
    /// Bumped on every re-arm; stale deadlines and ticks compare against it
    generation: u64,
    /// Pending deadline on the timer thread
    token: Option<TimerToken>,
}

struct TimerCore {
    dispatcher: Arc<Dispatcher>,
    schedule: Mutex<TimerSchedule>,
    handlers: Mutex<Vec<TickHandler>>,
    ticks: AtomicU64,
}

/// Periodic timer delivering ticks on a dispatcher's owner thread
///
/// An enabled timer keeps itself alive until `stop()` is called or its
/// dispatcher finishes shutting down.
#[derive(Clone)]
pub struct DispatcherTimer {
    core: Arc<TimerCore>,
}

impl DispatcherTimer {
    /// Create a stopped timer on the calling thread's dispatcher
    pub fn new(interval: Duration) -> Self {
        Self::with_dispatcher(Dispatcher::current(), interval)
    }

    /// Create a stopped timer on `dispatcher`
    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            core: Arc::new(TimerCore {
                dispatcher,
                schedule: Mutex::new(TimerSchedule {
                    interval,
                    enabled: false,
                    generation: 0,
                    token: None,
                }),
                handlers: Mutex::new(Vec::new()),
                ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Get the dispatcher ticks are delivered on
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.core.dispatcher
    }

    /// Get the tick interval
    pub fn interval(&self) -> Duration {
        self.core.schedule.lock().interval
    }

    /// Whether the timer is running
    pub fn is_enabled(&self) -> bool {
        self.core.schedule.lock().enabled
    }

    /// Number of ticks delivered so far
    pub fn tick_count(&self) -> u64 {
        self.core.ticks.load(Ordering::Relaxed)
    }

    /// Register a tick handler
    pub fn on_tick<F>(&self, handler: F)
    where
        F: Fn(&DispatcherTimer) + Send + Sync + 'static,
    {
        self.core.handlers.lock().push(Arc::new(handler));
    }

    /// Start ticking; a no-op if already running
    pub fn start(&self) -> Result<(), DispatcherError> {
        let mut schedule = self.core.schedule.lock();
        if schedule.enabled {
            return Ok(());
        }
        schedule.enabled = true;
        if let Err(err) = self.arm(&mut schedule) {
            schedule.enabled = false;
            return Err(err);
        }
        Ok(())
    }

    /// Stop ticking; a tick already posted is dropped
    pub fn stop(&self) {
        let mut schedule = self.core.schedule.lock();
        schedule.enabled = false;
        schedule.generation += 1;
        if let Some(token) = schedule.token.take() {
            token.cancel();
        }
    }

    /// Change the interval; a running timer is re-armed from now
    pub fn set_interval(&self, interval: Duration) -> Result<(), DispatcherError> {
        let mut schedule = self.core.schedule.lock();
        schedule.interval = interval;
        if schedule.enabled {
            if let Err(err) = self.arm(&mut schedule) {
                schedule.enabled = false;
                return Err(err);
            }
        }
        Ok(())
    }

    fn arm(&self, schedule: &mut TimerSchedule) -> Result<(), DispatcherError> {
        if let Some(token) = schedule.token.take() {
            token.cancel();
        }
        schedule.generation += 1;
        let generation = schedule.generation;

        let timer = self.clone();
        let token = self
            .core
            .dispatcher
            .timer()
            .schedule_after(schedule.interval, move || timer.post_tick(generation))?;
        schedule.token = Some(token);
        Ok(())
    }

    /// Runs on the timer thread
    fn post_tick(&self, generation: u64) {
        let timer = self.clone();
        let posted = self.core.dispatcher.post(move || {
            timer.fire_tick(generation);
            Ok(())
        });
        if posted.is_none() {
            tracing::debug!(
                dispatcher = self.core.dispatcher.id().as_u64(),
                "timer stopped, dispatcher has shut down"
            );
            let mut schedule = self.core.schedule.lock();
            if schedule.generation == generation {
                schedule.enabled = false;
                schedule.token = None;
            }
        }
    }

    /// Runs on the owner thread
    fn fire_tick(&self, generation: u64) {
        {
            let schedule = self.core.schedule.lock();
            if !schedule.enabled || schedule.generation != generation {
                return;
            }
        }

        self.core.ticks.fetch_add(1, Ordering::Relaxed);
        let handlers = self.core.handlers.lock().clone();
        for handler in handlers {
            handler(self);
        }

        // Handlers may have stopped the timer or changed its interval
        let mut schedule = self.core.schedule.lock();
        if schedule.enabled && schedule.generation == generation {
            if let Err(err) = self.arm(&mut schedule) {
                tracing::warn!(error = %err, "failed to re-arm dispatcher timer");
                schedule.enabled = false;
            }
        }
    }
}

impl std::fmt::Debug for DispatcherTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let schedule = self.core.schedule.lock();
        f.debug_struct("DispatcherTimer")
            .field("dispatcher", &self.core.dispatcher.id())
            .field("interval", &schedule.interval)
            .field("enabled", &schedule.enabled)
            .finish()
    }
}
