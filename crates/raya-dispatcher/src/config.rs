//! Dispatcher configuration

use std::time::Duration;

/// Configuration shared by every dispatcher a registry creates
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on a single idle wait of the pump (default: 100ms)
    ///
    /// The pump re-checks its frame's continue predicate at least this often,
    /// even if no wake signal arrives.
    pub idle_wait: Duration,
    /// Name of the background timer thread (default: "raya-dispatcher-timer")
    pub timer_thread_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(100),
            timer_thread_name: "raya-dispatcher-timer".to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Override the idle wait bound
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Override the timer thread name
    pub fn with_timer_thread_name(mut self, name: impl Into<String>) -> Self {
        self.timer_thread_name = name.into();
        self
    }
}
