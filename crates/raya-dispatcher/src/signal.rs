//! Auto-reset wake signal used by the pump loop
//!
//! Any thread may `set` the signal. The owner thread waits on it with a bound;
//! a successful wait consumes the signal, so several sets before a wait
//! coalesce into a single wake-up.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Binary auto-reset event
#[derive(Default)]
pub struct WakeSignal {
    /// Whether the signal is currently set
    set: Mutex<bool>,
    /// Condvar notified on `set`
    notify: Condvar,
}

impl WakeSignal {
    /// Create an unset signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal, waking one waiter
    pub fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.notify.notify_one();
    }

    /// Check whether the signal is currently set without consuming it
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Wait until the signal is set or `timeout` elapses
    ///
    /// Returns true if the signal was consumed, false on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            self.notify.wait_for(&mut set, timeout);
        }
        std::mem::replace(&mut *set, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_signal_initially_unset() {
        let signal = WakeSignal::new();
        assert!(!signal.is_set());
        assert!(!signal.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_signal_auto_resets() {
        let signal = WakeSignal::new();
        signal.set();
        signal.set();
        assert!(signal.wait_for(Duration::from_millis(1)));
        // Both sets coalesced into one wake-up
        assert!(!signal.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_signal_cross_thread_wake() {
        let signal = Arc::new(WakeSignal::new());
        let setter = Arc::clone(&signal);

        let start = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });

        assert!(signal.wait_for(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
