//! Monotonic time source used for RX windows and duty-cycle waits
//!
//! Timestamps are `Duration`s since an arbitrary origin. Waiting always
//! suspends the calling thread; nothing in the core spins on the clock.

use std::time::{Duration, Instant};

/// Time source the state machines wait on
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin
    fn now(&self) -> Duration;

    /// Suspend the calling thread for `duration`
    fn sleep(&self, duration: Duration);

    /// Suspend until `deadline`; returns at once if it has passed
    fn sleep_until(&self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            self.sleep(deadline - now);
        }
    }
}

/// Wall-clock implementation backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_until_past_deadline_returns() {
        let clock = SystemClock::new();
        let before = clock.now();
        clock.sleep_until(Duration::ZERO);
        assert!(clock.now() - before < Duration::from_millis(50));
    }

    #[test]
    fn sleep_advances_time() {
        let clock = SystemClock::new();
        let start = clock.now();
        clock.sleep_until(start + Duration::from_millis(5));
        assert!(clock.now() >= start + Duration::from_millis(5));
    }
}
