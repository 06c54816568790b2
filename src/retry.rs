//! Bounded exponential-backoff polling.
//!
//! Used to wait for kernel partition re-enumeration instead of a fixed
//! sleep: poll a readiness check with doubling delays until it passes or a
//! time budget runs out.

use std::thread;
use std::time::{Duration, Instant};

/// Polling policy: exponential delays from `base_delay`, capped at
/// `max_delay`, within an overall `time_budget`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_delay: Duration,
    max_delay: Duration,
    time_budget: Duration,
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration, time_budget: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            time_budget,
        }
    }

    /// Policy for partition-node visibility after a table rewrite. Slow
    /// device re-enumeration (USB, loop devices) can take seconds.
    pub fn settle() -> Self {
        Self::new(
            Duration::from_millis(50),
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let factor = 1u32 << shift;
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Poll `ready` until it returns true or the time budget is exhausted.
    /// The first check happens immediately. Returns whether the condition
    /// became true in time.
    pub fn wait_for<F: FnMut() -> bool>(&self, mut ready: F) -> bool {
        let deadline = Instant::now() + self.time_budget;
        let mut attempt: u32 = 0;
        loop {
            if ready() {
                return true;
            }
            let delay = self.delay_for_attempt(attempt);
            if Instant::now() + delay > deadline {
                return false;
            }
            thread::sleep(delay);
            attempt += 1;
        }
    }
}
