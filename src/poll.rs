//! Bounded Polling
//!
//! Hardware status bits are polled with a fixed attempt budget and a sleep
//! between reads. There is no unbounded spin and no unconditional settle
//! delay: a poll either observes the expected state or reports exhaustion.

use std::thread;
use std::time::Duration;

/// How long to wait for a register condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Maximum number of register reads. At least one read is always made.
    pub max_attempts: u32,
    /// Sleep between two reads.
    pub interval: Duration,
}

impl PollConfig {
    /// Default read budget.
    pub const DEFAULT_ATTEMPTS: u32 = 1000;
    /// Default sleep between reads.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(10);

    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Upper bound on the time spent sleeping.
    pub fn budget(&self) -> Duration {
        self.interval
            .saturating_mul(self.max_attempts.max(1).saturating_sub(1))
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS, Self::DEFAULT_INTERVAL)
    }
}

/// Call `probe` until it yields a value or the budget is spent.
///
/// Returns the value and the number of attempts used, or `None` after
/// `max_attempts` misses. No sleep follows the last attempt.
pub fn poll_until<T>(
    config: &PollConfig,
    mut probe: impl FnMut() -> Option<T>,
) -> Option<(T, u32)> {
    let attempts = config.max_attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(value) = probe() {
            return Some((value, attempt));
        }
        if attempt < attempts && !config.interval.is_zero() {
            thread::sleep(config.interval);
        }
    }
    None
}
