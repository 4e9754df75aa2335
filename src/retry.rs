// Per-chunk retry budget with exponential backoff
use std::time::Duration;

/// Bounded exponential backoff
///
/// `failures` counts failed attempts of one chunk; the chunk is abandoned
/// once it reaches `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Retries immediately; used where wall-clock backoff is unwanted
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Whether a chunk with this many failures may be attempted again
    pub fn allows_another(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Delay before the attempt that follows `failures` failed ones
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}
