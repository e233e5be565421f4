use std::time::Duration;

/// Bounded exponential backoff schedule for transient failures.
///
/// `delay(attempt)` doubles from `base` per failed attempt and saturates at
/// `cap`, so a retry loop over `0..max_attempts` terminates provably.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            max_attempts: 4,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay to sleep after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.cap).min(self.cap)
    }
}
