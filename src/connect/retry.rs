//! Deterministic backoff schedule for connection attempts.

use std::time::Duration;

/// Exponential backoff with a per-delay cap and two budgets.
///
/// The delay after attempt `n` (zero based) is `initial * 2^n`, capped at
/// `cap`. Attempts stop at whichever budget is spent first: `max_attempts`
/// probes, or a next delay that would cross `max_elapsed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    initial: Duration,
    cap: Duration,
    max_attempts: u32,
    max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
            max_elapsed: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Overrides the attempt budget. Zero is treated as one.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Overrides the elapsed-time ceiling.
    #[must_use]
    pub const fn with_max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = elapsed;
        self
    }

    /// Maximum number of probes.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Elapsed-time ceiling.
    #[must_use]
    pub const fn max_elapsed(&self) -> Duration {
        self.max_elapsed
    }

    /// Delay slept after the zero-based `attempt` fails.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.cap)
    }

    /// Every delay the attempt budget allows, ignoring the elapsed ceiling.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|attempt| self.delay_after(attempt))
    }
}
