//! Reconnect delay policy: exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and additive uniform jitter.
///
/// `delay(n) = min(base * 2^n, max) + uniform(0, jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for attempt 0, before jitter.
    pub base: Duration,
    /// Cap on the exponential part.
    pub max: Duration,
    /// Width of the jitter window.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
    }
}

impl BackoffPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// The capped exponential part of the delay for `attempt`.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay for `attempt` with an explicit jitter amount.
    ///
    /// `jitter` is clamped to the policy's window.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.ceiling(attempt)
            .saturating_add(jitter.min(self.jitter))
    }

    /// Delay for `attempt`, drawing jitter uniformly from the window.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let window = self.jitter.as_millis() as u64;
        let jitter_ms = if window == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=window)
        };
        self.delay_with_jitter(attempt, Duration::from_millis(jitter_ms))
    }
}

/// Whether another reconnect attempt fits in the budget.
#[must_use]
pub const fn should_reconnect(attempts: u32, max_attempts: u32) -> bool {
    attempts < max_attempts
}
