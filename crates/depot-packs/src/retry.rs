//! Retry policy for failed transfers

use std::time::Duration;

/// Exponential backoff configuration for pack transfers.
///
/// A transfer failure counts one attempt; once `max_attempts` have
/// failed the pack moves to a terminal error state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Growth factor applied per retry
    pub backoff_multiplier: f64,
    /// Add up to 10% random jitter to spread out retries
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits, for tests and local servers
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay to wait after `attempt` failures (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exp);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = if self.jitter && capped > 0.0 {
            capped * 0.1 * rand::random::<f64>()
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}
