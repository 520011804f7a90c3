//! Pack manager configuration

use crate::retry::RetryPolicy;

/// Tunables for the pack manager
#[derive(Debug, Clone)]
pub struct PackManagerConfig {
    /// Transfers allowed in flight at once
    pub max_concurrent: usize,
    /// Backoff applied to failed transfers
    pub retry: RetryPolicy,
}

impl Default for PackManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            retry: RetryPolicy::default(),
        }
    }
}

impl PackManagerConfig {
    /// Override the number of concurrent transfers
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
