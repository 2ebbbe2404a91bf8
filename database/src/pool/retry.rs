//! Retry policy shared by connection acquisition and query execution

use std::time::Duration;

use crate::error::DbError;

/// Bounded retry with exponential backoff for broken-session failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra pooled acquisition attempts before falling back to a direct connection
    pub connection_retries: u32,
    /// Extra whole-query attempts after a broken session mid-statement
    pub query_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for exponential growth
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(connection_retries: u32, query_retries: u32) -> Self {
        Self {
            connection_retries,
            query_retries,
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Never retry; useful for one-shot probes
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    /// Backoff before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Only broken sessions are healed locally
    pub fn is_retryable(&self, err: &DbError) -> bool {
        err.is_broken_session()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connection_retries: 2,
            query_retries: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}
