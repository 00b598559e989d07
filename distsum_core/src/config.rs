//! Tunables for the master/slave loops and the channel.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy for transient channel failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (default: 5)
    pub max_attempts: u32,

    /// Delay before the first retry (default: 10ms)
    pub initial_backoff: Duration,

    /// Upper bound on any single delay (default: 500ms)
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Doubles from `initial_backoff` and saturates at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Configuration shared by the master and slave runtimes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// How often the runtimes poll their inbox (default: 50ms)
    pub poll_interval: Duration,

    /// Master issues a GET round every N polls; 0 disables (default: 20)
    pub reconcile_every: u64,

    /// Remove delivered messages from the store (default: true)
    pub prune_delivered: bool,

    /// Backoff for transient failures
    pub retry: RetryPolicy,
}

impl ProtocolConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reconcile_every(mut self, polls: u64) -> Self {
        self.reconcile_every = polls;
        self
    }

    pub fn with_prune_delivered(mut self, prune: bool) -> Self {
        self.prune_delivered = prune;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            reconcile_every: 20,
            prune_delivered: true,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_config_default() {
        let config = ProtocolConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.reconcile_every, 20);
        assert!(config.prune_delivered);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_for(7), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_millis(500));
    }
}
