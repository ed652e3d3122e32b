//! Retry backoff

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential, capped retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failures tolerated before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: Some(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether `attempt` consecutive failures exhaust the budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn exhaustion_respects_limit() {
        let limited = RetryPolicy::default();
        assert!(!limited.exhausted(7));
        assert!(limited.exhausted(8));

        let unlimited = RetryPolicy {
            max_attempts: None,
            ..RetryPolicy::default()
        };
        assert!(!unlimited.exhausted(u32::MAX));
    }
}
