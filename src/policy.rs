//! # Retry Policies Module
//!
//! Reconnect backoff and the bounded status-poll retry counter.
//!
//! The session asks a `ReconnectPolicy` how long to wait before each
//! reconnect attempt. Attempts are unbounded; only the delay varies.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Decides the delay before reconnect attempt `attempt` (1-based).
pub trait ReconnectPolicy: Send {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay for every attempt
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay: Duration,
}

impl ReconnectPolicy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Doubles from `base` on each attempt, capped at `max`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl ReconnectPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Backoff strategy selectable from the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// Outcome of recording a poll failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Keep polling; holds the current failure count
    Retry(u32),
    /// The bound was just reached
    Exhausted(u32),
}

/// Consecutive status-poll failure counter, bounded by `max_attempts`.
#[derive(Debug, Clone)]
pub struct RetryCounter {
    count: u32,
    max_attempts: u32,
}

impl RetryCounter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            count: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Exhaustion is reported once, on the failure that reaches the bound.
    /// Further failures saturate without reporting again.
    pub fn record_failure(&mut self) -> RetryOutcome {
        if self.count >= self.max_attempts {
            return RetryOutcome::Retry(self.count);
        }
        self.count += 1;
        if self.count == self.max_attempts {
            RetryOutcome::Exhausted(self.count)
        } else {
            RetryOutcome::Retry(self.count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_is_flat() {
        let policy = FixedBackoff {
            delay: Duration::from_millis(1500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(1500));
        assert_eq!(policy.delay(50), Duration::from_millis(1500));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let policy = ExponentialBackoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_counter_exhausts_once() {
        let mut counter = RetryCounter::new(3);
        assert_eq!(counter.record_failure(), RetryOutcome::Retry(1));
        assert_eq!(counter.record_failure(), RetryOutcome::Retry(2));
        assert_eq!(counter.record_failure(), RetryOutcome::Exhausted(3));
        assert_eq!(counter.record_failure(), RetryOutcome::Retry(3));
    }

    #[test]
    fn test_retry_counter_reset() {
        let mut counter = RetryCounter::new(3);
        counter.record_failure();
        counter.record_failure();
        counter.reset();
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.record_failure(), RetryOutcome::Retry(1));
    }
}
