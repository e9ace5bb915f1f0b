//! Retry policy with exponential backoff

use crate::{Error, FailureClass, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for one event class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts for known-transient failures (first call included)
    pub max_attempts: u32,
    /// Total attempts for unclassified failures
    pub max_unclassified_attempts: u32,
    /// Delay before the second attempt (milliseconds)
    pub initial_delay_ms: u64,
    /// Growth factor applied after every attempt
    pub multiplier: f64,
    /// Upper bound on any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Time budget for a single attempt (milliseconds)
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_RETRY_ATTEMPTS,
            max_unclassified_attempts: 2,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Check the parameters are coherent
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidPolicy("max_attempts must be >= 1".to_string()));
        }
        if self.max_unclassified_attempts == 0 || self.max_unclassified_attempts > self.max_attempts
        {
            return Err(Error::InvalidPolicy(format!(
                "max_unclassified_attempts must be in 1..={}",
                self.max_attempts
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::InvalidPolicy(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::InvalidPolicy(format!(
                "initial delay {}ms exceeds max delay {}ms",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(Error::InvalidPolicy(
                "attempt_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Attempt cap for a failure class
    pub fn attempt_limit(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::Permanent => 1,
            FailureClass::Transient => self.max_attempts,
            FailureClass::Unclassified => self.max_unclassified_attempts.min(self.max_attempts),
        }
    }

    /// Per-attempt timeout
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Delays slept between attempts: element `i` is the pause after attempt
    /// `i + 1`. Jitter is disabled so the schedule is deterministic.
    pub fn delays(&self) -> Vec<Duration> {
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_delay_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_millis(self.max_delay_ms))
            .with_max_elapsed_time(None)
            .build();

        let cap = Duration::from_millis(self.max_delay_ms);
        (1..self.max_attempts)
            .map(|_| schedule.next_backoff().unwrap_or(cap).min(cap))
            .collect()
    }

    /// Pause after the given (1-based) attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let delays = self.delays();
        let index = attempt.saturating_sub(1) as usize;
        delays
            .get(index)
            .or_else(|| delays.last())
            .copied()
            .unwrap_or_else(|| Duration::from_millis(self.initial_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            max_unclassified_attempts: 2,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 3_000,
            attempt_timeout_ms: 1_000,
        };

        let delays: Vec<u64> = policy.delays().iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 3_000]);
    }

    #[test]
    fn test_attempt_limits_per_class() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempt_limit(FailureClass::Permanent), 1);
        assert_eq!(policy.attempt_limit(FailureClass::Transient), 3);
        assert_eq!(policy.attempt_limit(FailureClass::Unclassified), 2);
    }

    #[test]
    fn test_validate_rejects_bad_policies() {
        let mut policy = RetryPolicy::default();
        assert!(policy.validate().is_ok());

        policy.multiplier = 0.5;
        assert!(policy.validate().is_err());

        let policy = RetryPolicy {
            initial_delay_ms: 20_000,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = RetryPolicy {
            max_unclassified_attempts: 9,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_single_attempt_policy_has_no_delays() {
        let policy = RetryPolicy {
            max_attempts: 1,
            max_unclassified_attempts: 1,
            ..RetryPolicy::default()
        };
        assert!(policy.delays().is_empty());
    }
}
