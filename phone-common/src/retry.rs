//! # Retry
//!
//! Exponential backoff used by the consumer loop when the queue itself is failing.
use std::time;

use envconfig::Envconfig;

use crate::config::EnvMsDuration;

#[derive(Clone, Debug, PartialEq, Eq)]
/// How long to back off after consecutive failures of the same operation.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval after the first failure.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Backoff before the next attempt, given how many attempts in a row have failed (1-based).
    pub fn backoff(&self, failed_attempts: u32) -> time::Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(exponent)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(interval), Some(max_interval)) => std::cmp::min(interval, max_interval),
            (Some(interval), None) => interval,
            // Overflowed: we are well past any sensible maximum.
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: Some(time::Duration::from_secs(60)),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "500")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub maximum_interval: EnvMsDuration,
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        RetryPolicy::build(config.backoff_coefficient, config.initial_interval.0)
            .maximum_interval(config.maximum_interval.0)
            .provide()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_backoff() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.backoff(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.backoff(2), time::Duration::from_secs(2));
        assert_eq!(retry_policy.backoff(3), time::Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_increases_with_coefficient() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2)).provide();

        assert_eq!(retry_policy.backoff(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.backoff(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.backoff(3), time::Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.backoff(1), time::Duration::from_secs(2));
        assert_eq!(retry_policy.backoff(2), time::Duration::from_secs(4));
        assert_eq!(retry_policy.backoff(3), time::Duration::from_secs(4));
        // Large attempt counts overflow the exponent; we should still land on the maximum.
        assert_eq!(retry_policy.backoff(500), time::Duration::from_secs(4));
    }

    #[test]
    fn test_zeroth_attempt_is_initial_interval() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.backoff(0), time::Duration::from_secs(1));
    }

    #[test]
    fn test_policy_from_config() {
        let config =
            RetryPolicyConfig::init_from_hashmap(&std::collections::HashMap::new()).unwrap();
        let retry_policy = RetryPolicy::from(&config);

        assert_eq!(retry_policy.backoff(1), time::Duration::from_millis(500));
        assert_eq!(retry_policy.backoff(20), time::Duration::from_secs(30));
    }
}
