use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    #[error("Invalid retry configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    FixedDelay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            strategy: RetryStrategy::ExponentialBackoff,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), RetryError> {
        if self.max_attempts == 0 {
            return Err(RetryError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(RetryError::InvalidConfig(format!(
                "base_delay {:?} exceeds max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Backoff schedule for transient delivery failures.
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.config.max_attempts
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_millis = u64::try_from(self.config.base_delay.as_millis()).unwrap_or(u64::MAX);
        let base_delay = match self.config.strategy {
            RetryStrategy::ExponentialBackoff => {
                let multiplier = 2_u64.saturating_pow(attempt);
                Duration::from_millis(base_millis.saturating_mul(multiplier))
            }
            RetryStrategy::LinearBackoff => {
                Duration::from_millis(base_millis.saturating_mul(attempt as u64 + 1))
            }
            RetryStrategy::FixedDelay => self.config.base_delay,
        };

        let capped_delay = std::cmp::min(base_delay, self.config.max_delay);

        if self.config.jitter {
            self.apply_jitter(capped_delay)
        } else {
            capped_delay
        }
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::rng();
        let jitter_factor = rng.random_range(0.5..1.5); // ±50% jitter
        let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
        Duration::from_millis(jittered_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(strategy: RetryStrategy) -> RetryManager {
        RetryManager::new(RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy,
            jitter: false,
        })
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let retry = manager(RetryStrategy::ExponentialBackoff);
        assert_eq!(retry.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(retry.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(retry.calculate_delay(3), Duration::from_millis(500));
        assert_eq!(retry.calculate_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_and_fixed() {
        assert_eq!(
            manager(RetryStrategy::LinearBackoff).calculate_delay(1),
            Duration::from_millis(200)
        );
        assert_eq!(
            manager(RetryStrategy::FixedDelay).calculate_delay(3),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_oversized_base_delay_saturates_to_cap() {
        for strategy in [RetryStrategy::ExponentialBackoff, RetryStrategy::LinearBackoff] {
            let retry = RetryManager::new(RetryConfig {
                base_delay: Duration::MAX,
                max_delay: Duration::from_secs(10),
                strategy,
                jitter: false,
                ..RetryConfig::default()
            });
            assert_eq!(retry.calculate_delay(0), Duration::from_secs(10));
            assert_eq!(retry.calculate_delay(5), Duration::from_secs(10));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let retry = RetryManager::new(RetryConfig {
            jitter: true,
            strategy: RetryStrategy::FixedDelay,
            base_delay: Duration::from_millis(100),
            ..RetryConfig::default()
        });
        for _ in 0..50 {
            let delay = retry.calculate_delay(0);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let retry = manager(RetryStrategy::FixedDelay);
        assert!(retry.should_retry(3));
        assert!(!retry.should_retry(4));
        assert!(RetryConfig { max_attempts: 0, ..RetryConfig::default() }.validate().is_err());
    }
}
