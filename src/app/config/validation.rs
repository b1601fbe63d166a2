use super::{Config, ConfigError};
use crate::reliability::RetryConfig;
use url::Url;

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "Endpoint must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.consumers == 0 {
            return Err(ConfigError::InvalidConfig(
                "At least one consumer is required".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if !self.max_payload_mb.is_finite() || self.max_payload_mb <= 0.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "Max payload size must be a positive number of megabytes, got {}",
                self.max_payload_mb
            )));
        }

        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "Failure threshold must be greater than 0".to_string(),
            ));
        }

        if self.replay_tick_ms == 0 || self.replay_batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Replay tick interval and batch size must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if let Some(dir) = &self.replay_dir
            && !dir.is_dir()
        {
            return Err(ConfigError::InvalidConfig(format!(
                "Replay directory does not exist: {}",
                dir.display()
            )));
        }

        RetryConfig::from(&self.retry)
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let config = Config {
            endpoint: "not a url".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));

        let config = Config {
            endpoint: "ftp://example.com/".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn test_rejects_zero_values() {
        for config in [
            Config { consumers: 0, ..Config::default() },
            Config { batch_size: 0, ..Config::default() },
            Config { failure_threshold: 0, ..Config::default() },
            Config { max_payload_mb: f64::NAN, ..Config::default() },
            Config { request_timeout_secs: 0, ..Config::default() },
        ] {
            assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_rejects_invalid_retry_policy() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_missing_replay_dir() {
        let config = Config {
            replay_dir: Some("/definitely/not/here".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
