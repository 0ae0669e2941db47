//! Dispatcher configuration.
//!
//! The concurrency limit, retry limit and per-attempt timeout are fixed when
//! a dispatcher is constructed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default concurrency limit.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Errors that can occur while building a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for a [`Dispatcher`](super::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of jobs with an attempt in flight.
    pub concurrency_limit: usize,
    /// Retries allowed after the first attempt; a job runs at most
    /// `retry_limit + 1` times.
    pub retry_limit: u32,
    /// Time one attempt may take before it is cancelled.
    #[serde(rename = "attempt_timeout_ms", with = "millis")]
    pub attempt_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl DispatcherConfig {
    /// Creates a configuration with the given concurrency limit.
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBGATE_CONCURRENCY`: Concurrency limit (default: 4)
    /// - `JOBGATE_RETRY_LIMIT`: Retries after the first attempt (default: 3)
    /// - `JOBGATE_TIMEOUT_MS`: Per-attempt timeout in milliseconds (default: 15000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("JOBGATE_CONCURRENCY") {
            config.concurrency_limit = parse_env_value(&val, "JOBGATE_CONCURRENCY")?;
        }

        if let Some(val) = lookup("JOBGATE_RETRY_LIMIT") {
            config.retry_limit = parse_env_value(&val, "JOBGATE_RETRY_LIMIT")?;
        }

        if let Some(val) = lookup("JOBGATE_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "JOBGATE_TIMEOUT_MS")?;
            config.attempt_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency_limit must be greater than 0".to_string(),
            ));
        }

        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "attempt_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the concurrency limit.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Builder method to set the retry limit.
    pub fn with_retry_limit(mut self, retries: u32) -> Self {
        self.retry_limit = retries;
        self
    }

    /// Builder method to set the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Upper bound on attempts per job.
    pub fn max_attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

pub(super) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(saturating(*value))
    }

    /// Whole milliseconds in `value`, clamped to `u64::MAX`.
    pub fn saturating(value: Duration) -> u64 {
        u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.attempt_timeout, Duration::from_millis(15_000));
        assert_eq!(config.max_attempts(), 4);
    }

    #[test]
    fn test_config_builder() {
        let config = DispatcherConfig::new(2)
            .with_retry_limit(1)
            .with_attempt_timeout(Duration::from_millis(50));

        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.retry_limit, 1);
        assert_eq!(config.attempt_timeout, Duration::from_millis(50));
        assert_eq!(config.max_attempts(), 2);

        let config = config.with_concurrency_limit(8);
        assert_eq!(config.concurrency_limit, 8);
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(DispatcherConfig::default().validate().is_ok());
        assert!(DispatcherConfig::new(1).with_retry_limit(0).validate().is_ok());
    }

    #[test]
    fn test_validation_zero_limit() {
        let result = DispatcherConfig::new(0).validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("concurrency_limit"));
    }

    #[test]
    fn test_validation_zero_timeout() {
        let result = DispatcherConfig::default()
            .with_attempt_timeout(Duration::ZERO)
            .validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("attempt_timeout"));
    }

    #[test]
    fn test_from_lookup() {
        let config = DispatcherConfig::from_lookup(lookup_from(&[
            ("JOBGATE_CONCURRENCY", "16"),
            ("JOBGATE_RETRY_LIMIT", "0"),
            ("JOBGATE_TIMEOUT_MS", " 250 "),
        ]))
        .expect("config should parse");

        assert_eq!(config.concurrency_limit, 16);
        assert_eq!(config.retry_limit, 0);
        assert_eq!(config.attempt_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = DispatcherConfig::from_lookup(|_| None).expect("defaults are valid");
        assert_eq!(config, DispatcherConfig::default());
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = DispatcherConfig::from_lookup(lookup_from(&[("JOBGATE_RETRY_LIMIT", "-1")]))
            .unwrap_err();
        assert!(err.to_string().contains("JOBGATE_RETRY_LIMIT"));

        let err = DispatcherConfig::from_lookup(lookup_from(&[("JOBGATE_CONCURRENCY", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_config_serialization() {
        let config = DispatcherConfig::new(3).with_attempt_timeout(Duration::from_millis(750));
        let json = serde_json::to_value(&config).expect("serialization should work");
        assert_eq!(json["attempt_timeout_ms"], 750);
        assert_eq!(json["concurrency_limit"], 3);

        let parsed: DispatcherConfig =
            serde_json::from_value(json).expect("deserialization should work");
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis::saturating(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis::saturating(Duration::MAX), u64::MAX);

        let config = DispatcherConfig::new(1).with_attempt_timeout(Duration::MAX);
        let json = serde_json::to_value(&config).expect("serialization should work");
        assert_eq!(json["attempt_timeout_ms"], u64::MAX);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("bad value"));

        let err = ConfigError::ValidationFailed("test failure".to_string());
        assert!(err.to_string().contains("test failure"));
    }
}
