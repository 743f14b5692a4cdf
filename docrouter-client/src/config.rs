use docrouter_core::{FailoverBehavior, FailoverPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Quarantine and backoff settings for the health tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before a node is quarantined
    pub failure_threshold: u32,
    /// Quarantine length on reaching the threshold, in milliseconds
    pub base_backoff_ms: u64,
    /// Upper bound for the quarantine length, in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 60000,
        }
    }
}

impl HealthConfig {
    /// Quarantine length after `failures` consecutive failures.
    ///
    /// Zero below the threshold, then `base * 2^(failures - threshold)`
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures < self.failure_threshold {
            return Duration::ZERO;
        }
        let exponent = (failures - self.failure_threshold).min(32);
        let millis = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Router configuration for one database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Base URL of the primary node
    pub url: String,
    /// Database name
    pub database: String,
    /// Failover behaviors, combined into one flag set
    pub failover: FailoverPolicy,
    /// Maximum age of a cached topology in milliseconds
    pub topology_refresh_interval_ms: u64,
    /// Pause after a failed topology refresh before the primary is asked again
    pub topology_retry_ms: u64,
    /// Timeout for a single attempt against one node in milliseconds
    pub attempt_timeout_ms: u64,
    /// Time budget for one logical operation across all attempts in milliseconds
    pub aggregate_timeout_ms: u64,
    /// Optional cap on attempts per logical operation
    pub max_attempts: Option<usize>,
    pub health: HealthConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            database: "default".to_string(),
            failover: FailoverPolicy::primary_only(),
            topology_refresh_interval_ms: 300_000,
            topology_retry_ms: 5000,
            attempt_timeout_ms: 15000,
            aggregate_timeout_ms: 30000,
            max_attempts: None,
            health: HealthConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn with_failover(mut self, policy: FailoverPolicy) -> Self {
        self.failover = policy;
        self
    }

    pub fn with_behavior(mut self, behavior: FailoverBehavior) -> Self {
        self.failover |= behavior.policy();
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Defaults overlaid with `DOCROUTER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RouterConfig::from_env`] with an injectable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("DOCROUTER_URL") {
            config.url = url;
        }
        if let Some(database) = lookup("DOCROUTER_DATABASE") {
            config.database = database;
        }
        if let Some(failover) = lookup("DOCROUTER_FAILOVER") {
            let behaviors = failover
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<FailoverBehavior>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "DOCROUTER_FAILOVER".to_string(),
                    message,
                })?;
            config.failover = FailoverPolicy::from_behaviors(&behaviors);
        }
        if let Some(timeout) = lookup("DOCROUTER_ATTEMPT_TIMEOUT_MS") {
            config.attempt_timeout_ms =
                timeout
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                        key: "DOCROUTER_ATTEMPT_TIMEOUT_MS".to_string(),
                        message: e.to_string(),
                    })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid("url must not be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid("database must not be empty".to_string()));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.health.base_backoff_ms > self.health.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "health.base_backoff_ms ({}) exceeds health.max_backoff_ms ({})",
                self.health.base_backoff_ms, self.health.max_backoff_ms
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn topology_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.topology_refresh_interval_ms)
    }

    pub fn topology_retry(&self) -> Duration {
        Duration::from_millis(self.topology_retry_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn aggregate_timeout(&self) -> Duration {
        Duration::from_millis(self.aggregate_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.failover, FailoverPolicy::primary_only());
        assert_eq!(config.health.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let health = HealthConfig {
            failure_threshold: 2,
            base_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        assert_eq!(health.backoff(1), Duration::ZERO);
        assert_eq!(health.backoff(2), Duration::from_millis(100));
        assert_eq!(health.backoff(3), Duration::from_millis(200));
        assert_eq!(health.backoff(4), Duration::from_millis(400));
        assert_eq!(health.backoff(10), Duration::from_millis(1000));
        assert_eq!(health.backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: RouterConfig = serde_json::from_value(serde_json::json!({
            "url": "http://db1:8080",
            "database": "shop",
            "failover": ["read_from_all_servers"],
            "health": {"failure_threshold": 5}
        }))
        .unwrap();

        assert_eq!(config.database, "shop");
        assert!(config.failover.read_striping());
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.base_backoff_ms, 1000);
        assert_eq!(config.attempt_timeout_ms, 15000);
    }

    #[test]
    fn test_from_lookup_overlays_env() {
        let env: HashMap<&str, &str> = [
            ("DOCROUTER_URL", "http://primary:8080"),
            ("DOCROUTER_DATABASE", "orders"),
            ("DOCROUTER_FAILOVER", "read_from_all_servers, fail_immediately"),
            ("DOCROUTER_ATTEMPT_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config = RouterConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.url, "http://primary:8080");
        assert_eq!(config.database, "orders");
        assert!(config.failover.read_striping());
        assert!(config.failover.fail_immediately());
        assert_eq!(config.attempt_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_from_lookup_rejects_unknown_behavior() {
        let result = RouterConfig::from_lookup(|k| {
            (k == "DOCROUTER_FAILOVER").then(|| "sometimes".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_health() {
        let config = RouterConfig::default().with_health(HealthConfig {
            failure_threshold: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let config = RouterConfig::default().with_health(HealthConfig {
            base_backoff_ms: 10,
            max_backoff_ms: 5,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }
}
