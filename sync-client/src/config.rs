//! Engine configuration.
//!
//! Configuration is loaded from a TOML file (default: `rtsync.toml`). Every
//! section and every field is optional; missing values take the defaults
//! below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{RetryPolicy, SubscriptionConfig};
use sync_types::Topic;

/// Root configuration for [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Optimistic update ledger.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Listener notification dispatcher.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Connection health monitor.
    #[serde(default)]
    pub health: HealthConfig,
    /// Default reconnect policy for new subscriptions.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Optimistic update ledger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// How long a speculative write may stay unconfirmed (default: 5000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Tolerance between an update's creation and a confirming event (default: 10000).
    #[serde(default = "default_match_window_ms")]
    pub match_window_ms: u64,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Per-topic debounce window in milliseconds (default: 100).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// Health monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Run the periodic check (default: true).
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Check interval in seconds (default: 30).
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Consecutive failing intervals before a mass reconnect (default: 3).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

// Default value functions
fn default_timeout_ms() -> u64 {
    5_000
}

fn default_match_window_ms() -> u64 {
    10_000
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_interval() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            match_window_ms: default_match_window_ms(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_secs: default_health_interval(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl LedgerConfig {
    /// Pending timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Match window as a duration.
    pub fn match_window(&self) -> Duration {
        Duration::from_millis(self.match_window_ms)
    }
}

impl DispatcherConfig {
    /// Debounce window as a duration.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl HealthConfig {
    /// Check interval as a duration (minimum 1s).
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    /// Set the pending timeout for optimistic updates.
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.ledger.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the confirmation match window.
    pub fn with_match_window(mut self, window: Duration) -> Self {
        self.ledger.match_window_ms = window.as_millis() as u64;
        self
    }

    /// Set the debounce window.
    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.dispatcher.debounce_ms = window.as_millis() as u64;
        self
    }

    /// Set the health check interval, rounded up to whole seconds.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        let partial = u64::from(interval.subsec_nanos() > 0);
        self.health.interval_secs = interval.as_secs().saturating_add(partial).max(1);
        self
    }

    /// Set the health failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.health.failure_threshold = threshold;
        self
    }

    /// Enable or disable the health monitor.
    pub fn with_health_monitor(mut self, enabled: bool) -> Self {
        self.health.enabled = enabled;
        self
    }

    /// Set the default retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Subscription descriptor for `topic` using this config's retry policy.
    pub fn subscription(&self, topic: impl Into<Topic>) -> SubscriptionConfig {
        SubscriptionConfig::new(topic).with_retry(self.retry.clone())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Failed to render configuration.
    #[error("failed to serialize config: {0}")]
    SerializeError(toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.ledger.timeout(), Duration::from_secs(5));
        assert_eq!(config.ledger.match_window(), Duration::from_secs(10));
        assert_eq!(config.dispatcher.debounce(), Duration::from_millis(100));
        assert!(config.health.enabled);
        assert_eq!(config.health.interval(), Duration::from_secs(30));
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[ledger]
timeout_ms = 2000

[dispatcher]
debounce_ms = 50

[health]
interval_secs = 10
failure_threshold = 5

[retry]
max_attempts = 3
base_delay_ms = 250
"#;

        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.ledger.timeout_ms, 2000);
        assert_eq!(config.ledger.match_window_ms, 10_000);
        assert_eq!(config.dispatcher.debounce_ms, 50);
        assert_eq!(config.health.interval_secs, 10);
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay(), Duration::from_millis(250));
        assert_eq!(config.retry.multiplier, 2.0);
    }

    #[test]
    fn config_missing_sections_use_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let result = EngineConfig::from_toml_str("[ledger]\ntimeout_ms = \"soon\"");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = EngineConfig::from_file(Path::new("/nonexistent/rtsync.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn rendered_toml_parses_back() {
        let config = EngineConfig::default()
            .with_debounce(Duration::from_millis(25))
            .with_failure_threshold(7);
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn builder_setters() {
        let config = EngineConfig::default()
            .with_pending_timeout(Duration::from_secs(2))
            .with_match_window(Duration::from_secs(4))
            .with_health_interval(Duration::from_secs(60))
            .with_health_monitor(false)
            .with_retry(RetryPolicy::new(2, Duration::from_millis(10), 3.0));

        assert_eq!(config.ledger.timeout_ms, 2000);
        assert_eq!(config.ledger.match_window_ms, 4000);
        assert_eq!(config.health.interval_secs, 60);
        assert!(!config.health.enabled);
        assert_eq!(config.retry.max_attempts, 2);
    }

    #[test]
    fn health_interval_rounds_up_to_seconds() {
        let config = EngineConfig::default().with_health_interval(Duration::from_millis(500));
        assert_eq!(config.health.interval_secs, 1);
        assert_eq!(config.health.interval(), Duration::from_secs(1));

        let config = EngineConfig::default().with_health_interval(Duration::from_millis(2500));
        assert_eq!(config.health.interval(), Duration::from_secs(3));

        let config = EngineConfig::from_toml_str("[health]\ninterval_secs = 0").unwrap();
        assert_eq!(config.health.interval(), Duration::from_secs(1));
    }

    #[test]
    fn subscription_inherits_retry_policy() {
        let config =
            EngineConfig::default().with_retry(RetryPolicy::new(9, Duration::from_millis(5), 1.5));
        let sub = config.subscription("orders");
        assert_eq!(sub.topic, Topic::new("orders"));
        assert_eq!(sub.retry.max_attempts, 9);
    }
}
