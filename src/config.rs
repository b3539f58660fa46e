//! Configuration management for Gridstat
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files.

use crate::error::{GridstatError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Namespace prefix for every statistic id
    pub integration_id: String,

    /// Timezone used to decide when the nightly full refresh runs
    pub timezone: String,

    /// Accounts to import; empty means every account the API lists
    pub accounts: Vec<String>,

    /// Utility account API connection
    pub api: ApiConfig,

    /// Hourly trigger configuration
    pub schedule: ScheduleConfig,

    /// Fetch windows and concurrency
    pub fetch: FetchConfig,

    /// Retry and backoff policy for remote calls
    pub retry: RetryConfig,

    /// Statistics store configuration
    pub store: StoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Web server binding configuration
    pub web: WebConfig,
}

/// Utility account API parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the account API
    pub base_url: String,

    /// Bearer token issued for the account
    pub access_token: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

/// Hourly trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Minute of every hour at which a refresh cycle fires
    pub trigger_minute: u32,
}

/// Fetch windows and concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Verified-feed lookback before the cutoff on nightly refreshes
    pub hourly_lookback_days: u32,

    /// Verified-feed lookback for forced full refreshes
    pub history_lookback_days: u32,

    /// Window requested for the current billing period
    pub billing_lookback_days: u32,

    /// Window requested for monthly usage and cost records
    pub usage_cost_lookback_days: u32,

    /// Upper bound on concurrently running API requests
    pub max_concurrent_requests: usize,

    /// Import the full verified history on the first cycle after start-up
    pub import_history_on_start: bool,
}

/// Retry and backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per request, including the first
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for the exponential backoff in milliseconds
    pub max_backoff_ms: u64,
}

/// Statistics store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the JSON statistics file
    pub path: String,

    /// Timeout for a single store operation in seconds
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Console level override
    pub console_level: Option<String>,

    /// File level override
    pub file_level: Option<String>,

    /// Path to log file (its parent directory holds the rolling files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Whether the status/refresh server runs
    pub enabled: bool,

    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from `GRIDSTAT_CONFIG` or the default locations
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("GRIDSTAT_CONFIG") {
            return Self::from_file(path);
        }

        let default_paths = [
            "gridstat_config.yaml",
            "/data/gridstat_config.yaml",
            "/etc/gridstat/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parsed scheduling timezone
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| GridstatError::validation("timezone", "Unknown timezone name"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.integration_id.trim().is_empty() {
            return Err(GridstatError::validation(
                "integration_id",
                "Cannot be empty",
            ));
        }

        if self.integration_id.contains(':') {
            return Err(GridstatError::validation(
                "integration_id",
                "Must not contain ':'",
            ));
        }

        self.tz()?;

        if self.schedule.trigger_minute > 59 {
            return Err(GridstatError::validation(
                "schedule.trigger_minute",
                "Must be between 0 and 59",
            ));
        }

        if self.fetch.hourly_lookback_days == 0 {
            return Err(GridstatError::validation(
                "fetch.hourly_lookback_days",
                "Must be greater than 0",
            ));
        }

        if self.fetch.billing_lookback_days == 0 || self.fetch.usage_cost_lookback_days == 0 {
            return Err(GridstatError::validation(
                "fetch.billing_lookback_days",
                "Billing and usage-cost lookbacks must be greater than 0",
            ));
        }

        if self.fetch.history_lookback_days < self.fetch.hourly_lookback_days {
            return Err(GridstatError::validation(
                "fetch.history_lookback_days",
                "Must not be shorter than hourly_lookback_days",
            ));
        }

        if self.fetch.max_concurrent_requests == 0 {
            return Err(GridstatError::validation(
                "fetch.max_concurrent_requests",
                "Must be greater than 0",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(GridstatError::validation(
                "retry.max_attempts",
                "Must be greater than 0",
            ));
        }

        if self.api.request_timeout_secs == 0 || self.store.timeout_secs == 0 {
            return Err(GridstatError::validation(
                "timeout_secs",
                "Timeouts must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Additional checks when the HTTP adapter is going to be used
    pub fn validate_remote(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(GridstatError::validation(
                "api.base_url",
                "Base URL cannot be empty",
            ));
        }
        if self.api.access_token.trim().is_empty() {
            return Err(GridstatError::validation(
                "api.access_token",
                "Access token cannot be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.integration_id, "gridstat");
        assert_eq!(config.schedule.trigger_minute, 5);
        assert_eq!(config.fetch.hourly_lookback_days, 5);
        assert_eq!(config.fetch.history_lookback_days, 1825);
        assert!(config.fetch.import_history_on_start);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.schedule.trigger_minute = 60;
        assert!(config.validate().is_err());

        config = Config::default();
        config.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.integration_id = "a:b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("timezone: America/New_York\n").unwrap();
        assert_eq!(config.timezone, "America/New_York");
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }
}
