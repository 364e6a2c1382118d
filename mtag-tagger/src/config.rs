//! Bootstrap configuration for mtag-tagger
//!
//! Loaded once at startup from TOML; every field has a built-in default so
//! an absent file yields a working (if unconfigured) service. Credentials may
//! be overridden from the environment.

use mtag_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment override for the inference service API key
pub const API_KEY_ENV: &str = "MTAG_API_KEY";
/// Environment override for the inference service submit endpoint
pub const ENDPOINT_ENV: &str = "MTAG_ENDPOINT";
/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "MTAG_CONFIG";
/// Config file name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "mtag-tagger.toml";

/// Top-level TOML configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Path to the SQLite item store (defaults under the data folder)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// HTTP listen address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub poller: PollerConfig,
}

fn default_bind_address() -> String {
    "127.0.0.1:5780".to_string()
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            bind_address: default_bind_address(),
            logging: LoggingConfig::default(),
            service: ServiceConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Remote inference service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Submit endpoint (POST `{ assets: [...] }`)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Status-check endpoint; the job id is appended as a path segment.
    /// Defaults to `<endpoint>/status`.
    #[serde(default)]
    pub status_endpoint: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Client-side pacing of outbound calls
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            status_endpoint: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_requests_per_second() -> u32 {
    2
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Apply `MTAG_ENDPOINT` / `MTAG_API_KEY` overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(endpoint) = non_empty_env(ENDPOINT_ENV) {
            if self.endpoint.is_some() {
                warn!("{} overrides endpoint from config file", ENDPOINT_ENV);
            }
            self.endpoint = Some(endpoint);
        }
        if let Some(key) = non_empty_env(API_KEY_ENV) {
            info!("Inference API key loaded from environment variable");
            self.api_key = Some(key);
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Queue and batch formation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pending count at which everything is flushed as one bulk batch
    #[serde(default = "default_bulk_threshold")]
    pub bulk_threshold: usize,

    /// Size of a threshold-triggered sync batch
    #[serde(default = "default_normal_batch_size")]
    pub normal_batch_size: usize,

    /// Deadline after which a short queue is flushed anyway
    #[serde(default = "default_flush_deadline_ms")]
    pub flush_deadline_ms: u64,

    /// Minimum gap between the end of one batch and the next flush
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,

    /// Window during which a burst of enqueues is evaluated once
    #[serde(default = "default_enqueue_settle_ms")]
    pub enqueue_settle_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bulk_threshold: default_bulk_threshold(),
            normal_batch_size: default_normal_batch_size(),
            flush_deadline_ms: default_flush_deadline_ms(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            enqueue_settle_ms: default_enqueue_settle_ms(),
        }
    }
}

fn default_bulk_threshold() -> usize {
    20
}

fn default_normal_batch_size() -> usize {
    5
}

fn default_flush_deadline_ms() -> u64 {
    5_000
}

fn default_inter_batch_delay_ms() -> u64 {
    10_000
}

fn default_enqueue_settle_ms() -> u64 {
    50
}

impl SchedulerConfig {
    pub fn flush_deadline(&self) -> Duration {
        Duration::from_millis(self.flush_deadline_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn enqueue_settle(&self) -> Duration {
        Duration::from_millis(self.enqueue_settle_ms)
    }
}

/// Retry and rate-limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before retry N is taken from index N; clamped to the last entry
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,

    /// Gate length when the service gives no `Retry-After` hint
    #[serde(default = "default_rate_limit_reset_secs")]
    pub rate_limit_default_reset_secs: u64,

    /// Fixed delay before the background resubmission of rate-limited items
    #[serde(default = "default_rate_limit_resubmit_secs")]
    pub rate_limit_resubmit_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
            rate_limit_default_reset_secs: default_rate_limit_reset_secs(),
            rate_limit_resubmit_secs: default_rate_limit_resubmit_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_secs() -> Vec<u64> {
    vec![30, 60, 120, 300, 600]
}

fn default_rate_limit_reset_secs() -> u64 {
    120
}

fn default_rate_limit_resubmit_secs() -> u64 {
    30
}

/// Completion poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Status checks per job before it is abandoned
    #[serde(default = "default_poll_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_attempts: default_poll_max_attempts(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_poll_max_attempts() -> u32 {
    360
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl TomlConfig {
    /// Load from an explicit path or the default lookup chain, then apply
    /// environment overrides and validate
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path =
            mtag_common::config::resolve_config_path(cli_path, CONFIG_PATH_ENV, CONFIG_FILE_NAME);
        let mut config: TomlConfig = mtag_common::config::load_toml_config(path.as_deref())?;
        config.service.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot work with
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.normal_batch_size == 0 || s.bulk_threshold == 0 {
            return Err(Error::Config(
                "scheduler.normal_batch_size and scheduler.bulk_threshold must be non-zero"
                    .to_string(),
            ));
        }
        if s.normal_batch_size > s.bulk_threshold {
            return Err(Error::Config(format!(
                "scheduler.normal_batch_size ({}) must not exceed scheduler.bulk_threshold ({})",
                s.normal_batch_size, s.bulk_threshold
            )));
        }
        if self.retry.backoff_secs.is_empty() {
            return Err(Error::Config("retry.backoff_secs must not be empty".to_string()));
        }
        if self.poller.interval_ms == 0 {
            return Err(Error::Config("poller.interval_ms must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Database path, defaulting to `<data folder>/mtag.db`
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| mtag_common::config::default_data_folder().join("mtag.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = TomlConfig::default();
        assert_eq!(config.scheduler.bulk_threshold, 20);
        assert_eq!(config.scheduler.normal_batch_size, 5);
        assert_eq!(config.scheduler.flush_deadline(), Duration::from_secs(5));
        assert_eq!(config.scheduler.inter_batch_delay(), Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_secs, vec![30, 60, 120, 300, 600]);
        assert_eq!(config.poller.max_attempts, 360);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [scheduler]
            bulk_threshold = 50

            [service]
            endpoint = "https://infer.example/tag"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.bulk_threshold, 50);
        assert_eq!(config.scheduler.normal_batch_size, 5);
        assert_eq!(config.service.endpoint.as_deref(), Some("https://infer.example/tag"));
        assert_eq!(config.service.requests_per_second, 2);
        assert_eq!(config.bind_address, "127.0.0.1:5780");
    }

    #[test]
    fn test_batch_size_above_threshold_rejected() {
        let mut config = TomlConfig::default();
        config.scheduler.normal_batch_size = 30;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_backoff_table_rejected() {
        let mut config = TomlConfig::default();
        config.retry.backoff_secs.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
