//! Configuration management for clinic-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Smallest interval the background job runtime accepts for periodic work
pub const MIN_PERIODIC_INTERVAL_SECS: u64 = 15 * 60;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Remote service configuration
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Local database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sync scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Connectivity probe configuration
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Retention of synced records
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix CLINIC_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(url) = std::env::var("CLINIC_SYNC_REMOTE_BASE_URL") {
            config.remote.base_url = url;
        }
        if let Ok(timeout) = std::env::var("CLINIC_SYNC_REMOTE_TIMEOUT_SECS") {
            config.remote.request_timeout_secs = timeout
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid request timeout".to_string()))?;
        }
        if let Ok(token) = std::env::var("CLINIC_SYNC_REMOTE_AUTH_TOKEN") {
            config.remote.auth_token = Some(token);
        }

        if let Ok(path) = std::env::var("CLINIC_SYNC_DATABASE_PATH") {
            config.database.path = path;
        }

        if let Ok(interval) = std::env::var("CLINIC_SYNC_PERIODIC_INTERVAL_SECS") {
            config.scheduler.periodic_interval_secs = interval
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid periodic interval".to_string()))?;
        }

        if let Ok(level) = std::env::var("CLINIC_SYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("CLINIC_SYNC_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired("remote.base_url".to_string()));
        }
        if self.remote.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "remote.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.remote.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "remote.max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.periodic_interval_secs < MIN_PERIODIC_INTERVAL_SECS {
            return Err(ConfigError::InvalidValue(format!(
                "scheduler.periodic_interval_secs must be at least {}",
                MIN_PERIODIC_INTERVAL_SECS
            )));
        }
        if self.scheduler.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.backoff.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.connectivity.probe_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "connectivity.probe_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Remote service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Base URL of the remote registration service
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Bearer token attached to every request
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Maximum number of concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Minimum interval between requests in milliseconds
    #[serde(default)]
    pub min_interval_ms: u64,

    /// Endpoint path overrides keyed by entity type name
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

impl RemoteConfig {
    /// Request timeout as a Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            auth_token: None,
            max_concurrent: default_max_concurrent(),
            min_interval_ms: 0,
            endpoints: HashMap::new(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

/// Remote configuration shared between the engine and the HTTP client
///
/// The client reads it on every submission so runtime changes apply
/// without rebuilding the engine.
#[derive(Debug, Clone, Default)]
pub struct SharedRemoteConfig {
    inner: Arc<RwLock<RemoteConfig>>,
}

impl SharedRemoteConfig {
    /// Wrap a remote configuration
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Take a copy of the current configuration
    pub async fn snapshot(&self) -> RemoteConfig {
        self.inner.read().await.clone()
    }

    /// Replace the current configuration
    pub async fn replace(&self, config: RemoteConfig) {
        *self.inner.write().await = config;
    }
}

/// Local database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "clinic-sync.db".to_string()
}

/// Sync scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    /// Base interval of the periodic lane in seconds
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_secs: u64,

    /// Whether scheduled jobs wait for connectivity before firing
    #[serde(default = "default_require_network")]
    pub require_network: bool,

    /// Delay before a manual request fires; a newer request replaces it
    #[serde(default)]
    pub manual_debounce_ms: u64,

    /// Backoff applied to the periodic lane after failed passes
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            periodic_interval_secs: default_periodic_interval(),
            require_network: default_require_network(),
            manual_debounce_ms: 0,
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_periodic_interval() -> u64 {
    MIN_PERIODIC_INTERVAL_SECS
}

fn default_require_network() -> bool {
    true
}

/// Backoff configuration for the periodic lane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    /// Backoff multiplier applied per consecutive failed pass
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Maximum delay in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Whether to add jitter to the delay
    #[serde(default)]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            multiplier: default_backoff_multiplier(),
            max_delay_secs: default_max_delay(),
            jitter: false,
        }
    }
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    6 * 60 * 60
}

/// Connectivity probe configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectivityConfig {
    /// Interval between reachability probes in seconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Probe connect timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    2000
}

/// Retention of synced records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Days a synced record is kept before it may be pruned
    #[serde(default = "default_synced_retention_days")]
    pub synced_retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            synced_retention_days: default_synced_retention_days(),
        }
    }
}

fn default_synced_retention_days() -> u32 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
