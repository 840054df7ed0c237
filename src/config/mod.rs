//! Configuration management for activity-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "ACTIVITY_SYNC_";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Upstream API configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Retry configuration for upstream calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Quota tracking configuration
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Background sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// OAuth client configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

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
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml);
        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables with prefix ACTIVITY_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables on top of the current values
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(url) = env_var("SOURCE_BASE_URL") {
            self.source.base_url = url;
        }

        if let Some(path) = env_var("DATABASE_PATH") {
            self.database.path = path;
        }

        if let Some(enabled) = env_var("SYNC_ENABLED") {
            self.sync.enabled = enabled.parse().unwrap_or(true);
        }
        if let Some(interval) = env_var("SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = parse_number("SYNC_INTERVAL_SECS", &interval)?;
        }
        if let Some(interval) = env_var("SYNC_TOKEN_REFRESH_INTERVAL_SECS") {
            self.sync.token_refresh_interval_secs =
                parse_number("SYNC_TOKEN_REFRESH_INTERVAL_SECS", &interval)?;
        }

        if let Some(client_id) = env_var("AUTH_CLIENT_ID") {
            self.auth.client_id = Some(client_id);
        }
        if let Some(secret) = env_var("AUTH_CLIENT_SECRET") {
            self.auth.client_secret = Some(secret);
        }
        if let Some(token) = env_var("AUTH_REFRESH_TOKEN") {
            self.auth.refresh_token = Some(token);
        }

        if let Some(enabled) = env_var("OTEL_ENABLED") {
            self.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Some(endpoint) = env_var("OTEL_ENDPOINT") {
            self.otel.endpoint = Some(endpoint);
        }

        if let Some(level) = env_var("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Reject values that would stall or spin the sync loops
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.page_size == 0 {
            return Err(ConfigError::InvalidValue(
                "source.page_size must be greater than zero".to_string(),
            ));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.token_refresh_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.token_refresh_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.enrichment_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.enrichment_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.sync.max_consecutive_rate_limits == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.max_consecutive_rate_limits must be greater than zero".to_string(),
            ));
        }
        if self.retry.min_backoff_ms > self.retry.max_backoff_secs.saturating_mul(1000) {
            return Err(ConfigError::InvalidValue(
                "retry.min_backoff_ms must not exceed retry.max_backoff_secs".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, suffix)).ok()
}

fn parse_number(name: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Parse(format!("Invalid number for {}{}", ENV_PREFIX, name)))
}

/// Upstream API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Base URL of the activity API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Records requested per list page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl SourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://www.strava.com/api/v3".to_string()
}

fn default_page_size() -> u32 {
    200
}

fn default_request_timeout() -> u64 {
    30
}

/// Retry configuration for external API calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_min_backoff")]
    pub min_backoff_ms: u64,

    /// Maximum backoff duration in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_backoff_ms: default_min_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl RetryConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_min_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    300 // 5 minutes
}

/// Quota tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaConfig {
    /// Requests kept in reserve below each window's limit
    #[serde(default = "default_quota_buffer")]
    pub buffer: u32,

    /// Safety margin added to every window reset
    #[serde(default = "default_reset_margin")]
    pub reset_margin_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            buffer: default_quota_buffer(),
            reset_margin_secs: default_reset_margin(),
        }
    }
}

fn default_quota_buffer() -> u32 {
    5
}

fn default_reset_margin() -> u64 {
    2
}

/// Background sync configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Whether background sync runs at all
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,

    /// Activity sync interval in seconds
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Token refresh check interval in seconds
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval_secs: u64,

    /// Activities enriched per batch
    #[serde(default = "default_enrichment_batch_size")]
    pub enrichment_batch_size: usize,

    /// Delay before the first enrichment run
    #[serde(default = "default_enrichment_initial_delay")]
    pub enrichment_initial_delay_secs: u64,

    /// Pause between successfully enriched activities
    #[serde(default = "default_enrichment_pacing")]
    pub enrichment_pacing_ms: u64,

    /// Pause between enrichment batches
    #[serde(default = "default_enrichment_batch_pause")]
    pub enrichment_batch_pause_ms: u64,

    /// Consecutive rate-limited items that abort an enrichment batch
    #[serde(default = "default_max_consecutive_rate_limits")]
    pub max_consecutive_rate_limits: u32,

    /// Upper bound for a single sync run
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    /// Random delay added to each periodic run, in seconds
    #[serde(default)]
    pub jitter_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            interval_secs: default_sync_interval(),
            token_refresh_interval_secs: default_token_refresh_interval(),
            enrichment_batch_size: default_enrichment_batch_size(),
            enrichment_initial_delay_secs: default_enrichment_initial_delay(),
            enrichment_pacing_ms: default_enrichment_pacing(),
            enrichment_batch_pause_ms: default_enrichment_batch_pause(),
            max_consecutive_rate_limits: default_max_consecutive_rate_limits(),
            sync_timeout_secs: default_sync_timeout(),
            jitter_secs: 0,
        }
    }
}

fn default_sync_enabled() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    900 // 15 minutes
}

fn default_token_refresh_interval() -> u64 {
    1800 // 30 minutes
}

fn default_enrichment_batch_size() -> usize {
    25
}

fn default_enrichment_initial_delay() -> u64 {
    30
}

fn default_enrichment_pacing() -> u64 {
    100
}

fn default_enrichment_batch_pause() -> u64 {
    500
}

fn default_max_consecutive_rate_limits() -> u32 {
    3
}

fn default_sync_timeout() -> u64 {
    3600
}

/// OAuth client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// OAuth application client id
    pub client_id: Option<String>,

    /// OAuth application client secret
    pub client_secret: Option<String>,

    /// Token endpoint used for refresh grants
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Refresh token used to bootstrap an empty database
    pub refresh_token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            token_url: default_token_url(),
            refresh_token: None,
        }
    }
}

fn default_token_url() -> String {
    "https://www.strava.com/oauth/token".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// How long a connection waits on a locked database
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_database_path() -> String {
    "activity_sync.db".to_string()
}

fn default_busy_timeout() -> u64 {
    5000
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    pub endpoint: Option<String>,

    /// Whether to use insecure connection
    #[serde(default)]
    pub insecure: bool,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            insecure: false,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "activity-sync".to_string()
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
/// Supports `${VAR_NAME}` syntax. Unset variables are left as written.
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
