//! Configuration management for RiskQ
//!
//! This module provides a centralized configuration system that supports:
//! - YAML/TOML configuration files
//! - Environment variable overrides
//! - Reasonable defaults
//! - Configuration validation

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure for RiskQ
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RiskqConfig {
    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub query: QueryConfig,

    /// Extra or overridden report types, keyed by report type name.
    #[serde(default)]
    pub report_types: BTreeMap<String, ReportTypeConfig>,

    /// Extra or overridden report families: family name to member report types.
    #[serde(default)]
    pub families: BTreeMap<String, Vec<String>>,
}

impl RiskqConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. Config file specified by RISKQ_CONFIG env var
    /// 3. ./config/riskq.{yaml,toml}
    /// 4. /etc/riskq/riskq.{yaml,toml}
    /// 5. Hardcoded defaults (lowest priority)
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = Self::set_defaults(builder)?;

        if let Ok(config_path) = std::env::var("RISKQ_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder
            .add_source(File::with_name("./config/riskq").required(false))
            .add_source(File::with_name("/etc/riskq/riskq").required(false));

        // Example: RISKQ_QUERY__DEADLINE_MS=1500
        builder = builder.add_source(
            Environment::with_prefix("RISKQ")
                .separator("__")
                .try_parsing(true),
        );

        let config: RiskqConfig = builder.build()?.try_deserialize()?;

        config.validate()?;

        tracing::debug!(
            local_path = ?config.source.local_path(),
            remote = config.source.remote.is_some(),
            "Loaded RiskQ configuration"
        );

        Ok(config)
    }

    /// Set default values for all configuration options
    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            // Cache
            .set_default("cache.dir", "cache")?
            .set_default("cache.refresh_interval_secs", 900)?
            .set_default("cache.latest_file_ttl_secs", 60)?
            // Cache: refresh retry
            .set_default("cache.retry.max_attempts", 10)?
            .set_default("cache.retry.initial_backoff_ms", 1000)?
            .set_default("cache.retry.max_backoff_ms", 60_000)?
            .set_default("cache.retry.backoff_multiplier", 2.0)?
            // Query
            .set_default("query.deadline_ms", 3000)?
            .set_default("query.batch_size", 1024)?
            .set_default("query.default_limit", 50)?
            .set_default("query.max_limit", 200)?
            .set_default("query.default_top", 20)?
            .set_default("query.max_top", 100)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.refresh_interval_secs == 0 {
            return Err(ConfigError::Message(
                "cache.refresh_interval_secs must be > 0".to_string(),
            ));
        }

        if self.cache.latest_file_ttl_secs == 0 {
            return Err(ConfigError::Message(
                "cache.latest_file_ttl_secs must be > 0".to_string(),
            ));
        }

        if self.query.batch_size == 0 {
            return Err(ConfigError::Message(
                "query.batch_size must be > 0".to_string(),
            ));
        }

        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_limit {
            return Err(ConfigError::Message(
                "query.default_limit must be within 1..=query.max_limit".to_string(),
            ));
        }

        if self.query.default_top == 0 || self.query.default_top > self.query.max_top {
            return Err(ConfigError::Message(
                "query.default_top must be within 1..=query.max_top".to_string(),
            ));
        }

        if let Some(remote) = &self.source.remote {
            if remote.bucket.trim().is_empty() {
                return Err(ConfigError::Message(
                    "source.remote.bucket must not be empty".to_string(),
                ));
            }
        }

        for (name, report_type) in &self.report_types {
            if report_type.prefix.trim().is_empty() {
                return Err(ConfigError::Message(format!(
                    "report_types.{name}.prefix must not be empty"
                )));
            }
        }

        for (name, members) in &self.families {
            if members.is_empty() {
                return Err(ConfigError::Message(format!(
                    "families.{name} must list at least one report type"
                )));
            }
            if members.iter().any(|m| m == name) {
                return Err(ConfigError::Message(format!(
                    "families.{name} must not contain itself"
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: RiskqConfig = Self::set_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;

        config.validate()?;

        Ok(config)
    }
}

/// Where report files come from.
///
/// A configured local folder always wins; the remote backend is the fallback.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SourceConfig {
    /// Locally synced report folder, as written by the operator.
    #[serde(default, rename = "local_path")]
    pub raw_local_path: Option<String>,

    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

impl SourceConfig {
    pub fn with_local_path(path: impl Into<String>) -> Self {
        Self {
            raw_local_path: Some(path.into()),
            remote: None,
        }
    }

    /// Normalized local folder, or `None` when not configured.
    ///
    /// Strips surrounding whitespace and quotes, expands `~` and makes the
    /// path absolute. An empty value counts as not configured.
    pub fn local_path(&self) -> Option<PathBuf> {
        let raw = self.raw_local_path.as_deref()?;
        let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if trimmed.is_empty() {
            return None;
        }

        let expanded = match trimmed.strip_prefix('~') {
            Some(rest) => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(rest.trim_start_matches(['/', '\\'])),
                None => PathBuf::from(trimmed),
            },
            None => PathBuf::from(trimmed),
        };

        if expanded.is_absolute() {
            Some(expanded)
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&expanded))
                .ok()
                .or(Some(expanded))
        }
    }
}

/// S3-compatible remote backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    pub bucket: String,

    /// Key prefix holding the report exports (e.g. "exports/risk")
    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible stores (e.g. "http://localhost:9000")
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    pub allow_http: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Local cache and refresh scheduling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory receiving downloaded copies of remote reports
    pub dir: PathBuf,

    /// Seconds between background refreshes of each report type
    pub refresh_interval_secs: u64,

    /// Seconds a resolved "latest file" stays memoized
    pub latest_file_ttl_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            refresh_interval_secs: 900,
            latest_file_ttl_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn latest_file_ttl(&self) -> Duration {
        Duration::from_secs(self.latest_file_ttl_secs)
    }
}

/// Retry configuration for failed background refreshes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Consecutive failures retried with backoff before falling back to the regular cadence
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff delay for a given retry attempt
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32))
        .min(self.max_backoff_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Query engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Per-request scan budget in milliseconds
    pub deadline_ms: u64,

    /// Rows processed between deadline checks
    pub batch_size: usize,

    pub default_limit: usize,

    pub max_limit: usize,

    pub default_top: usize,

    pub max_top: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 3000,
            batch_size: 1024,
            default_limit: 50,
            max_limit: 200,
            default_top: 20,
            max_top: 100,
        }
    }
}

impl QueryConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Naming convention of one report type
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReportTypeConfig {
    /// File name prefix, e.g. "RS_Action_Lvl"
    pub prefix: String,

    /// Value of the `ReportType` column for rows of this type
    #[serde(default)]
    pub label: Option<String>,
}
