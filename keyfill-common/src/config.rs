//! Configuration loading and config file resolution
//!
//! Every field has a compiled default, so a missing or partial TOML file
//! still yields a runnable configuration. Command-line flags are applied on
//! top of the loaded values by the binary.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "KEYFILL_CONFIG";

/// Config file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "keyfill.toml";

/// Complete TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    /// Worker pool, rate limiter and checkpoint settings
    pub run: RunConfig,
    /// Retry policy around a single resolver call
    pub retry: RetryConfig,
    /// HTTP resolver settings
    pub resolver: ResolverConfig,
    /// Field-fill policy for the merge step
    pub merge: MergeConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Run options consumed by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum number of concurrently executing fetch tasks
    pub workers: usize,
    /// Lower bound (and starting value) of the adaptive delay, seconds
    pub base_delay_secs: f64,
    /// Upper bound of the adaptive delay, seconds
    pub max_delay_secs: f64,
    /// Completions between checkpoint flushes
    pub batch_size: usize,
    /// Re-queue keys whose cached value is null
    pub force_retry_failed: bool,
    /// Consecutive rate-limit failures that trigger the long pause
    pub failure_threshold: u32,
    /// Length of the long pause, seconds
    pub long_pause_secs: f64,
    /// Checkpoint file; defaults to `.<input stem>.checkpoint.json` next to the input
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            batch_size: 10,
            force_retry_failed: false,
            failure_threshold: 5,
            long_pause_secs: 30.0,
            checkpoint_path: None,
        }
    }
}

impl RunConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_secs)
    }

    pub fn long_pause(&self) -> Duration {
        Duration::from_secs_f64(self.long_pause_secs)
    }
}

/// Exponential backoff for transient resolver failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt, seconds
    pub initial_backoff_secs: f64,
    /// Backoff growth factor between attempts
    pub multiplier: f64,
    /// Backoff cap, seconds
    pub max_backoff_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_secs: 5.0,
            multiplier: 2.0,
            max_backoff_secs: 30.0,
        }
    }
}

/// HTTP resolver settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// URL with a `{key}` placeholder, e.g. `https://api.example.com/lookup/{key}`
    pub url_template: Option<String>,
    /// User-Agent header sent with every request
    pub user_agent: String,
    /// Per-request timeout, seconds
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            url_template: None,
            user_agent: concat!("keyfill/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 10,
        }
    }
}

/// One column ← record field mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldRule {
    /// Dataset column written by the rule
    pub column: String,
    /// Record field read by the rule; defaults to the column name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl FieldRule {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            source: None,
        }
    }

    pub fn from_source(column: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            source: Some(source.into()),
        }
    }

    /// Record field name this rule reads
    pub fn source_field(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.column)
    }
}

/// Field-fill policy
///
/// `preserve` columns are only filled when blank; `derived` columns are
/// always overwritten. An empty `derived` list means "every field seen in
/// any resolved record".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    /// Column holding the key
    pub key_column: String,
    /// Value written when the record or field is absent
    pub sentinel: String,
    /// Fill-if-blank rules
    pub preserve: Vec<FieldRule>,
    /// Always-overwrite rules
    pub derived: Vec<FieldRule>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            key_column: "Key".to_string(),
            sentinel: "N/A".to_string(),
            preserve: Vec::new(),
            derived: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TomlConfig {
    /// Reject values the run cannot work with
    pub fn validate(&self) -> Result<()> {
        let run = &self.run;
        if run.workers == 0 {
            return Err(Error::Config("run.workers must be at least 1".to_string()));
        }
        if run.batch_size == 0 {
            return Err(Error::Config("run.batch_size must be at least 1".to_string()));
        }
        if run.base_delay_secs <= 0.0 || !run.base_delay_secs.is_finite() {
            return Err(Error::Config(format!(
                "run.base_delay_secs must be positive (got {})",
                run.base_delay_secs
            )));
        }
        if !run.max_delay_secs.is_finite() || run.max_delay_secs < run.base_delay_secs {
            return Err(Error::Config(format!(
                "run.max_delay_secs ({}) must be >= run.base_delay_secs ({})",
                run.max_delay_secs, run.base_delay_secs
            )));
        }
        if !run.long_pause_secs.is_finite() || run.long_pause_secs < 0.0 {
            return Err(Error::Config("run.long_pause_secs must be >= 0".to_string()));
        }
        if run.failure_threshold == 0 {
            return Err(Error::Config("run.failure_threshold must be at least 1".to_string()));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if retry.initial_backoff_secs < 0.0 || retry.max_backoff_secs < 0.0 || retry.multiplier < 1.0 {
            return Err(Error::Config(
                "retry backoff must be non-negative with multiplier >= 1".to_string(),
            ));
        }

        if self.merge.key_column.trim().is_empty() {
            return Err(Error::Config("merge.key_column must not be empty".to_string()));
        }
        if let Some(template) = &self.resolver.url_template {
            if !template.contains("{key}") {
                return Err(Error::Config(format!(
                    "resolver.url_template has no {{key}} placeholder: {}",
                    template
                )));
            }
        }
        Ok(())
    }
}

/// Load and validate a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load the config at `path`, degrading to defaults when it is absent
///
/// A file that exists but fails to parse or validate is an error.
pub fn load_or_default(path: Option<&Path>) -> Result<TomlConfig> {
    match path {
        Some(path) if path.exists() => {
            let config = load_toml_config(path)?;
            info!("Loaded configuration from {}", path.display());
            Ok(config)
        }
        Some(path) => {
            warn!(
                "Config file {} not found, using compiled defaults",
                path.display()
            );
            Ok(TomlConfig::default())
        }
        None => {
            info!("No config file found, using compiled defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Write a config file (used to scaffold a starting configuration)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Config file resolution, in priority order:
/// 1. Command-line argument
/// 2. `KEYFILL_CONFIG` environment variable
/// 3. `keyfill.toml` in the working directory
/// 4. `<user config dir>/keyfill/config.toml`
///
/// Returns `None` when no candidate exists; callers then run on defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|d| d.join("keyfill").join("config.toml"))
        .filter(|p| p.exists())
}
