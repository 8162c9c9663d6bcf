//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/deskpulse/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/deskpulse/` (~/.config/deskpulse/)
//! - Data: `$XDG_DATA_HOME/deskpulse/` (~/.local/share/deskpulse/)
//! - State/Logs: `$XDG_STATE_HOME/deskpulse/` (~/.local/state/deskpulse/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides `analysis.api_key`.
pub const API_KEY_ENV: &str = "DESKPULSE_API_KEY";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Screen capture cadence and payload shaping
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Batch flush triggers
    #[serde(default)]
    pub batch: BatchConfig,

    /// Vision analysis endpoint and retry policy
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Time-bucket aggregation
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Data retention
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Service lifecycle
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Screen capture configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Seconds between capture ticks
    #[serde(default = "default_screenshot_interval")]
    pub screenshot_interval_seconds: u64,

    /// Screenshot command; `{path}` is replaced with the output file.
    /// When unset a platform default is used (`screencapture` on macOS, `grim` elsewhere).
    pub command: Option<Vec<String>>,

    /// Seconds before a single capture attempt is abandoned
    #[serde(default = "default_capture_timeout")]
    pub timeout_secs: u64,

    /// Longest edge of the normalized image, in pixels
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    /// Initial JPEG quality
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Upper bound on an encoded payload, in bytes
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Consecutive capture failures before the runner escalates to an error log
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            screenshot_interval_seconds: default_screenshot_interval(),
            command: None,
            timeout_secs: default_capture_timeout(),
            max_dimension: default_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
            max_payload_bytes: default_max_payload_bytes(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.screenshot_interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_screenshot_interval() -> u64 {
    10
}

fn default_capture_timeout() -> u64 {
    10
}

fn default_max_dimension() -> u32 {
    1920
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_max_payload_bytes() -> usize {
    4_000_000
}

fn default_max_consecutive_errors() -> u32 {
    5
}

/// Batch flush configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    /// Captures per batch (size trigger)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds after the first capture before a partial batch is flushed (time trigger)
    #[serde(default = "default_batch_interval")]
    pub batch_interval_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_interval_seconds: default_batch_interval(),
        }
    }
}

impl BatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_seconds)
    }
}

fn default_batch_size() -> usize {
    12
}

fn default_batch_interval() -> u64 {
    120
}

/// Vision analysis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Analysis server URL (e.g., `https://vision.example.com`)
    pub endpoint: Option<String>,

    /// Model identifier forwarded to the endpoint
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (can also use `DESKPULSE_API_KEY`)
    pub api_key: Option<String>,

    /// Maximum batches in flight (K)
    #[serde(default = "default_concurrency")]
    pub analysis_concurrency: usize,

    /// Total attempts per batch, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on a single backoff delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_model(),
            api_key: None,
            analysis_concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_analysis_timeout(),
        }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// API key from config, falling back to the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|key| !key.is_empty())
    }
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_concurrency() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_analysis_timeout() -> u64 {
    60
}

/// Aggregation configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// Width of an aggregation bucket
    #[serde(default = "default_bucket_width")]
    pub bucket_width_minutes: u32,

    /// Seconds after a bucket ends before it is finalized
    #[serde(default = "default_finalization_horizon")]
    pub finalization_horizon_seconds: u64,

    /// Focus-state to score mapping
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bucket_width_minutes: default_bucket_width(),
            finalization_horizon_seconds: default_finalization_horizon(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl MetricsConfig {
    pub fn bucket_width(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.bucket_width_minutes as i64)
    }

    pub fn finalization_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.finalization_horizon_seconds as i64)
    }
}

fn default_bucket_width() -> u32 {
    15
}

fn default_finalization_horizon() -> u64 {
    // Retries on a full batch can take several minutes; keep windows open long enough.
    900
}

/// Per-state focus values on a 0-100 scale
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScoringConfig {
    #[serde(default = "default_focused_score")]
    pub focused: f64,
    #[serde(default = "default_neutral_score")]
    pub neutral: f64,
    #[serde(default = "default_scattered_score")]
    pub scattered: f64,

    /// Pull low-confidence observations toward `neutral`
    #[serde(default)]
    pub confidence_weighted: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            focused: default_focused_score(),
            neutral: default_neutral_score(),
            scattered: default_scattered_score(),
            confidence_weighted: false,
        }
    }
}

fn default_focused_score() -> f64 {
    100.0
}

fn default_neutral_score() -> f64 {
    50.0
}

fn default_scattered_score() -> f64 {
    0.0
}

/// Retention configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Days of capture records and buckets to keep
    #[serde(default = "default_retention_days")]
    pub data_retention_days: u32,

    /// Minutes between pruning passes while the service runs
    #[serde(default = "default_prune_interval")]
    pub prune_interval_minutes: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            data_retention_days: default_retention_days(),
            prune_interval_minutes: default_prune_interval(),
        }
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.data_retention_days as i64)
    }
}

fn default_retention_days() -> u32 {
    90
}

fn default_prune_interval() -> u64 {
    60
}

/// Service lifecycle configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Seconds to wait for in-flight analysis during shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Seconds between bucket finalization sweeps
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_seconds: default_shutdown_grace(),
            maintenance_interval_seconds: default_maintenance_interval(),
        }
    }
}

impl ServiceConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds)
    }
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_maintenance_interval() -> u64 {
    60
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.capture.screenshot_interval_seconds == 0 {
            return Err(Error::Config(
                "capture.screenshot_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.capture.jpeg_quality == 0 || self.capture.jpeg_quality > 100 {
            return Err(Error::Config(
                "capture.jpeg_quality must be between 1 and 100".to_string(),
            ));
        }
        if self.capture.max_dimension == 0 {
            return Err(Error::Config(
                "capture.max_dimension must be at least 1".to_string(),
            ));
        }
        if let Some(command) = &self.capture.command {
            if command.is_empty() {
                return Err(Error::Config(
                    "capture.command must name a program".to_string(),
                ));
            }
        }
        if self.batch.batch_size == 0 {
            return Err(Error::Config(
                "batch.batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch.batch_interval_seconds == 0 {
            return Err(Error::Config(
                "batch.batch_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.analysis.analysis_concurrency == 0 {
            return Err(Error::Config(
                "analysis.analysis_concurrency must be at least 1".to_string(),
            ));
        }
        if self.analysis.max_attempts == 0 {
            return Err(Error::Config(
                "analysis.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.analysis.base_delay_ms > self.analysis.max_delay_ms {
            return Err(Error::Config(
                "analysis.base_delay_ms must not exceed analysis.max_delay_ms".to_string(),
            ));
        }
        let width = self.metrics.bucket_width_minutes;
        if width == 0 || (24 * 60) % width != 0 {
            return Err(Error::Config(
                "metrics.bucket_width_minutes must evenly divide a day".to_string(),
            ));
        }
        let scoring = &self.metrics.scoring;
        for (name, value) in [
            ("focused", scoring.focused),
            ("neutral", scoring.neutral),
            ("scattered", scoring.scattered),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::Config(format!(
                    "metrics.scoring.{} must be between 0 and 100",
                    name
                )));
            }
        }
        if self.retention.data_retention_days == 0 {
            return Err(Error::Config(
                "retention.data_retention_days must be at least 1".to_string(),
            ));
        }
        if self.service.maintenance_interval_seconds == 0 {
            return Err(Error::Config(
                "service.maintenance_interval_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/deskpulse/config.toml` (~/.config/deskpulse/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("deskpulse").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/deskpulse/` (~/.local/share/deskpulse/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("deskpulse")
    }

    /// Returns the state directory path (for logs and temporary captures)
    ///
    /// `$XDG_STATE_HOME/deskpulse/` (~/.local/state/deskpulse/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("deskpulse")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/deskpulse/data.db` (~/.local/share/deskpulse/data.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/deskpulse/deskpulse.log` (~/.local/state/deskpulse/deskpulse.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("deskpulse.log")
    }

    /// Directory where the capture command writes its scratch files
    pub fn capture_scratch_dir() -> PathBuf {
        Self::state_dir().join("captures")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
