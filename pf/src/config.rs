//! PageFleet configuration types and loading
//!
//! Every recognised option is an explicit field; `Config::validate` rejects bad
//! values at start instead of letting them fail deep inside dispatch.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::ManagerError;

/// Main PageFleet configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Manager (pool, retry, storage location) settings
    pub manager: ManagerConfig,

    /// One entry per worker browser
    pub browsers: Vec<BrowserConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults for `num_browsers` workers, one browser entry each
    pub fn load_default_params(num_browsers: usize) -> Self {
        debug!(num_browsers, "Config::load_default_params: called");
        Self {
            manager: ManagerConfig {
                num_browsers,
                ..Default::default()
            },
            browsers: vec![BrowserConfig::default(); num_browsers],
            logging: LoggingConfig::default(),
        }
    }

    /// Point both data and log directories at `dir`
    pub fn with_directories(mut self, dir: impl AsRef<Path>) -> Self {
        self.manager.data_directory = dir.as_ref().to_path_buf();
        self.manager.log_directory = dir.as_ref().to_path_buf();
        self
    }

    /// Path of the result store inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.manager.data_directory.join(&self.manager.database_name)
    }

    /// Validate configuration before use
    ///
    /// Creates the data and log directories and checks they are writable.
    pub fn validate(&self) -> Result<(), ManagerError> {
        debug!("Config::validate: called");
        let m = &self.manager;
        let invalid = |msg: String| Err(ManagerError::Configuration(msg));

        if m.num_browsers == 0 {
            return invalid("num-browsers must be at least 1".to_string());
        }
        if self.browsers.len() != m.num_browsers {
            return invalid(format!(
                "expected {} browser entries, found {}",
                m.num_browsers,
                self.browsers.len()
            ));
        }
        if m.command_timeout_ms == 0 {
            return invalid("command-timeout-ms must be greater than 0".to_string());
        }
        if m.shutdown_timeout_ms == 0 {
            return invalid("shutdown-timeout-ms must be greater than 0".to_string());
        }
        if m.queue_bound == Some(0) {
            return invalid("queue-bound must be at least 1 when set".to_string());
        }
        if m.backoff.initial_ms > m.backoff.max_ms {
            return invalid(format!(
                "backoff initial-ms ({}) exceeds max-ms ({})",
                m.backoff.initial_ms, m.backoff.max_ms
            ));
        }
        if m.database_name.is_empty() || m.database_name.contains('/') {
            return invalid(format!("invalid database-name '{}'", m.database_name));
        }
        for (i, browser) in self.browsers.iter().enumerate() {
            if browser.binary.as_os_str().is_empty() {
                return invalid(format!("browser {} has an empty binary path", i));
            }
            if browser.launch_timeout_ms == 0 {
                return invalid(format!("browser {} launch-timeout-ms must be greater than 0", i));
            }
        }

        ensure_writable_dir("data-directory", &m.data_directory)?;
        ensure_writable_dir("log-directory", &m.log_directory)?;
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from("pagefleet.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("pagefleet").join("pagefleet.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::load_default_params(ManagerConfig::default().num_browsers))
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let mut config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        if config.browsers.is_empty() {
            config.browsers = vec![BrowserConfig::default(); config.manager.num_browsers];
        }

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn ensure_writable_dir(name: &str, dir: &Path) -> Result<(), ManagerError> {
    if dir.as_os_str().is_empty() {
        return Err(ManagerError::Configuration(format!("{} must not be empty", name)));
    }
    fs::create_dir_all(dir)
        .map_err(|e| ManagerError::Configuration(format!("cannot create {} {}: {}", name, dir.display(), e)))?;

    let marker = dir.join(".pagefleet-write-check");
    fs::write(&marker, b"")
        .map_err(|e| ManagerError::Configuration(format!("{} {} is not writable: {}", name, dir.display(), e)))?;
    let _ = fs::remove_file(&marker);
    Ok(())
}

fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pagefleet")
}

/// Where a crashed command goes back into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryPlacement {
    /// Front of the queue, keeps rough submission order
    #[default]
    Head,
    /// Back of the queue
    Tail,
}

/// Restart backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

/// Backoff applied before a crashed worker becomes idle again
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub kind: BackoffKind,

    #[serde(rename = "initial-ms")]
    pub initial_ms: u64,

    #[serde(rename = "max-ms")]
    pub max_ms: u64,

    /// Randomise each delay by up to 25%
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial_ms: 500,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

/// Task manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Pool size: number of concurrent browser workers
    #[serde(rename = "num-browsers")]
    pub num_browsers: usize,

    #[serde(rename = "data-directory")]
    pub data_directory: PathBuf,

    #[serde(rename = "log-directory")]
    pub log_directory: PathBuf,

    /// Name of the result store inside the data directory
    #[serde(rename = "database-name")]
    pub database_name: String,

    /// Per-command execution timeout in milliseconds
    #[serde(rename = "command-timeout-ms")]
    pub command_timeout_ms: u64,

    /// Retries after the first attempt before a command fails
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Consecutive crashes after which a worker is terminated
    #[serde(rename = "max-consecutive-crashes")]
    pub max_consecutive_crashes: u32,

    /// Launch attempts per (re)start before a worker is terminated
    #[serde(rename = "max-restart-attempts")]
    pub max_restart_attempts: u32,

    /// Maximum queued commands (unbounded when absent)
    #[serde(rename = "queue-bound")]
    pub queue_bound: Option<usize>,

    #[serde(rename = "retry-placement")]
    pub retry_placement: RetryPlacement,

    /// Time allowed for workers to stop before they are killed
    #[serde(rename = "shutdown-timeout-ms")]
    pub shutdown_timeout_ms: u64,

    pub backoff: BackoffConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            num_browsers: 1,
            data_directory: base.join("data"),
            log_directory: base.join("logs"),
            database_name: "crawl-data".to_string(),
            command_timeout_ms: 60_000,
            max_retries: 2,
            max_consecutive_crashes: 5,
            max_restart_attempts: 3,
            queue_bound: None,
            retry_placement: RetryPlacement::Head,
            shutdown_timeout_ms: 10_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// How the browser renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Headless,
    Native,
    Xvfb,
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Headless => write!(f, "headless"),
            Self::Native => write!(f, "native"),
            Self::Xvfb => write!(f, "xvfb"),
        }
    }
}

/// Per-worker browser settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Driver executable (bare names are looked up on PATH)
    pub binary: PathBuf,

    /// Extra arguments passed to the driver
    pub args: Vec<String>,

    #[serde(rename = "display-mode")]
    pub display_mode: DisplayMode,

    /// Time allowed for the driver to report ready
    #[serde(rename = "launch-timeout-ms")]
    pub launch_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pagefleet-driver"),
            args: Vec::new(),
            display_mode: DisplayMode::Headless,
            launch_timeout_ms: 30_000,
        }
    }
}

impl BrowserConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the log file (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: Option<String>,

    /// Level for console output
    #[serde(rename = "console-level")]
    pub console_level: Option<String>,
}
