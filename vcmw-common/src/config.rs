//! Bootstrap configuration loading
//!
//! The worker reads a small TOML file at startup. Location priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`VCMW_CONFIG`)
//! 3. Platform config file (`~/.config/vcmw/config.toml`, then `/etc/vcmw/config.toml`)
//! 4. Built-in defaults
//!
//! A missing file at steps 3-4 is not an error; a missing file named
//! explicitly at steps 1-2 is. Individual keys can be overridden afterwards by
//! command-line flags in the binary.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "VCMW_CONFIG";

/// Bootstrap configuration loaded from TOML
///
/// These settings cannot change while the worker runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Path to the shared SQLite task database
    pub database_path: PathBuf,

    /// HTTP control/health port
    pub port: u16,

    /// Base URL of the chat/voice bridge process
    pub bridge_url: String,

    /// Chat that receives operational log messages (optional)
    pub log_chat_id: Option<i64>,

    pub worker: WorkerConfig,
    pub fetcher: FetcherConfig,
    pub logging: LoggingConfig,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            port: 5790,
            bridge_url: "http://127.0.0.1:5791".to_string(),
            log_chat_id: None,
            worker: WorkerConfig::default(),
            fetcher: FetcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TomlConfig {
    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bridge_url.trim().is_empty() {
            return Err(Error::Config("bridge_url must not be empty".to_string()));
        }
        self.worker.validate()
    }
}

/// Orchestrator timing and capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between claims when the queue is empty
    pub poll_interval_ms: u64,
    /// Wait after joining a destination by invite
    pub settle_delay_ms: u64,
    /// Hold window used when the track length is unknown
    pub fallback_hold_secs: u64,
    /// Added to a known track length before the hold gives up
    pub hold_margin_secs: u64,
    /// Advisory timeout for chat/voice calls
    pub collaborator_timeout_ms: u64,
    /// Advisory timeout for a media fetch
    pub fetch_timeout_secs: u64,
    /// Attempts at join/replace-stream before the task errors
    pub max_join_attempts: u32,
    /// Pipelines allowed to run at once across all destinations
    pub max_concurrent_pipelines: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            settle_delay_ms: 2000,
            fallback_hold_secs: 240,
            hold_margin_secs: 5,
            collaborator_timeout_ms: 15_000,
            fetch_timeout_secs: 180,
            max_join_attempts: 3,
            max_concurrent_pipelines: 8,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn fallback_hold(&self) -> Duration {
        Duration::from_secs(self.fallback_hold_secs)
    }

    pub fn hold_margin(&self) -> Duration {
        Duration::from_secs(self.hold_margin_secs)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("worker.poll_interval_ms must be > 0".to_string()));
        }
        if self.max_join_attempts == 0 {
            return Err(Error::Config("worker.max_join_attempts must be >= 1".to_string()));
        }
        if self.max_concurrent_pipelines == 0 {
            return Err(Error::Config(
                "worker.max_concurrent_pipelines must be >= 1".to_string(),
            ));
        }
        if self.collaborator_timeout_ms == 0 || self.fetch_timeout_secs == 0 {
            return Err(Error::Config("worker timeouts must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Media downloader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Downloader executable
    pub program: String,
    /// Where fetched audio files are written
    pub download_dir: PathBuf,
    /// Cookies file passed to the downloader when it exists
    pub cookies_file: PathBuf,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            download_dir: PathBuf::from("downloads"),
            cookies_file: PathBuf::from("cookies.txt"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Locate the config file following the documented priority order
///
/// Returns `None` when no explicit path was given and no platform file exists.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config file
    platform_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

/// Load configuration, falling back to defaults when no file is found
pub fn load_config(cli_arg: Option<&Path>, env_var_name: &str) -> Result<TomlConfig> {
    let config = match resolve_config_path(cli_arg, env_var_name) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)?
        }
        None => {
            warn!("No configuration file found, using built-in defaults");
            TomlConfig::default()
        }
    };

    config.validate()?;
    Ok(config)
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config file {}: {}", path.display(), e)))
}

/// Write a config file (used to seed a default config)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn platform_config_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("vcmw").join("config.toml"));
    }
    if cfg!(unix) {
        candidates.push(PathBuf::from("/etc/vcmw/config.toml"));
    }
    candidates
}

/// OS-dependent default database location
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("vcmw"))
        .unwrap_or_else(|| PathBuf::from("./vcmw_data"))
        .join("tasks.db")
}
