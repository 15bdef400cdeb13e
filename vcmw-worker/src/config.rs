//! Worker configuration
//!
//! The TOML bootstrap file is loaded by `vcmw_common::config`. Command-line
//! flags (with environment fallbacks) then override individual keys.

use std::path::PathBuf;
use vcmw_common::config::TomlConfig;

use crate::{Error, Result};

/// Per-key overrides collected from the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub database_path: Option<PathBuf>,
    pub bridge_url: Option<String>,
    pub log_chat_id: Option<i64>,
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    /// Apply overrides on top of the file/default values and re-validate
    pub fn apply(self, mut config: TomlConfig) -> Result<TomlConfig> {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = self.database_path {
            config.database_path = path;
        }
        if let Some(url) = self.bridge_url {
            config.bridge_url = url;
        }
        if let Some(chat) = self.log_chat_id {
            config.log_chat_id = Some(chat);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.validate().map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }
}

/// `EnvFilter` directive used when `RUST_LOG` is not set
///
/// A bare level applies to the worker crates and the HTTP trace layer; any
/// other value is taken as a full directive.
pub fn default_filter(level: &str) -> String {
    let level = level.trim();
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => {
            format!("vcmw_worker={0},vcmw_common={0},tower_http={0}", level)
        }
        "" => "vcmw_worker=debug,vcmw_common=info,tower_http=debug".to_string(),
        directive => directive.to_string(),
    }
}
