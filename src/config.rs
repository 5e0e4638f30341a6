//! Configuration file parsing for tapnet
//!
//! Parses `tapnet.toml` files using serde. Every field has a default, so
//! an empty file (or no file at all) is a valid configuration.

use crate::error::{Error, Result};
use crate::logging::LEVELS;
use crate::network::NetworkKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Load configuration from a file
pub fn load(path: &Path) -> Result<TapnetConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: TapnetConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Load configuration from `path`, or the defaults when no path is given
pub fn load_or_default(path: Option<&Path>) -> Result<TapnetConfig> {
    match path {
        Some(path) => load(path),
        None => Ok(TapnetConfig::default()),
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TapnetConfig {
    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl TapnetConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.network.kind()?;

        if self.network.tap_queues == 0 {
            return Err(Error::ConfigValidation(
                "network.tap_queues must be at least 1".into(),
            ));
        }

        if !LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::ConfigValidation(format!(
                "Unknown log level '{}' (expected one of: {})",
                self.logging.level,
                LEVELS.join(", ")
            )));
        }

        Ok(())
    }
}

/// Sandbox network settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetworkSettings {
    /// Addressing scheme: "static" or "dynamic"
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Queues opened on each TAP device
    #[serde(default = "default_tap_queues")]
    pub tap_queues: u32,
}

impl NetworkSettings {
    /// Parsed addressing scheme
    pub fn kind(&self) -> Result<NetworkKind> {
        self.mode
            .parse()
            .map_err(|e: Error| Error::ConfigValidation(format!("network.mode: {}", e)))
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            tap_queues: default_tap_queues(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_mode() -> String {
    NetworkKind::Static.as_str().into()
}

fn default_tap_queues() -> u32 {
    1
}

fn default_level() -> String {
    "info".into()
}
