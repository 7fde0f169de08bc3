//! Relay server configuration
//!
//! Loads relay settings from a TOML file. Every field has a default, so a
//! missing file or a partial file is fine.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Default bind address
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Default listening port
pub const DEFAULT_PORT: u16 = 4600;
/// Default cap on simultaneously registered sensors
pub const DEFAULT_MAX_SENSORS: usize = 1024;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Relay server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum number of simultaneously registered sensors
    pub max_sensors: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            max_sensors: DEFAULT_MAX_SENSORS,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns the defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
