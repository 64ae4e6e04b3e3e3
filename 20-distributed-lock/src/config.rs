//! Server configuration.
//!
//! Values come from an optional TOML file and are then overridden by any
//! command-line flags that were given explicitly.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 5555;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the broker binds its client-facing endpoint to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Pending-connection backlog passed to `listen(2)`.
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Directory holding one payload file per resource.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Keep payloads in memory instead of `data_dir`.
    #[serde(default)]
    pub memory: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Loopback on [`DEFAULT_PORT`]; also the client's default server.
pub fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))
}

fn default_backlog() -> u32 {
    1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            data_dir: default_data_dir(),
            memory: false,
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog must be at least 1".into()));
        }
        if !self.memory && self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        Ok(())
    }
}
