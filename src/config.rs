//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (CASCADE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [network]
//! port = 4000
//!
//! [storage]
//! base_dir = "/var/lib/cascade"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! CASCADE_NETWORK__PORT=4001
//! CASCADE_STORAGE__BASE_DIR=/custom/path
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inbound listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Inbound listen port; 0 selects an ephemeral port
    #[serde(default)]
    pub port: u16,

    /// Address the listener binds and peers dial
    #[serde(default = "default_host")]
    pub host: String,
}

/// On-disk state for durable tables
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// State root; defaults to `$HOME/cascade/tcp_<port>`
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Mailbox capacity; producers block when it is full
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mailbox_capacity() -> usize {
    4096
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig { port: 0, host: default_host() }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig { mailbox_capacity: default_mailbox_capacity() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (CASCADE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("CASCADE_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CASCADE_").split("__"))
            .extract()
    }

    /// Resolve the on-disk state root for a node listening on `port`.
    pub fn resolve_base_dir(&self, port: u16) -> PathBuf {
        match &self.storage.base_dir {
            Some(dir) => dir.clone(),
            None => {
                let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
                home.join("cascade").join(format!("tcp_{port}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, 0);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.runtime.mailbox_capacity, 4096);
        assert!(config.storage.base_dir.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).expect("serializes");
        assert!(toml_str.contains("[network]"));
        assert!(toml_str.contains("[runtime]"));
    }

    #[test]
    fn test_base_dir_default_uses_port() {
        let config = Config::default();
        let dir = config.resolve_base_dir(4000);
        assert!(dir.ends_with("cascade/tcp_4000"));
    }

    #[test]
    fn test_base_dir_override() {
        let mut config = Config::default();
        config.storage.base_dir = Some(PathBuf::from("/tmp/engine-state"));
        assert_eq!(config.resolve_base_dir(4000), PathBuf::from("/tmp/engine-state"));
    }
}
