//! Configuration management for burrow

mod relay;
pub mod serde_utils;
mod ssh_server;
mod tunnel;

pub use relay::RelayConfig;
pub use ssh_server::SshServerConfig;
pub use tunnel::TunnelConfig;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Embedded SSH server settings
    pub ssh_server: SshServerConfig,

    /// Orchestrator settings
    pub tunnel: TunnelConfig,

    /// Relay hop settings
    pub relay: RelayConfig,
}

impl ConfigFile {
    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file at an explicit path is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => load_config(path),
            None => match load_config(&default_config_path()) {
                Err(ConfigError::NotFound(_)) => Ok(Self::default()),
                other => other,
            },
        }
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("burrow")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ConfigFile::default();
        config.ssh_server.address = "127.0.0.1:2200".to_string();
        config.tunnel.refresh_interval = Duration::from_secs(5);
        config.relay.allow_docker_credentials = true;

        save_config(&path, &config).unwrap();
        let loaded: ConfigFile = load_config(&path).unwrap();

        assert_eq!(loaded.ssh_server.address, "127.0.0.1:2200");
        assert_eq!(loaded.tunnel.refresh_interval, Duration::from_secs(5));
        assert!(loaded.relay.allow_docker_credentials);
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let result = ConfigFile::load_or_default(Some(&path));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay]\nshow_logs = true\n").unwrap();

        let loaded: ConfigFile = load_config(&path).unwrap();
        assert!(loaded.relay.show_logs);
        assert_eq!(loaded.ssh_server.address, "0.0.0.0:8022");
        assert_eq!(loaded.tunnel.refresh_interval, Duration::from_secs(30));
    }
}
