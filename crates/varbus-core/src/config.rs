//! Daemon configuration parsing.
//!
//! `varbusd` reads an optional TOML file (`varbusd.toml`) and applies CLI
//! overrides on top. Every field has a default so an empty file (or no
//! file at all) yields a runnable configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default TCP port for the connection-oriented transport.
pub const DEFAULT_TCP_PORT: u16 = 22082;

/// Default metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9630;

/// Upper bound on a client working buffer.
pub const MAX_WORKBUF: usize = 1024 * 1024;

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Runtime directory holding the local socket and the status file.
    pub runtime_dir: PathBuf,

    /// TCP port for the connection-oriented transport.
    pub tcp_port: u16,

    /// Whether the TCP transport is enabled at all.
    pub tcp_enabled: bool,

    /// Metrics HTTP port (`/metrics`).
    pub metrics_port: u16,

    /// Whether the metrics endpoint is served.
    pub metrics_enabled: bool,

    /// Fixed capacity of the variable table.
    pub max_variables: usize,

    /// Fixed capacity of the client registry.
    pub max_clients: usize,

    /// Default working-buffer size for clients that request none.
    pub default_workbuf: usize,

    /// Liveness sweep interval in seconds.
    pub sweep_interval_secs: u64,

    /// Statistics logging interval in seconds.
    pub stats_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/run/varbus"),
            tcp_port: DEFAULT_TCP_PORT,
            tcp_enabled: true,
            metrics_port: DEFAULT_METRICS_PORT,
            metrics_enabled: true,
            max_variables: 4096,
            max_clients: 256,
            default_workbuf: 8192,
            sweep_interval_secs: 10,
            stats_interval_secs: 60,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a field fails
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_variables == 0 {
            return Err(ConfigError::validation("max_variables must be nonzero"));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::validation("max_clients must be nonzero"));
        }
        if self.default_workbuf == 0 || self.default_workbuf > MAX_WORKBUF {
            return Err(ConfigError::validation(
                "default_workbuf must be between 1 and 1 MiB",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::validation("sweep_interval_secs must be nonzero"));
        }
        Ok(())
    }

    /// Path of the local (Unix-domain) request socket.
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("varbus.sock")
    }

    /// Path of the published status file (server process identity).
    #[must_use]
    pub fn status_path(&self) -> PathBuf {
        self.runtime_dir.join("varbusd.pid")
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),

    /// TOML parse failure.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    /// A field failed validation.
    #[error("invalid config: {0}")]
    Validation(String),
}

impl ConfigError {
    fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config.tcp_port, DEFAULT_TCP_PORT);
        assert_eq!(config.max_variables, 4096);
        assert!(config.tcp_enabled);
    }

    #[test]
    fn overrides_apply() {
        let config = DaemonConfig::from_toml(
            r#"
            runtime_dir = "/tmp/vb-test"
            tcp_enabled = false
            max_variables = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/vb-test"));
        assert!(!config.tcp_enabled);
        assert_eq!(config.max_variables, 64);
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/vb-test/varbus.sock"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DaemonConfig::from_toml("socket = \"/tmp/x\"").is_err());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(DaemonConfig::from_toml("max_variables = 0").is_err());
        assert!(DaemonConfig::from_toml("sweep_interval_secs = 0").is_err());
    }
}
