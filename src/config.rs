//! Server configuration
//!
//! Every field has a default, so an empty (or absent) TOML file is a valid
//! configuration.

use std::fs;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::session::SessionSettings;

/// Runtime configuration for the relay
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener address
    pub bind_addr: String,
    /// Only upgrade requests for this path are accepted
    pub ws_path: String,
    /// How long a new connection may take to claim a username
    pub handshake_timeout_ms: u64,
    /// Deadline for writing one message to a client
    pub write_timeout_ms: u64,
    /// Per-session outbound queue size
    pub mailbox_capacity: usize,
    /// Registry command queue size
    pub command_buffer: usize,
    /// How long shutdown waits for session writers to drain
    pub shutdown_grace_ms: u64,
    /// Used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8123".to_string(),
            ws_path: "/ws".to_string(),
            handshake_timeout_ms: 5000,
            write_timeout_ms: 1000,
            mailbox_capacity: 1024,
            command_buffer: 1024,
            shutdown_grace_ms: 5000,
            log_filter: "chat_relay=info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a TOML config file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "ws_path must start with '/': {:?}",
                self.ws_path
            )));
        }
        let zeroes = [
            ("handshake_timeout_ms", self.handshake_timeout_ms == 0),
            ("write_timeout_ms", self.write_timeout_ms == 0),
            ("mailbox_capacity", self.mailbox_capacity == 0),
            ("command_buffer", self.command_buffer == 0),
        ];
        if let Some((name, _)) = zeroes.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            mailbox_capacity: self.mailbox_capacity,
            write_timeout: self.write_timeout(),
        }
    }
}
