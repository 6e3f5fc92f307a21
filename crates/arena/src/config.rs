//! Configuration management for the Arena server.
//!
//! Loads the TOML file, creating it with defaults when missing, and converts
//! the `[server]` section into the connection layer's [`ServerConfig`]. The
//! `[arena]` section is the coordinators' own [`ArenaConfig`].

use arena_core::ArenaConfig;
use arena_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network settings
    pub server: ServerSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Matchmaking, lobby, game, invitation and presence tunables
    #[serde(default)]
    pub arena: ArenaConfig,
}

/// Network binding and connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind the server to (e.g., "127.0.0.1:8080")
    pub bind_address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds (0 to disable)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_max_connections() -> usize {
    ServerConfig::default().max_connections
}

fn default_connection_timeout() -> u64 {
    ServerConfig::default().connection_timeout
}

fn default_max_message_size() -> usize {
    ServerConfig::default().max_message_size
}

fn default_outbound_buffer() -> usize {
    ServerConfig::default().outbound_buffer
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind_address: defaults.bind_address.to_string(),
            max_connections: defaults.max_connections,
            connection_timeout: defaults.connection_timeout,
            max_message_size: defaults.max_message_size,
            outbound_buffer: defaults.outbound_buffer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration to `path`
    /// and returns it.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the `[server]` section into the connection layer's config.
    pub fn to_server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        Ok(ServerConfig {
            bind_address: self.server.bind_address.parse()?,
            max_connections: self.server.max_connections,
            connection_timeout: self.server.connection_timeout,
            max_message_size: self.server.max_message_size,
            outbound_buffer: self.server.outbound_buffer,
        })
    }

    /// Validates every section.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        let server = self
            .to_server_config()
            .map_err(|_| format!("Invalid bind address: {}", &self.server.bind_address))?;
        server.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        self.arena.validate()
    }
}
