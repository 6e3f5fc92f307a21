//! Server configuration types and defaults.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

/// Network settings for the WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Seconds a connection may stay silent before it is closed (0 to disable)
    pub connection_timeout: u64,

    /// Largest inbound text frame accepted, in bytes
    pub max_message_size: usize,

    /// Outbound messages buffered per connection before delivery is dropped
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            max_connections: 1000,
            connection_timeout: 60,
            max_message_size: 64 * 1024, // 64KB
            outbound_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Checks the values that would make the server unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.max_message_size == 0 {
            return Err("max_message_size must be greater than 0".to_string());
        }
        if self.outbound_buffer == 0 {
            return Err("outbound_buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.port(), 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = ServerConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            outbound_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
