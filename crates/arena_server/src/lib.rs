//! # Arena Server
//!
//! WebSocket front end for [`arena_core::Arena`]. The server keeps no game
//! state of its own: it accepts sockets, binds each one to the player that
//! identifies on it, turns frames into commands, and relays the arena's
//! notifications to the players they are addressed to.
//!
//! ## Message Flow
//!
//! 1. Client sends `{namespace, event, data}`
//! 2. `session.identify` binds the socket to a player and registers presence
//! 3. Every other frame is parsed into an [`arena_core::Command`] and executed
//! 4. One `reply` frame goes back to the sender, carrying `data` or `error`
//! 5. Notifications emitted along the way reach each player in their
//!    audience through the connection manager
//!
//! When a player's last socket closes the arena is told, which opens their
//! reconnection window instead of removing them straight away.

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::ArenaServer;

pub mod config;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod server;

#[cfg(test)]
mod tests;

use arena_core::Arena;
use std::sync::Arc;

/// Creates a server for `arena` with default network settings.
pub fn create_server(arena: Arc<Arena>) -> ArenaServer {
    ArenaServer::new(ServerConfig::default(), arena)
}

/// Creates a server for `arena` with the given network settings.
pub fn create_server_with_config(config: ServerConfig, arena: Arc<Arena>) -> ArenaServer {
    ArenaServer::new(config, arena)
}
