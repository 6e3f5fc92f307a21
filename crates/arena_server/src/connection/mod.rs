//! Connection management for client connections.
//!
//! Tracks each open socket, the player it identified as, and the outbound
//! queue its writer task drains.

pub mod client;
pub mod manager;
pub mod response;

pub use manager::ConnectionManager;
pub use response::NotificationRelay;

/// Identifier for one socket, unique for the lifetime of the process.
pub type ConnectionId = usize;
