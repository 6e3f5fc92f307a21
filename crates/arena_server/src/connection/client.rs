//! Client connection representation.

use arena_core::PlayerId;
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Represents one client socket.
///
/// # Fields
///
/// * `player_id` - Set once the client sends `session.identify`
/// * `remote_addr` - The network address of the connected client
/// * `connected_at` - Timestamp when the connection was established
/// * `outbound` - Queue drained by the connection's writer task
#[derive(Debug)]
pub struct ClientConnection {
    pub player_id: Option<PlayerId>,
    pub remote_addr: SocketAddr,
    pub connected_at: SystemTime,
    pub outbound: mpsc::Sender<Message>,
}

impl ClientConnection {
    pub fn new(remote_addr: SocketAddr, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            player_id: None,
            remote_addr,
            connected_at: SystemTime::now(),
            outbound,
        }
    }

    /// Queues a text frame without waiting. Returns `false` when the queue is
    /// full or the writer has gone away.
    pub fn try_send_text(&self, text: String) -> bool {
        self.outbound.try_send(Message::Text(text.into())).is_ok()
    }
}
