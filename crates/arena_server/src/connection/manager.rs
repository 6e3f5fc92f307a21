//! Connection manager for tracking client connections and reaching players.

use super::{client::ClientConnection, ConnectionId};
use arena_core::PlayerId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Central registry of open connections.
///
/// A player may hold more than one connection at a time (a second tab, a
/// reconnect racing the old socket's close). Deliveries go to all of them,
/// and the player only counts as disconnected once the last one closes.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<ConnectionId, ClientConnection>>>,
    next_id: AtomicUsize,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Registers a new connection and returns its ID.
    ///
    /// # Arguments
    ///
    /// * `remote_addr` - The network address of the connecting client
    /// * `outbound` - Sender half of the connection's writer queue
    pub async fn add_connection(
        &self,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
    ) -> ConnectionId {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = ClientConnection::new(remote_addr, outbound);
        self.connections.write().await.insert(connection_id, connection);
        info!("🔗 Connection {} from {}", connection_id, remote_addr);
        connection_id
    }

    /// Removes a connection and returns the player it was bound to.
    pub async fn remove_connection(&self, connection_id: ConnectionId) -> Option<PlayerId> {
        let removed = self.connections.write().await.remove(&connection_id);
        let connection = removed?;
        info!(
            "❌ Connection {} from {} disconnected",
            connection_id, connection.remote_addr
        );
        connection.player_id
    }

    /// Binds a player to a connection. Returns the player previously bound
    /// to it, if any.
    pub async fn set_player_id(
        &self,
        connection_id: ConnectionId,
        player_id: PlayerId,
    ) -> Option<PlayerId> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&connection_id)?;
        connection.player_id.replace(player_id)
    }

    pub async fn get_player_id(&self, connection_id: ConnectionId) -> Option<PlayerId> {
        let connections = self.connections.read().await;
        connections.get(&connection_id).and_then(|c| c.player_id)
    }

    /// Every connection currently bound to `player_id`.
    pub async fn connections_for_player(&self, player_id: PlayerId) -> Vec<ConnectionId> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(_, c)| c.player_id == Some(player_id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn is_player_connected(&self, player_id: PlayerId) -> bool {
        let connections = self.connections.read().await;
        connections.values().any(|c| c.player_id == Some(player_id))
    }

    /// Queues a text frame for one connection.
    pub async fn send_to_connection(&self, connection_id: ConnectionId, text: String) -> bool {
        let connections = self.connections.read().await;
        match connections.get(&connection_id) {
            Some(connection) => {
                let sent = connection.try_send_text(text);
                if !sent {
                    warn!("📪 Outbound queue full or closed for connection {}", connection_id);
                }
                sent
            }
            None => false,
        }
    }

    /// Queues a text frame for every connection of each listed player and
    /// returns how many connections it was queued on.
    pub async fn send_to_players(&self, players: &[PlayerId], text: &str) -> usize {
        let connections = self.connections.read().await;
        let mut delivered = 0;
        for (connection_id, connection) in connections.iter() {
            let Some(player_id) = connection.player_id else {
                continue;
            };
            if !players.contains(&player_id) {
                continue;
            }
            if connection.try_send_text(text.to_string()) {
                delivered += 1;
            } else {
                warn!("📪 Dropped notification for connection {}", connection_id);
            }
        }
        debug!("📡 Delivered to {} connection(s)", delivered);
        delivered
    }

    /// Queues a close frame on every connection. Returns how many accepted it.
    pub async fn close_all(&self, reason: &str) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| {
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: reason.to_string().into(),
                };
                c.outbound.try_send(Message::Close(Some(frame))).is_ok()
            })
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    #[tokio::test]
    async fn players_are_reached_on_every_bound_connection() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        let first = manager.add_connection(addr(), tx1).await;
        let second = manager.add_connection(addr(), tx2).await;
        let _anonymous = manager.add_connection(addr(), tx3).await;

        let player = PlayerId::new();
        assert_eq!(manager.set_player_id(first, player).await, None);
        assert_eq!(manager.set_player_id(second, player).await, None);

        assert_eq!(manager.send_to_players(&[player], "hello").await, 2);
        assert_eq!(rx1.recv().await, Some(Message::Text("hello".into())));
        assert_eq!(rx2.recv().await, Some(Message::Text("hello".into())));
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn player_stays_connected_until_last_socket_closes() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let first = manager.add_connection(addr(), tx1).await;
        let second = manager.add_connection(addr(), tx2).await;
        let player = PlayerId::new();
        manager.set_player_id(first, player).await;
        manager.set_player_id(second, player).await;

        assert_eq!(manager.remove_connection(first).await, Some(player));
        assert!(manager.is_player_connected(player).await);
        assert_eq!(manager.remove_connection(second).await, Some(player));
        assert!(!manager.is_player_connected(player).await);
        assert_eq!(manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn full_queues_drop_instead_of_blocking() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = manager.add_connection(addr(), tx).await;

        assert!(manager.send_to_connection(id, "one".into()).await);
        assert!(!manager.send_to_connection(id, "two".into()).await);
        assert!(!manager.send_to_connection(id + 100, "three".into()).await);
    }
}
