//! The WebSocket server: binds, accepts and hands connections off.

use crate::{
    config::ServerConfig,
    connection::{ConnectionManager, NotificationRelay},
    error::ServerError,
    server::handlers::handle_connection,
};
use arena_core::{Arena, ShutdownState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Accepts WebSocket clients and connects them to an [`Arena`].
///
/// The server owns no game state. Commands go to the arena, and the
/// [`NotificationRelay`] carries the arena's notifications back out.
pub struct ArenaServer {
    config: ServerConfig,
    arena: Arc<Arena>,
    connection_manager: Arc<ConnectionManager>,
}

impl ArenaServer {
    pub fn new(config: ServerConfig, arena: Arc<Arena>) -> Self {
        Self {
            config,
            arena,
            connection_manager: Arc::new(ConnectionManager::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| {
                ServerError::Network(format!("Failed to bind {}: {e}", self.config.bind_address))
            })
    }

    /// Binds and serves until `shutdown` is initiated.
    pub async fn start_with_shutdown_state(&self, shutdown: ShutdownState) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serves on an already-bound listener until `shutdown` is initiated,
    /// then asks every open connection to close.
    pub async fn serve(&self, listener: TcpListener, shutdown: ShutdownState) -> Result<(), ServerError> {
        let local_addr: SocketAddr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(e.to_string()))?;
        let relay = NotificationRelay::new(self.connection_manager.clone())
            .spawn(self.arena.events(), shutdown.clone());
        info!("🚀 Arena server listening on {}", local_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr).await,
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown.wait() => break,
            }
        }

        let closing = self.connection_manager.close_all("server shutting down").await;
        info!("🛑 Stopped accepting connections, closing {} open connection(s)", closing);
        let _ = relay.await;
        Ok(())
    }

    async fn admit(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let open = self.connection_manager.connection_count().await;
        if open >= self.config.max_connections {
            warn!("🚫 Refusing {}: {} connections open (max {})", addr, open, self.config.max_connections);
            return;
        }

        let connection_manager = self.connection_manager.clone();
        let arena = self.arena.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, connection_manager, arena, config).await {
                debug!("Connection from {} ended with error: {}", addr, e);
            }
        });
    }
}
