//! Connection handling logic for WebSocket clients.

use crate::{
    config::ServerConfig,
    connection::ConnectionManager,
    error::ServerError,
    messaging::{
        route_client_message,
        types::{error_frame, ErrorBody},
    },
};
use arena_core::Arena;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, trace};

/// How long the writer may keep flushing after the reader has finished.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Handles a single client connection from handshake to cleanup.
///
/// # Connection Flow
///
/// 1. Perform the WebSocket handshake
/// 2. Register the connection and its outbound queue
/// 3. Spawn the writer, which drains the queue into the socket
/// 4. Read frames and route each one until close, error or idle timeout
/// 5. Deregister; if that was the player's last connection, report the
///    disconnect to the arena so the reconnection window opens
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connection_manager: Arc<ConnectionManager>,
    arena: Arc<Arena>,
    config: ServerConfig,
) -> Result<(), ServerError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ServerError::Network(format!("WebSocket handshake failed: {e}")))?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<Message>(config.outbound_buffer);
    let connection_id = connection_manager.add_connection(addr, outbound.clone()).await;

    // Ends once every sender is gone, i.e. after deregistration below.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = ws_sender.send(message).await {
                debug!("Failed to send to connection {}: {}", connection_id, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let idle_limit = (config.connection_timeout > 0).then(|| Duration::from_secs(config.connection_timeout));
    loop {
        let next = match idle_limit {
            Some(limit) => match tokio::time::timeout(limit, ws_receiver.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!("⏱️ Connection {} idle for {}s, closing", connection_id, limit.as_secs());
                    let _ = outbound.try_send(Message::Close(None));
                    break;
                }
            },
            None => ws_receiver.next().await,
        };
        let Some(frame) = next else {
            break;
        };

        match frame {
            Ok(Message::Text(text)) => {
                if text.len() > config.max_message_size {
                    let body = ErrorBody::invalid_request(format!(
                        "message of {} bytes exceeds the {} byte limit",
                        text.len(),
                        config.max_message_size
                    ));
                    if let Ok(reply) = error_frame("unknown", &body) {
                        connection_manager.send_to_connection(connection_id, reply).await;
                    }
                    continue;
                }
                if let Err(e) =
                    route_client_message(text.as_str(), connection_id, &connection_manager, &arena).await
                {
                    error!("❌ Message routing error on connection {}: {}", connection_id, e);
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = outbound.try_send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                debug!("🔌 Client {} requested close", connection_id);
                break;
            }
            Ok(_) => trace!("Ignoring non-text frame on connection {}", connection_id),
            Err(e) => {
                debug!("WebSocket error for connection {}: {}", connection_id, e);
                break;
            }
        }
    }

    let player_id = connection_manager.remove_connection(connection_id).await;
    drop(outbound);
    let _ = tokio::time::timeout(WRITER_DRAIN, writer).await;

    if let Some(player_id) = player_id {
        if !connection_manager.is_player_connected(player_id).await {
            arena.disconnect(player_id).await;
        }
    }
    Ok(())
}
