//! Routes parsed client frames to the arena and queues the reply.

use crate::{
    connection::{ConnectionId, ConnectionManager},
    error::ServerError,
    messaging::types::{
        error_frame, reply_frame, ClientMessage, ErrorBody, IdentifyReply, IdentifyRequest,
    },
};
use arena_core::{Arena, ArenaError, Command, ErrorKind, PlayerId};
use tracing::{debug, trace, warn};

/// Handles one inbound text frame and queues exactly one reply for the
/// sending connection.
///
/// # Arguments
///
/// * `text` - The raw frame from the client (expected to be JSON)
/// * `connection_id` - The connection the frame arrived on
/// * `connection_manager` - Used to look up and bind the player identity
/// * `arena` - The command hub the frame is dispatched to
///
/// # Returns
///
/// `Ok(())` once a reply was queued. Rejected commands are reported to the
/// client and are not errors here; only a reply that cannot be encoded is.
pub async fn route_client_message(
    text: &str,
    connection_id: ConnectionId,
    connection_manager: &ConnectionManager,
    arena: &Arena,
) -> Result<(), ServerError> {
    let frame = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => dispatch(message, connection_id, connection_manager, arena).await?,
        Err(e) => encode_error("unknown", ErrorBody::invalid_request(format!("Invalid JSON: {e}")))?,
    };
    connection_manager.send_to_connection(connection_id, frame).await;
    Ok(())
}

async fn dispatch(
    message: ClientMessage,
    connection_id: ConnectionId,
    connection_manager: &ConnectionManager,
    arena: &Arena,
) -> Result<String, ServerError> {
    let request = message.request_name();
    if message.is_identify() {
        return identify(&request, message, connection_id, connection_manager, arena).await;
    }

    let Some(player_id) = connection_manager.get_player_id(connection_id).await else {
        return encode_error(
            &request,
            ErrorBody::new(ErrorKind::Unauthorized, "identify before sending commands"),
        );
    };

    let command = match Command::parse(&message.namespace, &message.event, message.data) {
        Ok(command) => command,
        Err(e) => {
            trace!("❌ Unparseable '{}' from connection {}: {}", request, connection_id, e);
            return encode_error(&request, ErrorBody::invalid_request(e.to_string()));
        }
    };

    debug!("📨 Routing '{}' from player {}", request, player_id);
    match arena.execute(player_id, command).await {
        Ok(reply) => encode_reply(&request, &reply),
        Err(e) => {
            report(&request, player_id, &e);
            encode_error(&request, ErrorBody::new(e.kind(), e.to_string()))
        }
    }
}

async fn identify(
    request: &str,
    message: ClientMessage,
    connection_id: ConnectionId,
    connection_manager: &ConnectionManager,
    arena: &Arena,
) -> Result<String, ServerError> {
    let identity: IdentifyRequest = match serde_json::from_value(message.data) {
        Ok(identity) => identity,
        Err(e) => return encode_error(request, ErrorBody::invalid_request(e.to_string())),
    };
    let username = identity.username.trim();
    if username.is_empty() {
        return encode_error(request, ErrorBody::invalid_request("username must not be empty"));
    }

    let bound = connection_manager.get_player_id(connection_id).await;
    let player_id = identity.player_id.or(bound).unwrap_or_default();
    if bound.is_some_and(|current| current != player_id) {
        return encode_error(
            request,
            ErrorBody::new(
                ErrorKind::Conflict,
                "connection is already identified as another player",
            ),
        );
    }

    match arena.connect(player_id, username).await {
        Ok((player, outcome)) => {
            connection_manager.set_player_id(connection_id, player_id).await;
            encode_reply(request, &IdentifyReply { player, outcome })
        }
        Err(e) => {
            report(request, player_id, &e);
            encode_error(request, ErrorBody::new(e.kind(), e.to_string()))
        }
    }
}

fn report(request: &str, player_id: PlayerId, error: &ArenaError) {
    if error.is_fatal() {
        warn!("⚠️ '{}' from player {} failed: {}", request, player_id, error);
    } else {
        trace!("'{}' from player {} rejected: {}", request, player_id, error);
    }
}

fn encode_reply<T: serde::Serialize>(request: &str, data: &T) -> Result<String, ServerError> {
    reply_frame(request, data).map_err(|e| ServerError::Internal(format!("Failed to encode reply: {e}")))
}

fn encode_error(request: &str, body: ErrorBody) -> Result<String, ServerError> {
    error_frame(request, &body).map_err(|e| ServerError::Internal(format!("Failed to encode error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_core::{ArenaConfig, MemoryStorage, SystemClock};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    struct Client {
        id: ConnectionId,
        rx: mpsc::Receiver<Message>,
    }

    impl Client {
        async fn send(&mut self, manager: &ConnectionManager, arena: &Arena, frame: Value) -> Value {
            route_client_message(&frame.to_string(), self.id, manager, arena)
                .await
                .unwrap();
            match self.rx.recv().await {
                Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    async fn setup() -> (ConnectionManager, Arena) {
        let arena = Arena::new(
            ArenaConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(SystemClock),
        );
        (ConnectionManager::new(), arena)
    }

    async fn client(manager: &ConnectionManager) -> Client {
        let (tx, rx) = mpsc::channel(16);
        let id = manager
            .add_connection(SocketAddr::from(([127, 0, 0, 1], 4000)), tx)
            .await;
        Client { id, rx }
    }

    #[tokio::test]
    async fn commands_require_identification() {
        let (manager, arena) = setup().await;
        let mut alice = client(&manager).await;

        let reply = alice
            .send(&manager, &arena, json!({"namespace": "queue", "event": "status"}))
            .await;
        assert_eq!(reply["request"], "queue.status");
        assert_eq!(reply["error"]["kind"], "unauthorized");

        let reply = alice
            .send(
                &manager,
                &arena,
                json!({"namespace": "session", "event": "identify", "data": {"username": "alice"}}),
            )
            .await;
        assert_eq!(reply["data"]["outcome"], "new");
        assert_eq!(reply["data"]["player"]["rating"], 1000);
        assert!(manager.get_player_id(alice.id).await.is_some());

        let reply = alice
            .send(&manager, &arena, json!({"namespace": "queue", "event": "status"}))
            .await;
        assert_eq!(reply["data"]["waiting"], 0);
    }

    #[tokio::test]
    async fn malformed_frames_get_invalid_request() {
        let (manager, arena) = setup().await;
        let mut alice = client(&manager).await;

        route_client_message("not json", alice.id, &manager, &arena)
            .await
            .unwrap();
        let Some(Message::Text(text)) = alice.rx.recv().await else {
            panic!("expected reply");
        };
        let reply: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(reply["error"]["kind"], "invalid_request");

        alice
            .send(
                &manager,
                &arena,
                json!({"namespace": "session", "event": "identify", "data": {"username": "alice"}}),
            )
            .await;
        let reply = alice
            .send(&manager, &arena, json!({"namespace": "lobby", "event": "explode"}))
            .await;
        assert_eq!(reply["request"], "lobby.explode");
        assert_eq!(reply["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn domain_errors_carry_their_kind() {
        let (manager, arena) = setup().await;
        let mut alice = client(&manager).await;
        alice
            .send(
                &manager,
                &arena,
                json!({"namespace": "session", "event": "identify", "data": {"username": "alice"}}),
            )
            .await;

        let join = json!({"namespace": "queue", "event": "join", "data": {}});
        let first = alice.send(&manager, &arena, join.clone()).await;
        assert_eq!(first["data"]["status"], "queued");
        let second = alice.send(&manager, &arena, join).await;
        assert_eq!(second["error"]["kind"], "conflict");

        let reply = alice
            .send(
                &manager,
                &arena,
                json!({"namespace": "lobby", "event": "get", "data": {"lobby_id": arena_core::LobbyId::new()}}),
            )
            .await;
        assert_eq!(reply["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn a_connection_cannot_switch_identity() {
        let (manager, arena) = setup().await;
        let mut alice = client(&manager).await;
        let identify = |player_id: PlayerId| {
            json!({"namespace": "session", "event": "identify",
                   "data": {"player_id": player_id, "username": "alice"}})
        };

        let original = PlayerId::new();
        let reply = alice.send(&manager, &arena, identify(original)).await;
        assert_eq!(reply["data"]["player"]["id"], json!(original));

        let again = alice.send(&manager, &arena, identify(original)).await;
        assert_eq!(again["data"]["outcome"], "already_connected");

        let other = alice.send(&manager, &arena, identify(PlayerId::new())).await;
        assert_eq!(other["error"]["kind"], "conflict");
        assert_eq!(manager.get_player_id(alice.id).await, Some(original));
    }
}
