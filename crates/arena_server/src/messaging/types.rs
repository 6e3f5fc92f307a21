//! Wire formats exchanged with clients.
//!
//! Inbound frames use a namespace/event envelope:
//!
//! ```json
//! { "namespace": "lobby", "event": "join", "data": { "lobby_id": "..." } }
//! ```
//!
//! Outbound frames are either a reply to one request or a notification:
//!
//! ```json
//! { "type": "reply", "request": "lobby.join", "data": { ... } }
//! { "type": "reply", "request": "lobby.join", "error": { "kind": "not_found", "message": "..." } }
//! { "type": "notification", "scope": { "channel": "lobby", "id": "..." }, "event": "lobby_updated", ... }
//! ```

use arena_core::{ConnectOutcome, Envelope, ErrorKind, Player, PlayerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error kind reported for frames that never reached the arena.
pub const INVALID_REQUEST: &str = "invalid_request";

/// A message sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub namespace: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientMessage {
    /// `namespace.event`, the name replies echo back.
    pub fn request_name(&self) -> String {
        format!("{}.{}", self.namespace, self.event)
    }

    pub fn is_identify(&self) -> bool {
        self.namespace == "session" && self.event == "identify"
    }
}

/// Payload of `session.identify`. Identity is asserted, not verified.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyRequest {
    /// Omitted by first-time clients; a fresh ID is assigned.
    #[serde(default)]
    pub player_id: Option<PlayerId>,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyReply {
    pub player: Player,
    pub outcome: ConnectOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: INVALID_REQUEST.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReplyFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    request: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorBody>,
}

/// Encodes a successful reply.
pub fn reply_frame<T: Serialize>(request: &str, data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ReplyFrame {
        frame_type: "reply",
        request,
        data: Some(data),
        error: None,
    })
}

/// Encodes a failed reply.
pub fn error_frame(request: &str, error: &ErrorBody) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ReplyFrame::<()> {
        frame_type: "reply",
        request,
        data: None,
        error: Some(error),
    })
}

/// Encodes a notification. The notification's own fields sit beside
/// `type` and `scope`.
pub fn notification_frame(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let mut frame = serde_json::to_value(&envelope.notification)?;
    if let Value::Object(fields) = &mut frame {
        fields.insert("type".to_string(), Value::from("notification"));
        fields.insert("scope".to_string(), serde_json::to_value(envelope.scope)?);
        fields.insert(
            "emitted_at".to_string(),
            serde_json::to_value(envelope.emitted_at)?,
        );
    }
    serde_json::to_string(&frame)
}
