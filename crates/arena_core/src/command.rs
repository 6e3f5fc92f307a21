//! The command surface clients drive the arena through, and the replies it
//! sends back.
//!
//! Commands are adjacently tagged: `{"command": "lobby.join", "data": {...}}`.
//! Every variant carries a struct body, so an empty `{}` is always valid data
//! for commands without parameters.

use crate::game::{GameConclusion, GameSession, MoveOutcome};
use crate::invitation::{Invitation, Response};
use crate::lobby::{ChatMessage, LeaveOutcome, Lobby, LobbySettings};
use crate::matchmaking::{EnqueueOutcome, MatchPreferences, QueueStats};
use crate::types::{GameId, InvitationId, LobbyId, PlayerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "data")]
pub enum Command {
    #[serde(rename = "session.heartbeat")]
    Heartbeat {},

    #[serde(rename = "queue.join")]
    QueueJoin {
        /// Rating to match on instead of the stored one. Seating and Elo
        /// still use the stored rating.
        #[serde(default)]
        rating: Option<i32>,
        #[serde(default)]
        preferences: MatchPreferences,
    },

    #[serde(rename = "queue.leave")]
    QueueLeave {},

    #[serde(rename = "queue.status")]
    QueueStatus {},

    #[serde(rename = "lobby.create")]
    LobbyCreate {
        #[serde(flatten)]
        settings: LobbySettings,
    },

    #[serde(rename = "lobby.join")]
    LobbyJoin {
        lobby_id: LobbyId,
        #[serde(default)]
        password: Option<String>,
    },

    #[serde(rename = "lobby.leave")]
    LobbyLeave { lobby_id: LobbyId },

    #[serde(rename = "lobby.set_ready")]
    LobbySetReady { lobby_id: LobbyId, ready: bool },

    #[serde(rename = "lobby.start")]
    LobbyStart { lobby_id: LobbyId },

    #[serde(rename = "lobby.chat")]
    LobbyChat { lobby_id: LobbyId, message: String },

    #[serde(rename = "lobby.list")]
    LobbyList {},

    #[serde(rename = "lobby.get")]
    LobbyGet { lobby_id: LobbyId },

    #[serde(rename = "invite.send")]
    InviteSend {
        recipient_id: PlayerId,
        #[serde(default)]
        lobby_id: Option<LobbyId>,
    },

    #[serde(rename = "invite.respond")]
    InviteRespond {
        invitation_id: InvitationId,
        accept: bool,
    },

    #[serde(rename = "invite.cancel")]
    InviteCancel { invitation_id: InvitationId },

    #[serde(rename = "game.move")]
    GameMove {
        game_id: GameId,
        #[serde(rename = "move")]
        mv: Value,
    },

    #[serde(rename = "game.forfeit")]
    GameForfeit { game_id: GameId },

    #[serde(rename = "game.get")]
    GameGet { game_id: GameId },
}

impl Command {
    /// Builds a command from a `namespace`/`event` pair and its payload.
    pub fn parse(namespace: &str, event: &str, data: Value) -> Result<Self, serde_json::Error> {
        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data
        };
        serde_json::from_value(serde_json::json!({
            "command": format!("{namespace}.{event}"),
            "data": data,
        }))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Heartbeat {} => "session.heartbeat",
            Command::QueueJoin { .. } => "queue.join",
            Command::QueueLeave {} => "queue.leave",
            Command::QueueStatus {} => "queue.status",
            Command::LobbyCreate { .. } => "lobby.create",
            Command::LobbyJoin { .. } => "lobby.join",
            Command::LobbyLeave { .. } => "lobby.leave",
            Command::LobbySetReady { .. } => "lobby.set_ready",
            Command::LobbyStart { .. } => "lobby.start",
            Command::LobbyChat { .. } => "lobby.chat",
            Command::LobbyList {} => "lobby.list",
            Command::LobbyGet { .. } => "lobby.get",
            Command::InviteSend { .. } => "invite.send",
            Command::InviteRespond { .. } => "invite.respond",
            Command::InviteCancel { .. } => "invite.cancel",
            Command::GameMove { .. } => "game.move",
            Command::GameForfeit { .. } => "game.forfeit",
            Command::GameGet { .. } => "game.get",
        }
    }
}

/// Successful result of a command.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ack { ok: bool },
    Queue(EnqueueOutcome),
    Removed { removed: bool },
    QueueStatus(QueueStats),
    Lobby(Lobby),
    Lobbies(Vec<Lobby>),
    Left(LeaveOutcome),
    Started { game_id: GameId },
    Chat(ChatMessage),
    Invitation(Invitation),
    Responded(Response),
    Move(MoveOutcome),
    Concluded(GameConclusion),
    Game(GameSession),
}
