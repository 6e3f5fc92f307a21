//! # Notifications
//!
//! Server-emitted notifications and the bus that carries them to the
//! connection layer.
//!
//! Every emission is wrapped in an [`Envelope`] carrying a delivery [`Scope`]
//! (per-user, per-lobby or per-game channel) and the audience that scope
//! resolved to at emission time. Deciding how to reach those players is the
//! connection layer's concern.

use crate::game::{GameEndReason, GameSession, MoveRecord, Turn};
use crate::invitation::Invitation;
use crate::lobby::{ChatMessage, Lobby, LobbyState};
use crate::types::{GameId, InvitationId, LobbyId, PlayerId, Timestamp};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Delivery channel a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "channel", content = "id", rename_all = "snake_case")]
pub enum Scope {
    User(PlayerId),
    Lobby(LobbyId),
    Game(GameId),
}

impl Scope {
    /// Stable string key for the channel, e.g. `lobby:<uuid>`.
    pub fn key(&self) -> String {
        match self {
            Scope::User(id) => format!("user:{id}"),
            Scope::Lobby(id) => format!("lobby:{id}"),
            Scope::Game(id) => format!("game:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    LobbyCreated {
        lobby: Lobby,
    },
    LobbyUpdated {
        lobby: Lobby,
    },
    LobbyDeleted {
        lobby_id: LobbyId,
    },
    PlayerJoinedLobby {
        lobby_id: LobbyId,
        player_id: PlayerId,
        username: String,
    },
    PlayerLeftLobby {
        lobby_id: LobbyId,
        player_id: PlayerId,
        new_host: Option<PlayerId>,
    },
    LobbyStateChanged {
        lobby_id: LobbyId,
        old: LobbyState,
        new: LobbyState,
    },
    PlayerReadyChanged {
        lobby_id: LobbyId,
        player_id: PlayerId,
        ready: bool,
    },
    LobbyChat {
        lobby_id: LobbyId,
        message: ChatMessage,
    },
    GameStarted {
        game: GameSession,
    },
    GameUpdated {
        game_id: GameId,
        state: serde_json::Value,
        current_turn: Turn,
        last_move: Option<MoveRecord>,
    },
    GameOver {
        game_id: GameId,
        winner_id: Option<PlayerId>,
        reason: GameEndReason,
    },
    TurnExpired {
        game_id: GameId,
        player_id: PlayerId,
        next_player_id: PlayerId,
        deadline: Timestamp,
    },
    RatingUpdated {
        game_id: GameId,
        player_id: PlayerId,
        old_rating: i32,
        new_rating: i32,
        delta: i32,
    },
    InvitationReceived {
        invitation: Invitation,
    },
    InvitationAccepted {
        invitation_id: InvitationId,
        recipient_id: PlayerId,
        game_id: Option<GameId>,
        lobby_id: Option<LobbyId>,
    },
    InvitationDeclined {
        invitation_id: InvitationId,
        recipient_id: PlayerId,
    },
    InvitationCancelled {
        invitation_id: InvitationId,
    },
    InvitationExpired {
        invitation_id: InvitationId,
    },
}

impl Notification {
    /// Wire name of the notification, matching its serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Notification::LobbyCreated { .. } => "lobby_created",
            Notification::LobbyUpdated { .. } => "lobby_updated",
            Notification::LobbyDeleted { .. } => "lobby_deleted",
            Notification::PlayerJoinedLobby { .. } => "player_joined_lobby",
            Notification::PlayerLeftLobby { .. } => "player_left_lobby",
            Notification::LobbyStateChanged { .. } => "lobby_state_changed",
            Notification::PlayerReadyChanged { .. } => "player_ready_changed",
            Notification::LobbyChat { .. } => "lobby_chat",
            Notification::GameStarted { .. } => "game_started",
            Notification::GameUpdated { .. } => "game_updated",
            Notification::GameOver { .. } => "game_over",
            Notification::TurnExpired { .. } => "turn_expired",
            Notification::RatingUpdated { .. } => "rating_updated",
            Notification::InvitationReceived { .. } => "invitation_received",
            Notification::InvitationAccepted { .. } => "invitation_accepted",
            Notification::InvitationDeclined { .. } => "invitation_declined",
            Notification::InvitationCancelled { .. } => "invitation_cancelled",
            Notification::InvitationExpired { .. } => "invitation_expired",
        }
    }
}

/// A notification addressed to a scope.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub scope: Scope,
    /// Players the scope resolved to when the notification was emitted.
    pub audience: Vec<PlayerId>,
    pub notification: Notification,
    pub emitted_at: Timestamp,
}

/// Fan-out channel for notifications.
///
/// Cloning yields another handle to the same channel. Emitting with no
/// subscribers is not an error; the notification is simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
    emitted: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn emit(&self, scope: Scope, audience: Vec<PlayerId>, notification: Notification) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        trace!("📣 {} on {}", notification.name(), scope.key());
        let envelope = Envelope {
            scope,
            audience,
            notification,
            emitted_at: Utc::now(),
        };
        if self.sender.send(envelope).is_err() {
            trace!("📭 No subscribers for notification");
        }
    }

    /// Emits to a single player's own channel.
    pub fn emit_to_user(&self, player_id: PlayerId, notification: Notification) {
        self.emit(Scope::User(player_id), vec![player_id], notification);
    }

    /// Total notifications emitted since creation.
    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
