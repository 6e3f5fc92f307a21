//! Error taxonomy shared by every coordinator.
//!
//! Each coordinator defines its own `thiserror` enum next to the code that
//! raises it. Every variant maps onto one [`ErrorKind`], which is what the
//! command boundary reports to clients. Only [`ErrorKind::Storage`] is fatal
//! for a command. Every other kind leaves in-memory state untouched.

use crate::game::GameError;
use crate::invitation::InvitationError;
use crate::lobby::LobbyError;
use crate::matchmaking::QueueError;
use crate::storage::StorageError;
use crate::types::PlayerId;
use serde::{Deserialize, Serialize};

/// Category of a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Lobby, game, invitation or player absent.
    NotFound,
    /// Operation not legal in the entity's current state.
    InvalidState,
    /// Actor lacks the required role.
    Unauthorized,
    /// Duplicate queue entry, already a member.
    Conflict,
    /// Rejected by the rules engine.
    InvalidMove,
    /// Invitation or turn past its deadline.
    Expired,
    /// The storage collaborator failed. In-memory state was rolled back.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidMove => "invalid_move",
            ErrorKind::Expired => "expired",
            ErrorKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error returned by [`crate::Arena::execute`].
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Lobby(#[from] LobbyError),

    #[error(transparent)]
    Invitation(#[from] InvitationError),

    #[error(transparent)]
    Game(#[from] GameError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("player {0} has not identified")]
    UnknownPlayer(PlayerId),
}

impl ArenaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArenaError::Queue(e) => e.kind(),
            ArenaError::Lobby(e) => e.kind(),
            ArenaError::Invitation(e) => e.kind(),
            ArenaError::Game(e) => e.kind(),
            ArenaError::Storage(_) => ErrorKind::Storage,
            ArenaError::UnknownPlayer(_) => ErrorKind::NotFound,
        }
    }

    /// Whether the failure came from outside the core rather than from the
    /// caller's request.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }
}
