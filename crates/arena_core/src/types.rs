//! # Core Type Definitions
//!
//! Identifier wrappers and the [`Player`] value shared by every coordinator.
//!
//! All identifiers are UUID newtypes so a [`LobbyId`] can never be passed
//! where a [`GameId`] is expected. They serialize as plain UUID strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock instant used for every timestamp in the system.
pub type Timestamp = DateTime<Utc>;

/// Rating assigned to players the storage collaborator has never seen.
pub const DEFAULT_RATING: i32 = 1000;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier using UUID v4.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a player.
    PlayerId
);
define_id!(
    /// Unique identifier for a pre-game lobby.
    LobbyId
);
define_id!(
    /// Unique identifier for a game session.
    GameId
);
define_id!(
    /// Unique identifier for an invitation.
    InvitationId
);

/// A player as seen by the coordinators.
///
/// Identity, display name and rating are owned by the authentication and
/// persistence collaborators. The core captures a snapshot when the player
/// joins the queue or a lobby and never mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
    pub rating: i32,
}

impl Player {
    /// Creates a player with the default rating.
    pub fn new(id: PlayerId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            rating: DEFAULT_RATING,
        }
    }

    /// Returns a copy of this player carrying a different rating.
    pub fn with_rating(mut self, rating: i32) -> Self {
        self.rating = rating;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_strings() {
        let id = GameId::new();
        let parsed: GameId = id.to_string().parse().expect("valid uuid");
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_serialize_as_bare_uuid_strings() {
        let id = LobbyId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }

    #[test]
    fn new_player_gets_default_rating() {
        let player = Player::new(PlayerId::new(), "alice");
        assert_eq!(player.rating, DEFAULT_RATING);
        assert_eq!(player.clone().with_rating(1400).rating, 1400);
    }
}
