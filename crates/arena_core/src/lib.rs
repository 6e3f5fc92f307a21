//! # Arena Core - Matchmaking, Lobbies and Turn-Based Sessions
//!
//! The in-memory coordinators behind a multiplayer game server. Players are
//! admitted to a rating-based queue or gather in lobbies, are paired or
//! started into games, and play turn by turn under deadlines until the game
//! completes, is forfeited or is abandoned.
//!
//! ## Components
//!
//! * **Rating** ([`rating`]) - Pure Elo expected-score and delta functions
//! * **Matchmaking Queue** ([`MatchmakingQueue`]) - Pairs players inside a rating
//!   window that widens with wait time
//! * **Lobby Coordinator** ([`LobbyCoordinator`]) - Membership, ready flags, host
//!   handover and the lobby state machine
//! * **Invitations** ([`InvitationService`]) - Time-boxed invites into lobbies or
//!   direct games
//! * **Game Session Manager** ([`GameSessionManager`]) - Turn order, deadlines,
//!   forfeits, disconnect grace and rating updates
//! * **Presence Tracker** ([`PresenceTracker`]) - Connections and the
//!   reconnection window
//!
//! [`Arena`] owns one of each and is the single entry point for commands
//! and sweeps. [`Scheduler`] runs the sweeps on intervals.
//!
//! ## Consistency
//!
//! Every coordinator guards its table with one mutex and never holds it
//! across a storage write. Changes are buffered in memory, written through
//! [`Storage`], and rolled back if the write fails. Notifications are emitted
//! on the [`EventBus`] only after the write succeeds.
//!
//! ## Example
//!
//! ```rust
//! use arena_core::{Arena, ArenaConfig, Command, MemoryStorage, PlayerId, SystemClock};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let arena = Arena::new(
//!     ArenaConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(SystemClock),
//! );
//!
//! let alice = PlayerId::new();
//! arena.connect(alice, "alice").await?;
//! let command = Command::parse("queue", "join", serde_json::json!({}))?;
//! arena.execute(alice, command).await?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod game;
pub mod invitation;
pub mod lobby;
pub mod matchmaking;
pub mod presence;
pub mod rating;
pub mod rules;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use arena::{Arena, SweepReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{Command, Reply};
pub use config::ArenaConfig;
pub use error::{ArenaError, ErrorKind};
pub use events::{Envelope, EventBus, Notification, Scope};
pub use game::{GameSession, GameSessionManager, GameStatus};
pub use invitation::{Invitation, InvitationService, InvitationStatus};
pub use lobby::{Lobby, LobbyCoordinator, LobbyState};
pub use matchmaking::{MatchPreferences, MatchmakingQueue};
pub use presence::{ConnectOutcome, PresenceTracker};
pub use rules::{Ruleset, RulesetRegistry};
pub use scheduler::{Scheduler, ShutdownState};
pub use storage::{MemoryStorage, Storage, StorageError};
pub use types::{GameId, InvitationId, LobbyId, Player, PlayerId};

#[cfg(test)]
mod tests;
