//! Storage collaborator interface.
//!
//! Durable storage is outside the core. The coordinators write through this
//! trait after buffering their in-memory change, and roll the change back if
//! the write fails. [`MemoryStorage`] is the in-process implementation used by
//! the binary and the tests.

use crate::game::GameSession;
use crate::lobby::Lobby;
use crate::types::{GameId, LobbyId, PlayerId, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::trace;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage rejected write: {0}")]
    Rejected(String),
}

/// One row of the rating-history ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingChange {
    pub player_id: PlayerId,
    pub game_id: GameId,
    pub old_rating: i32,
    pub new_rating: i32,
    pub delta: i32,
    pub recorded_at: Timestamp,
}

#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Upserts a lobby row, including its state column.
    async fn save_lobby(&self, lobby: &Lobby) -> Result<(), StorageError>;

    /// Upserts a game row, including its status column.
    async fn save_game(&self, game: &GameSession) -> Result<(), StorageError>;

    /// Writes a finished game together with its rating ledger entries.
    ///
    /// Implementations must apply both or neither.
    async fn record_game_result(
        &self,
        game: &GameSession,
        changes: &[RatingChange],
    ) -> Result<(), StorageError>;

    /// Current persisted rating for a player, if one exists.
    async fn load_rating(&self, player_id: PlayerId) -> Result<Option<i32>, StorageError>;
}

/// Storage held entirely in process memory.
///
/// Writes can be made to fail on demand so callers can exercise their
/// rollback paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    lobbies: DashMap<LobbyId, Lobby>,
    games: DashMap<GameId, GameSession>,
    ratings: DashMap<PlayerId, i32>,
    ledger: RwLock<Vec<RatingChange>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_rating(&self, player_id: PlayerId, rating: i32) {
        self.ratings.insert(player_id, rating);
    }

    pub fn lobby(&self, lobby_id: LobbyId) -> Option<Lobby> {
        self.lobbies.get(&lobby_id).map(|l| l.clone())
    }

    pub fn game(&self, game_id: GameId) -> Option<GameSession> {
        self.games.get(&game_id).map(|g| g.clone())
    }

    pub fn rating(&self, player_id: PlayerId) -> Option<i32> {
        self.ratings.get(&player_id).map(|r| *r)
    }

    pub async fn ledger(&self) -> Vec<RatingChange> {
        self.ledger.read().await.clone()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("memory storage set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_lobby(&self, lobby: &Lobby) -> Result<(), StorageError> {
        self.check_available()?;
        trace!("💾 lobby {} -> {}", lobby.id, lobby.state);
        self.lobbies.insert(lobby.id, lobby.clone());
        Ok(())
    }

    async fn save_game(&self, game: &GameSession) -> Result<(), StorageError> {
        self.check_available()?;
        trace!("💾 game {} -> {}", game.id, game.status);
        self.games.insert(game.id, game.clone());
        Ok(())
    }

    async fn record_game_result(
        &self,
        game: &GameSession,
        changes: &[RatingChange],
    ) -> Result<(), StorageError> {
        self.check_available()?;
        let mut ledger = self.ledger.write().await;
        self.games.insert(game.id, game.clone());
        for change in changes {
            self.ratings.insert(change.player_id, change.new_rating);
            ledger.push(change.clone());
        }
        Ok(())
    }

    async fn load_rating(&self, player_id: PlayerId) -> Result<Option<i32>, StorageError> {
        self.check_available()?;
        Ok(self.rating(player_id))
    }
}
