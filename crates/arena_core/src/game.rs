//! # Game Session Manager
//!
//! Owns every active game and runs its turn state machine:
//!
//! ```text
//! active ──► completed | forfeited | abandoned
//! ```
//!
//! Move legality and win conditions come from a [`Ruleset`]. The manager
//! enforces turn order, resets the turn deadline after every move, forces
//! the turn forward when a deadline passes, and computes rating changes when
//! a two-player game concludes.
//!
//! Ongoing games live only in memory. A game is written to storage when it is
//! created and again when it reaches a terminal status, together with its
//! rating ledger entries. Terminal games move to a bounded archive so that
//! `get` keeps answering for recently finished games.

use crate::clock::{secs, Clock};
use crate::error::ErrorKind;
use crate::events::{EventBus, Notification, Scope};
use crate::rating::{pair_deltas, GameResult};
use crate::rules::{Outcome, Ruleset, RulesError, RulesetRegistry};
use crate::storage::{RatingChange, Storage, StorageError};
use crate::types::{GameId, LobbyId, Player, PlayerId, Timestamp};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Active,
    Completed,
    Forfeited,
    Abandoned,
}

impl GameStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GameStatus::Active)
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameStatus::Active => "active",
            GameStatus::Completed => "completed",
            GameStatus::Forfeited => "forfeited",
            GameStatus::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Why a game stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEndReason {
    Win,
    Draw,
    Forfeit,
    Abandoned,
}

/// A seated player. `rating` is the pre-game rating used for Elo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub player_id: PlayerId,
    pub username: String,
    pub rating: i32,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub player_id: PlayerId,
    pub started_at: Timestamp,
    pub deadline: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub player_id: PlayerId,
    #[serde(rename = "move")]
    pub mv: Value,
    pub made_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSession {
    pub id: GameId,
    pub ruleset: String,
    /// Lobby the game was started from, if any.
    pub lobby_id: Option<LobbyId>,
    pub players: Vec<Participant>,
    pub state: Value,
    pub history: Vec<MoveRecord>,
    pub current_turn: Turn,
    pub status: GameStatus,
    pub winner_id: Option<PlayerId>,
    pub end_reason: Option<GameEndReason>,
    pub created_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    #[serde(skip)]
    pub(crate) version: u64,
}

impl GameSession {
    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players.iter().map(|p| p.player_id).collect()
    }

    pub fn participant(&self, player_id: PlayerId) -> Option<&Participant> {
        self.players.iter().find(|p| p.player_id == player_id)
    }

    fn participant_mut(&mut self, player_id: PlayerId) -> Option<&mut Participant> {
        self.players.iter_mut().find(|p| p.player_id == player_id)
    }

    /// Seat after the current turn holder, wrapping around.
    fn next_player(&self) -> PlayerId {
        let index = self
            .players
            .iter()
            .position(|p| p.player_id == self.current_turn.player_id)
            .unwrap_or(0);
        self.players[(index + 1) % self.players.len()].player_id
    }

    fn pass_turn(&mut self, now: Timestamp, max_turn: chrono::Duration) {
        self.current_turn = Turn {
            player_id: self.next_player(),
            started_at: now,
            deadline: now + max_turn,
        };
    }

    fn conclude(
        &mut self,
        status: GameStatus,
        winner_id: Option<PlayerId>,
        reason: GameEndReason,
        now: Timestamp,
    ) {
        self.status = status;
        self.winner_id = winner_id;
        self.end_reason = Some(reason);
        self.ended_at = Some(now);
        self.version += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub max_turn_secs: u64,
    pub disconnect_grace_secs: u64,
    pub k_factor: f64,
    pub forfeit_k_factor: f64,
    pub deadline_sweep_interval_secs: u64,
    /// Finished games kept in memory for lookups.
    pub archive_limit: usize,
    pub default_ruleset: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            max_turn_secs: 300,
            disconnect_grace_secs: 60,
            k_factor: crate::rating::DEFAULT_K_FACTOR,
            forfeit_k_factor: crate::rating::FORFEIT_K_FACTOR,
            deadline_sweep_interval_secs: 5,
            archive_limit: 1000,
            default_ruleset: "tic_tac_toe".to_string(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GameError {
    #[error("game {0} not found")]
    NotFound(GameId),

    #[error("game {0} is no longer active")]
    NotActive(GameId),

    #[error("it is not player {player_id}'s turn in game {game_id}")]
    NotYourTurn { game_id: GameId, player_id: PlayerId },

    #[error("player {player_id} is not playing in game {game_id}")]
    NotAParticipant { game_id: GameId, player_id: PlayerId },

    #[error("unknown ruleset '{0}'")]
    UnknownRuleset(String),

    #[error(transparent)]
    Rules(#[from] RulesError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl GameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GameError::NotFound(_) | GameError::UnknownRuleset(_) => ErrorKind::NotFound,
            GameError::NotActive(_) | GameError::NotYourTurn { .. } => ErrorKind::InvalidState,
            GameError::NotAParticipant { .. } => ErrorKind::Unauthorized,
            GameError::Rules(e) => e.kind(),
            GameError::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// How a game ended, handed back to callers so they can update lobbies.
#[derive(Debug, Clone, Serialize)]
pub struct GameConclusion {
    pub game_id: GameId,
    pub lobby_id: Option<LobbyId>,
    pub status: GameStatus,
    pub winner_id: Option<PlayerId>,
    pub reason: GameEndReason,
    pub rating_changes: Vec<RatingChange>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MoveOutcome {
    Continued { state: Value, current_turn: Turn },
    GameOver(GameConclusion),
}

/// A turn the deadline sweep forced forward.
#[derive(Debug, Clone)]
pub struct ExpiredTurn {
    pub game_id: GameId,
    pub player_id: PlayerId,
    pub next_player_id: PlayerId,
    pub deadline: Timestamp,
}

#[derive(Debug, Default)]
struct GameTable {
    active: HashMap<GameId, GameSession>,
    archive: HashMap<GameId, GameSession>,
    archive_order: VecDeque<GameId>,
}

impl GameTable {
    fn lookup(&mut self, game_id: GameId) -> Result<&mut GameSession, GameError> {
        if self.archive.contains_key(&game_id) {
            return Err(GameError::NotActive(game_id));
        }
        match self.active.get_mut(&game_id) {
            Some(game) if game.status.is_terminal() => Err(GameError::NotActive(game_id)),
            Some(game) => Ok(game),
            None => Err(GameError::NotFound(game_id)),
        }
    }

    fn archive(&mut self, game: GameSession, limit: usize) {
        self.active.remove(&game.id);
        self.archive_order.push_back(game.id);
        self.archive.insert(game.id, game);
        while self.archive_order.len() > limit {
            if let Some(oldest) = self.archive_order.pop_front() {
                self.archive.remove(&oldest);
            }
        }
    }

    /// Puts back a snapshot unless someone changed the game since. Players
    /// who reconnected while the game was waiting on its write stay connected.
    fn restore(&mut self, mut snapshot: GameSession, expected_version: u64) -> bool {
        match self.active.get_mut(&snapshot.id) {
            Some(current) if current.version == expected_version => {
                for seat in snapshot.players.iter_mut() {
                    if current.participant(seat.player_id).is_some_and(|p| p.connected) {
                        seat.connected = true;
                    }
                }
                *current = snapshot;
                true
            }
            _ => false,
        }
    }
}

/// Game state buffered in memory before its terminal write.
struct PendingConclusion {
    prior: GameSession,
    concluded: GameSession,
    changes: Vec<RatingChange>,
}

pub struct GameSessionManager {
    games: Mutex<GameTable>,
    rulesets: Arc<RulesetRegistry>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: GameConfig,
}

impl fmt::Debug for GameSessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameSessionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GameSessionManager {
    pub fn new(
        config: GameConfig,
        rulesets: Arc<RulesetRegistry>,
        storage: Arc<dyn Storage>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            games: Mutex::new(GameTable::default()),
            rulesets,
            storage,
            events,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn has_ruleset(&self, name: &str) -> bool {
        self.rulesets.contains(name)
    }

    fn resolve_ruleset(&self, name: Option<&str>) -> Result<Arc<dyn Ruleset>, GameError> {
        let name = name.unwrap_or(&self.config.default_ruleset);
        self.rulesets
            .resolve(Some(name))
            .ok_or_else(|| GameError::UnknownRuleset(name.to_string()))
    }

    /// Starts a game for `players` in seating order.
    ///
    /// The first turn goes to a uniformly random player. The game is written
    /// to storage before anyone is told about it; a failed write leaves no
    /// trace of the game.
    pub async fn create(
        &self,
        players: Vec<Player>,
        ruleset: Option<&str>,
        lobby_id: Option<LobbyId>,
    ) -> Result<GameSession, GameError> {
        let rules = self.resolve_ruleset(ruleset)?;
        let ids: Vec<PlayerId> = players.iter().map(|p| p.id).collect();
        let Some(&first) = ids.get(pick_first(ids.len())) else {
            return Err(RulesError::UnsupportedPlayerCount {
                ruleset: rules.name().to_string(),
                count: 0,
            }
            .into());
        };
        let state = rules.initial_state(&ids)?;

        let now = self.clock.now();
        let game = GameSession {
            id: GameId::new(),
            ruleset: rules.name().to_string(),
            lobby_id,
            players: players
                .into_iter()
                .map(|p| Participant {
                    player_id: p.id,
                    username: p.username,
                    rating: p.rating,
                    connected: true,
                })
                .collect(),
            state,
            history: Vec::new(),
            current_turn: Turn {
                player_id: first,
                started_at: now,
                deadline: now + secs(self.config.max_turn_secs),
            },
            status: GameStatus::Active,
            winner_id: None,
            end_reason: None,
            created_at: now,
            ended_at: None,
            version: 0,
        };

        self.games.lock().await.active.insert(game.id, game.clone());

        if let Err(e) = self.storage.save_game(&game).await {
            error!("❌ Failed to persist new game {}: {}", game.id, e);
            self.games.lock().await.active.remove(&game.id);
            return Err(e.into());
        }

        info!(
            "🎮 Game {} started ({}, {} players, {} moves first)",
            game.id,
            game.ruleset,
            game.players.len(),
            first
        );
        self.events.emit(
            Scope::Game(game.id),
            game.player_ids(),
            Notification::GameStarted { game: game.clone() },
        );
        Ok(game)
    }

    /// Applies a move for the player holding the turn.
    pub async fn apply_move(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        mv: Value,
    ) -> Result<MoveOutcome, GameError> {
        let mut table = self.games.lock().await;
        let game = table.lookup(game_id)?;
        if game.participant(player_id).is_none() {
            return Err(GameError::NotAParticipant { game_id, player_id });
        }
        if game.current_turn.player_id != player_id {
            return Err(GameError::NotYourTurn { game_id, player_id });
        }

        let rules = self.resolve_ruleset(Some(&game.ruleset))?;
        rules.validate(&game.state, player_id, &mv)?;
        let new_state = rules.apply(&game.state, player_id, &mv)?;
        let outcome = rules.evaluate(&new_state);

        let now = self.clock.now();
        let prior = game.clone();
        let record = MoveRecord {
            player_id,
            mv,
            made_at: now,
        };
        game.state = new_state;
        game.history.push(record.clone());

        let (status, winner_id, reason) = match outcome {
            Outcome::Ongoing => {
                game.pass_turn(now, secs(self.config.max_turn_secs));
                game.version += 1;
                debug!("♟️ Move in game {} by {}", game_id, player_id);
                let update = Notification::GameUpdated {
                    game_id,
                    state: game.state.clone(),
                    current_turn: game.current_turn,
                    last_move: Some(record),
                };
                let outcome = MoveOutcome::Continued {
                    state: game.state.clone(),
                    current_turn: game.current_turn,
                };
                let audience = game.player_ids();
                drop(table);
                self.events.emit(Scope::Game(game_id), audience, update);
                return Ok(outcome);
            }
            Outcome::Winner(winner) => (GameStatus::Completed, Some(winner), GameEndReason::Win),
            Outcome::Draw => (GameStatus::Completed, None, GameEndReason::Draw),
        };

        game.conclude(status, winner_id, reason, now);
        let changes = rating_changes(game, self.config.k_factor, now);
        let pending = PendingConclusion {
            prior,
            concluded: game.clone(),
            changes,
        };
        drop(table);

        let conclusion = self.commit_conclusion(pending, Some(record)).await?;
        Ok(MoveOutcome::GameOver(conclusion))
    }

    /// Concedes the game. In a two-player game the opponent wins.
    pub async fn forfeit(
        &self,
        game_id: GameId,
        player_id: PlayerId,
    ) -> Result<GameConclusion, GameError> {
        let mut table = self.games.lock().await;
        let game = table.lookup(game_id)?;
        if game.participant(player_id).is_none() {
            return Err(GameError::NotAParticipant { game_id, player_id });
        }

        let now = self.clock.now();
        let prior = game.clone();
        let winner_id = match game.players.as_slice() {
            [a, b] if a.player_id == player_id => Some(b.player_id),
            [a, _] => Some(a.player_id),
            _ => None,
        };
        game.conclude(GameStatus::Forfeited, winner_id, GameEndReason::Forfeit, now);
        let changes = rating_changes(game, self.config.forfeit_k_factor, now);
        let pending = PendingConclusion {
            prior,
            concluded: game.clone(),
            changes,
        };
        drop(table);

        info!("🏳️ Player {} forfeited game {}", player_id, game_id);
        self.commit_conclusion(pending, None).await
    }

    /// Forces the turn forward in every game whose deadline has passed.
    pub async fn sweep_deadlines(&self) -> Vec<ExpiredTurn> {
        let now = self.clock.now();
        let max_turn = secs(self.config.max_turn_secs);
        let mut expired = Vec::new();
        let mut audiences = Vec::new();
        {
            let mut table = self.games.lock().await;
            for game in table.active.values_mut() {
                if game.status.is_terminal() || game.current_turn.deadline > now {
                    continue;
                }
                let stalled = game.current_turn.player_id;
                game.pass_turn(now, max_turn);
                game.version += 1;
                expired.push(ExpiredTurn {
                    game_id: game.id,
                    player_id: stalled,
                    next_player_id: game.current_turn.player_id,
                    deadline: game.current_turn.deadline,
                });
                audiences.push(game.player_ids());
            }
        }

        for (turn, audience) in expired.iter().zip(audiences) {
            debug!("⏰ Turn of {} expired in game {}", turn.player_id, turn.game_id);
            self.events.emit(
                Scope::Game(turn.game_id),
                audience,
                Notification::TurnExpired {
                    game_id: turn.game_id,
                    player_id: turn.player_id,
                    next_player_id: turn.next_player_id,
                    deadline: turn.deadline,
                },
            );
        }
        expired
    }

    /// Marks the player disconnected in all their games.
    ///
    /// A turn held by the disconnected player has its deadline pulled in to
    /// the grace period, never pushed out. Games with nobody left connected
    /// are abandoned.
    pub async fn on_disconnect(&self, player_id: PlayerId) -> Vec<GameConclusion> {
        self.mark_absent(player_id, true).await
    }

    /// Evicted players count towards abandonment but keep their seats.
    pub async fn on_departure(&self, player_id: PlayerId) -> Vec<GameConclusion> {
        self.mark_absent(player_id, false).await
    }

    async fn mark_absent(&self, player_id: PlayerId, shrink_deadline: bool) -> Vec<GameConclusion> {
        let now = self.clock.now();
        let grace_deadline = now + secs(self.config.disconnect_grace_secs);
        let mut pending = Vec::new();
        {
            let mut table = self.games.lock().await;
            for game in table.active.values_mut() {
                if game.status.is_terminal() || game.participant(player_id).is_none() {
                    continue;
                }
                let prior = game.clone();
                let Some(participant) = game.participant_mut(player_id) else {
                    continue;
                };
                participant.connected = false;
                game.version += 1;

                if game.players.iter().all(|p| !p.connected) {
                    game.conclude(GameStatus::Abandoned, None, GameEndReason::Abandoned, now);
                    pending.push(PendingConclusion {
                        prior,
                        concluded: game.clone(),
                        changes: Vec::new(),
                    });
                } else if shrink_deadline && game.current_turn.player_id == player_id {
                    game.current_turn.deadline = game.current_turn.deadline.min(grace_deadline);
                }
            }
        }

        let mut concluded = Vec::new();
        for game in pending {
            let game_id = game.concluded.id;
            match self.commit_conclusion(game, None).await {
                Ok(conclusion) => concluded.push(conclusion),
                Err(e) => warn!("⚠️ Game {} stays active after failed abandon: {}", game_id, e),
            }
        }
        concluded
    }

    /// A game already concluded but still waiting on its write keeps its
    /// version, so a failed write can still roll it back.
    pub async fn on_reconnect(&self, player_id: PlayerId) {
        let mut table = self.games.lock().await;
        for game in table.active.values_mut() {
            let pending_write = game.status.is_terminal();
            if let Some(participant) = game.participant_mut(player_id) {
                if !participant.connected {
                    participant.connected = true;
                    if !pending_write {
                        game.version += 1;
                    }
                    debug!("🔄 Player {} back in game {}", player_id, game.id);
                }
            }
        }
    }

    /// Ends a game that was started but could not be handed over, for example
    /// when the lobby that requested it failed to record the start.
    pub async fn abort(&self, game_id: GameId) -> Result<GameConclusion, GameError> {
        let mut table = self.games.lock().await;
        let game = table.lookup(game_id)?;
        let prior = game.clone();
        game.conclude(
            GameStatus::Abandoned,
            None,
            GameEndReason::Abandoned,
            self.clock.now(),
        );
        let pending = PendingConclusion {
            prior,
            concluded: game.clone(),
            changes: Vec::new(),
        };
        drop(table);
        self.commit_conclusion(pending, None).await
    }

    /// Last resort when a game can be neither handed over nor recorded as
    /// abandoned. The game is ended in memory only and its players are told.
    pub async fn abandon_unrecorded(&self, game_id: GameId) -> Option<GameSession> {
        let mut table = self.games.lock().await;
        let game = table.active.get_mut(&game_id)?;
        if game.status.is_terminal() {
            // Another conclusion is mid-write and will archive it.
            return None;
        }
        game.conclude(
            GameStatus::Abandoned,
            None,
            GameEndReason::Abandoned,
            self.clock.now(),
        );
        let game = game.clone();
        table.archive(game.clone(), self.config.archive_limit);
        drop(table);

        warn!("⚠️ Game {} abandoned without a storage record", game_id);
        self.events.emit(
            Scope::Game(game_id),
            game.player_ids(),
            Notification::GameOver {
                game_id,
                winner_id: game.winner_id,
                reason: game.end_reason.unwrap_or(GameEndReason::Abandoned),
            },
        );
        Some(game)
    }

    /// Snapshot of an active or recently finished game.
    pub async fn get(&self, game_id: GameId) -> Result<GameSession, GameError> {
        let table = self.games.lock().await;
        table
            .active
            .get(&game_id)
            .or_else(|| table.archive.get(&game_id))
            .cloned()
            .ok_or(GameError::NotFound(game_id))
    }

    /// Active games the player is seated in.
    pub async fn active_games_for(&self, player_id: PlayerId) -> Vec<GameId> {
        let table = self.games.lock().await;
        table
            .active
            .values()
            .filter(|g| g.participant(player_id).is_some())
            .map(|g| g.id)
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.games.lock().await.active.len()
    }

    /// Writes a terminal game and its ratings, then archives it and tells
    /// the players. On a failed write the prior snapshot goes back in place.
    async fn commit_conclusion(
        &self,
        pending: PendingConclusion,
        last_move: Option<MoveRecord>,
    ) -> Result<GameConclusion, GameError> {
        let PendingConclusion {
            prior,
            concluded,
            changes,
        } = pending;
        let game_id = concluded.id;

        let write = if changes.is_empty() {
            self.storage.save_game(&concluded).await
        } else {
            self.storage.record_game_result(&concluded, &changes).await
        };

        if let Err(e) = write {
            error!("❌ Failed to record end of game {}: {}", game_id, e);
            let mut table = self.games.lock().await;
            if !table.restore(prior, concluded.version) {
                warn!("⚠️ Game {} changed during failed write, keeping newer state", game_id);
            }
            return Err(e.into());
        }

        let reason = concluded.end_reason.unwrap_or(GameEndReason::Abandoned);
        let conclusion = GameConclusion {
            game_id,
            lobby_id: concluded.lobby_id,
            status: concluded.status,
            winner_id: concluded.winner_id,
            reason,
            rating_changes: changes,
        };
        let audience = concluded.player_ids();

        if let Some(record) = last_move {
            self.events.emit(
                Scope::Game(game_id),
                audience.clone(),
                Notification::GameUpdated {
                    game_id,
                    state: concluded.state.clone(),
                    current_turn: concluded.current_turn,
                    last_move: Some(record),
                },
            );
        }

        self.games
            .lock()
            .await
            .archive(concluded, self.config.archive_limit);

        info!(
            "🏁 Game {} ended: {} (winner: {:?})",
            game_id, conclusion.status, conclusion.winner_id
        );
        self.events.emit(
            Scope::Game(game_id),
            audience,
            Notification::GameOver {
                game_id,
                winner_id: conclusion.winner_id,
                reason,
            },
        );
        for change in &conclusion.rating_changes {
            self.events.emit_to_user(
                change.player_id,
                Notification::RatingUpdated {
                    game_id,
                    player_id: change.player_id,
                    old_rating: change.old_rating,
                    new_rating: change.new_rating,
                    delta: change.delta,
                },
            );
        }
        Ok(conclusion)
    }
}

fn pick_first(count: usize) -> usize {
    rand::thread_rng().gen_range(0..count.max(1))
}

/// Ledger rows for a concluded two-player game, computed from pre-game
/// ratings. Abandoned and multi-player games are unrated.
fn rating_changes(game: &GameSession, k_factor: f64, now: Timestamp) -> Vec<RatingChange> {
    let [first, second] = game.players.as_slice() else {
        return Vec::new();
    };
    let first_result = match (game.status, game.winner_id) {
        (GameStatus::Abandoned, _) => return Vec::new(),
        (_, None) => GameResult::Draw,
        (_, Some(winner)) if winner == first.player_id => GameResult::Win,
        (_, Some(_)) => GameResult::Loss,
    };
    let (first_delta, second_delta) =
        pair_deltas(first.rating, second.rating, first_result, k_factor);

    [(first, first_delta), (second, second_delta)]
        .into_iter()
        .map(|(p, delta)| RatingChange {
            player_id: p.player_id,
            game_id: game.id,
            old_rating: p.rating,
            new_rating: p.rating.saturating_add(delta),
            delta,
            recorded_at: now,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::scripted::{ScriptedStorage, Write};
    use crate::storage::MemoryStorage;
    use serde_json::json;

    struct Fixture {
        manager: GameSessionManager,
        storage: Arc<MemoryStorage>,
        clock: ManualClock,
        events: EventBus,
    }

    fn fixture(config: GameConfig) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let clock = ManualClock::starting_now();
        let events = EventBus::new(64);
        let manager = GameSessionManager::new(
            config,
            Arc::new(RulesetRegistry::with_builtin()),
            storage.clone(),
            events.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            manager,
            storage,
            clock,
            events,
        }
    }

    fn players(ratings: &[i32]) -> Vec<Player> {
        ratings
            .iter()
            .enumerate()
            .map(|(i, r)| Player::new(PlayerId::new(), format!("p{i}")).with_rating(*r))
            .collect()
    }

    fn other(game: &GameSession, player: PlayerId) -> PlayerId {
        game.players
            .iter()
            .map(|p| p.player_id)
            .find(|id| *id != player)
            .unwrap()
    }

    #[tokio::test]
    async fn create_persists_and_seats_first_player_at_random() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();

        assert_eq!(game.status, GameStatus::Active);
        assert!(game.player_ids().contains(&game.current_turn.player_id));
        assert_eq!(game.current_turn.deadline, f.clock.now() + secs(300));
        assert!(f.storage.game(game.id).is_some());
    }

    #[tokio::test]
    async fn failed_create_leaves_no_game_behind() {
        let f = fixture(GameConfig::default());
        f.storage.set_failing(true);
        let err = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(f.manager.active_count().await, 0);
        assert_eq!(f.events.emitted_count(), 0);
    }

    #[tokio::test]
    async fn moves_rotate_turns_and_reset_deadline() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        let first = game.current_turn.player_id;
        let second = other(&game, first);

        let err = f
            .manager
            .apply_move(game.id, second, json!({ "cell": 0 }))
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::NotYourTurn { .. }));

        f.clock.advance_secs(42);
        let outcome = f
            .manager
            .apply_move(game.id, first, json!({ "cell": 4 }))
            .await
            .unwrap();
        match outcome {
            MoveOutcome::Continued { current_turn, .. } => {
                assert_eq!(current_turn.player_id, second);
                assert_eq!(current_turn.deadline, f.clock.now() + secs(300));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_moves_leave_the_game_untouched() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        let first = game.current_turn.player_id;

        let err = f
            .manager
            .apply_move(game.id, first, json!({ "cell": 11 }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMove);

        let after = f.manager.get(game.id).await.unwrap();
        assert!(after.history.is_empty());
        assert_eq!(after.current_turn, game.current_turn);
    }

    #[tokio::test]
    async fn winning_move_completes_and_rates_the_game() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1200, 1400]), None, None).await.unwrap();
        let x = game.current_turn.player_id;
        let o = other(&game, x);

        for (player, cell) in [(x, 0), (o, 3), (x, 1), (o, 4)] {
            f.manager
                .apply_move(game.id, player, json!({ "cell": cell }))
                .await
                .unwrap();
        }
        let outcome = f
            .manager
            .apply_move(game.id, x, json!({ "cell": 2 }))
            .await
            .unwrap();

        let MoveOutcome::GameOver(conclusion) = outcome else {
            panic!("game should be over");
        };
        assert_eq!(conclusion.winner_id, Some(x));
        assert_eq!(conclusion.status, GameStatus::Completed);
        let deltas: Vec<i32> = conclusion.rating_changes.iter().map(|c| c.delta).collect();
        assert_eq!(deltas[0], -deltas[1]);
        assert_eq!(f.storage.ledger().await.len(), 2);

        let err = f
            .manager
            .apply_move(game.id, o, json!({ "cell": 8 }))
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::NotActive(_)));
        assert_eq!(
            f.manager.get(game.id).await.unwrap().status,
            GameStatus::Completed
        );
    }

    #[tokio::test]
    async fn forfeit_uses_reduced_k_factor() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        let quitter = game.players[0].player_id;
        let stayer = game.players[1].player_id;

        let conclusion = f.manager.forfeit(game.id, quitter).await.unwrap();
        assert_eq!(conclusion.winner_id, Some(stayer));
        assert_eq!(conclusion.status, GameStatus::Forfeited);
        assert_eq!(f.storage.rating(stayer), Some(1008));
        assert_eq!(f.storage.rating(quitter), Some(992));

        let err = f.manager.forfeit(game.id, stayer).await.unwrap_err();
        assert!(matches!(err, GameError::NotActive(_)));
    }

    #[tokio::test]
    async fn outsiders_cannot_forfeit() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        let err = f.manager.forfeit(game.id, PlayerId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(matches!(
            f.manager.forfeit(GameId::new(), PlayerId::new()).await,
            Err(GameError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_result_write_rolls_back_to_active() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        f.storage.set_failing(true);

        let err = f
            .manager
            .forfeit(game.id, game.players[0].player_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        let after = f.manager.get(game.id).await.unwrap();
        assert_eq!(after.status, GameStatus::Active);
        assert_eq!(after.winner_id, None);
    }

    #[tokio::test]
    async fn deadline_sweep_passes_the_turn() {
        let config = GameConfig {
            max_turn_secs: 1,
            ..GameConfig::default()
        };
        let f = fixture(config);
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        let stalled = game.current_turn.player_id;

        assert!(f.manager.sweep_deadlines().await.is_empty());
        f.clock.advance_secs(2);
        let expired = f.manager.sweep_deadlines().await;

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].player_id, stalled);
        assert_eq!(expired[0].next_player_id, other(&game, stalled));
        let after = f.manager.get(game.id).await.unwrap();
        assert_eq!(after.current_turn.deadline, f.clock.now() + secs(1));
        assert!(after.history.is_empty());
    }

    #[tokio::test]
    async fn disconnect_only_shrinks_the_deadline() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        let holder = game.current_turn.player_id;

        f.manager.on_disconnect(holder).await;
        let shrunk = f.manager.get(game.id).await.unwrap().current_turn.deadline;
        assert_eq!(shrunk, f.clock.now() + secs(60));

        f.manager.on_reconnect(holder).await;
        f.manager.on_disconnect(holder).await;
        let again = f.manager.get(game.id).await.unwrap().current_turn.deadline;
        assert!(again <= shrunk);
        assert!(again <= game.current_turn.deadline);
    }

    #[tokio::test]
    async fn everyone_leaving_abandons_the_game() {
        let f = fixture(GameConfig::default());
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();

        assert!(f.manager.on_disconnect(game.players[0].player_id).await.is_empty());
        let ended = f.manager.on_disconnect(game.players[1].player_id).await;
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].status, GameStatus::Abandoned);
        assert!(ended[0].rating_changes.is_empty());
        assert!(f.storage.ledger().await.is_empty());
    }

    #[tokio::test]
    async fn archive_is_bounded() {
        let config = GameConfig {
            archive_limit: 1,
            ..GameConfig::default()
        };
        let f = fixture(config);
        let first = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        let second = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        f.manager.forfeit(first.id, first.players[0].player_id).await.unwrap();
        f.manager.forfeit(second.id, second.players[0].player_id).await.unwrap();

        assert!(matches!(f.manager.get(first.id).await, Err(GameError::NotFound(_))));
        assert!(f.manager.get(second.id).await.is_ok());
    }

    #[tokio::test]
    async fn multi_player_countdown_is_unrated() {
        let f = fixture(GameConfig::default());
        let game = f
            .manager
            .create(players(&[1000, 1100, 1200]), Some("countdown"), None)
            .await
            .unwrap();
        let conclusion = f.manager.forfeit(game.id, game.players[0].player_id).await.unwrap();
        assert_eq!(conclusion.winner_id, None);
        assert!(conclusion.rating_changes.is_empty());
    }

    #[tokio::test]
    async fn unknown_ruleset_is_rejected() {
        let f = fixture(GameConfig::default());
        let err = f
            .manager
            .create(players(&[1000, 1000]), Some("chess"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::UnknownRuleset(_)));
    }

    /// Accepts any number of players, including none.
    #[derive(Debug)]
    struct Solitaire;

    impl Ruleset for Solitaire {
        fn name(&self) -> &'static str {
            "solitaire"
        }

        fn player_range(&self) -> std::ops::RangeInclusive<usize> {
            0..=4
        }

        fn initial_state(&self, _players: &[PlayerId]) -> Result<Value, RulesError> {
            Ok(json!({}))
        }

        fn validate(&self, _state: &Value, _player: PlayerId, _mv: &Value) -> Result<(), RulesError> {
            Ok(())
        }

        fn apply(&self, state: &Value, _player: PlayerId, _mv: &Value) -> Result<Value, RulesError> {
            Ok(state.clone())
        }

        fn evaluate(&self, _state: &Value) -> Outcome {
            Outcome::Ongoing
        }
    }

    #[tokio::test]
    async fn games_need_someone_to_seat() {
        let mut rulesets = RulesetRegistry::with_builtin();
        rulesets.register(Arc::new(Solitaire));
        let manager = GameSessionManager::new(
            GameConfig::default(),
            Arc::new(rulesets),
            Arc::new(MemoryStorage::new()),
            EventBus::default(),
            Arc::new(ManualClock::starting_now()),
        );

        let err = manager.create(Vec::new(), Some("solitaire"), None).await.unwrap_err();
        assert!(matches!(
            err,
            GameError::Rules(RulesError::UnsupportedPlayerCount { count: 0, .. })
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(manager.active_count().await, 0);

        let single = manager.create(players(&[1000]), Some("solitaire"), None).await.unwrap();
        assert_eq!(single.current_turn.player_id, single.players[0].player_id);
    }

    #[tokio::test]
    async fn ledger_saturates_at_the_rating_limits() {
        let f = fixture(GameConfig::default());
        let game = f
            .manager
            .create(players(&[i32::MAX, i32::MAX]), None, None)
            .await
            .unwrap();
        let winner = game.players[0].player_id;
        let loser = game.players[1].player_id;

        let conclusion = f.manager.forfeit(game.id, loser).await.unwrap();
        let won = conclusion.rating_changes.iter().find(|c| c.player_id == winner).unwrap();
        assert_eq!(won.delta, 8);
        assert_eq!(won.new_rating, i32::MAX);
        let lost = conclusion.rating_changes.iter().find(|c| c.player_id == loser).unwrap();
        assert_eq!(lost.new_rating, i32::MAX - 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnect_during_failed_result_write_still_rolls_back() {
        let storage = Arc::new(ScriptedStorage::new());
        let manager = Arc::new(GameSessionManager::new(
            GameConfig::default(),
            Arc::new(RulesetRegistry::with_builtin()),
            storage.clone(),
            EventBus::default(),
            Arc::new(ManualClock::starting_now()),
        ));
        let game = manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        let away = game.players[0].player_id;
        let stayer = game.players[1].player_id;
        manager.on_disconnect(away).await;

        let game_id = game.id;
        let gate = storage.gate(Write::Result, true);
        let forfeiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.forfeit(game_id, stayer).await })
        };
        gate.reached().await;
        manager.on_reconnect(away).await;
        gate.open();

        let err = forfeiting.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        let after = manager.get(game.id).await.unwrap();
        assert_eq!(after.status, GameStatus::Active);
        assert!(after.participant(away).unwrap().connected);

        let retried = manager.forfeit(game.id, stayer).await.unwrap();
        assert_eq!(retried.status, GameStatus::Forfeited);
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(storage.memory().ledger().await.len(), 2);
    }

    #[tokio::test]
    async fn unrecorded_abandon_ends_the_game_in_memory() {
        let f = fixture(GameConfig::default());
        let mut rx = f.events.subscribe();
        let game = f.manager.create(players(&[1000, 1000]), None, None).await.unwrap();
        f.storage.set_failing(true);
        assert!(f.manager.abort(game.id).await.is_err());
        assert_eq!(f.manager.active_count().await, 1);

        let ended = f.manager.abandon_unrecorded(game.id).await.unwrap();
        assert_eq!(ended.status, GameStatus::Abandoned);
        assert_eq!(f.manager.active_count().await, 0);
        assert_eq!(f.manager.get(game.id).await.unwrap().status, GameStatus::Abandoned);
        assert!(f.manager.abandon_unrecorded(game.id).await.is_none());

        let mut last = None;
        while let Ok(envelope) = rx.try_recv() {
            last = Some(envelope.notification.name());
        }
        assert_eq!(last, Some("game_over"));
    }
}
