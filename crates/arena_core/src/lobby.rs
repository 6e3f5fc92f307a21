//! # Lobby Coordinator
//!
//! Pre-game groups of players negotiating readiness. Each lobby moves through
//! a small state machine:
//!
//! ```text
//! CREATED ──► FILLING ◄──► READY ──► IN_GAME ──► READY (reused)
//!    │           │           │          │
//!    └───────────┴───────────┴──────────┴──► COMPLETED
//! ```
//!
//! Every mutation is applied to the in-memory table first, written to storage
//! with the lock released, and rolled back if the write fails. Notifications
//! go out only after the write succeeds.

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::events::{EventBus, Notification, Scope};
use crate::game::{GameError, GameSession, GameSessionManager};
use crate::storage::{Storage, StorageError};
use crate::types::{GameId, LobbyId, Player, PlayerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const MAX_NAME_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LobbyState {
    Created,
    Filling,
    Ready,
    InGame,
    Completed,
}

impl LobbyState {
    pub fn can_transition_to(self, to: LobbyState) -> bool {
        use LobbyState::*;
        matches!(
            (self, to),
            (Created, Filling)
                | (Created, Completed)
                | (Filling, Ready)
                | (Filling, Completed)
                | (Ready, Filling)
                | (Ready, InGame)
                | (Ready, Completed)
                | (InGame, Ready)
                | (InGame, Completed)
        )
    }

    /// States in which membership and ready flags may change.
    pub fn is_gathering(self) -> bool {
        matches!(self, LobbyState::Created | LobbyState::Filling | LobbyState::Ready)
    }
}

impl fmt::Display for LobbyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LobbyState::Created => "CREATED",
            LobbyState::Filling => "FILLING",
            LobbyState::Ready => "READY",
            LobbyState::InGame => "IN_GAME",
            LobbyState::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyMember {
    pub player_id: PlayerId,
    pub username: String,
    pub rating: i32,
    pub ready: bool,
    pub joined_at: Timestamp,
}

impl LobbyMember {
    fn as_player(&self) -> Player {
        Player {
            id: self.player_id,
            username: self.username.clone(),
            rating: self.rating,
        }
    }
}

/// Requested shape of a new lobby.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbySettings {
    pub name: String,
    pub max_players: Option<usize>,
    pub is_private: bool,
    pub password: Option<String>,
    pub ruleset: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lobby {
    pub id: LobbyId,
    pub name: String,
    pub host_id: PlayerId,
    /// In join order.
    pub members: Vec<LobbyMember>,
    pub max_players: usize,
    pub is_private: bool,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    pub state: LobbyState,
    pub ruleset: String,
    pub game_id: Option<GameId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(skip)]
    pub(crate) version: u64,
}

impl Lobby {
    pub fn member(&self, player_id: PlayerId) -> Option<&LobbyMember> {
        self.members.iter().find(|m| m.player_id == player_id)
    }

    pub fn is_member(&self, player_id: PlayerId) -> bool {
        self.member(player_id).is_some()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_players
    }

    pub fn member_ids(&self) -> Vec<PlayerId> {
        self.members.iter().map(|m| m.player_id).collect()
    }

    fn all_ready(&self) -> bool {
        self.members.len() >= 2 && self.members.iter().all(|m| m.ready)
    }

    /// Moves between CREATED, FILLING and READY to match the current
    /// membership and ready flags. Returns each step taken.
    fn settle(&mut self) -> Vec<(LobbyState, LobbyState)> {
        let mut steps = Vec::new();
        loop {
            let target = match self.state {
                LobbyState::Created if self.members.len() >= 2 => LobbyState::Filling,
                LobbyState::Filling if self.all_ready() => LobbyState::Ready,
                LobbyState::Ready if !self.all_ready() => LobbyState::Filling,
                _ => break,
            };
            steps.push((self.state, target));
            self.state = target;
        }
        steps
    }

    fn transition(&mut self, to: LobbyState) -> Result<(LobbyState, LobbyState), LobbyError> {
        if !self.state.can_transition_to(to) {
            warn!("🚫 Lobby {} rejected transition {} -> {}", self.id, self.state, to);
            return Err(LobbyError::InvalidTransition {
                lobby_id: self.id,
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        Ok((from, to))
    }

    fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
        self.version += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub player_id: PlayerId,
    pub username: String,
    pub message: String,
    pub sent_at: Timestamp,
}

/// How a player is getting into a lobby.
#[derive(Debug, Clone)]
pub enum JoinAccess {
    Password(Option<String>),
    /// Accepted an invitation, which stands in for the password.
    Invited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    pub min_players: usize,
    pub max_players: usize,
    pub default_max_players: usize,
    /// Return lobbies to READY after their game instead of retiring them.
    pub reuse_after_game: bool,
    pub max_chat_length: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_players: 10,
            default_max_players: 2,
            reuse_after_game: true,
            max_chat_length: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveOutcome {
    /// The lobby after the departure, or `None` if it was retired.
    pub lobby: Option<Lobby>,
    pub new_host: Option<PlayerId>,
}

#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error("lobby {0} not found")]
    NotFound(LobbyId),

    #[error("lobby {0} is full")]
    Full(LobbyId),

    #[error("lobby {lobby_id} is not accepting players ({state})")]
    NotJoinable { lobby_id: LobbyId, state: LobbyState },

    #[error("wrong password for lobby {0}")]
    WrongPassword(LobbyId),

    #[error("player {player_id} is already in lobby {lobby_id}")]
    AlreadyMember { lobby_id: LobbyId, player_id: PlayerId },

    #[error("player {player_id} is not in lobby {lobby_id}")]
    NotMember { lobby_id: LobbyId, player_id: PlayerId },

    #[error("only the host can do that in lobby {0}")]
    NotHost(LobbyId),

    #[error("lobby {0} is not ready")]
    NotReady(LobbyId),

    #[error("lobby {0} needs at least two players")]
    NotEnoughPlayers(LobbyId),

    #[error("invalid lobby settings: {0}")]
    InvalidSettings(String),

    #[error("invalid chat message: {0}")]
    InvalidMessage(String),

    #[error("lobby {lobby_id} is {state}")]
    Closed { lobby_id: LobbyId, state: LobbyState },

    #[error("lobby {lobby_id} cannot go from {from} to {to}")]
    InvalidTransition {
        lobby_id: LobbyId,
        from: LobbyState,
        to: LobbyState,
    },

    #[error(transparent)]
    Game(#[from] GameError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LobbyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LobbyError::NotFound(_) => ErrorKind::NotFound,
            LobbyError::AlreadyMember { .. } => ErrorKind::Conflict,
            LobbyError::WrongPassword(_)
            | LobbyError::NotMember { .. }
            | LobbyError::NotHost(_) => ErrorKind::Unauthorized,
            LobbyError::Full(_)
            | LobbyError::NotJoinable { .. }
            | LobbyError::NotReady(_)
            | LobbyError::NotEnoughPlayers(_)
            | LobbyError::InvalidSettings(_)
            | LobbyError::InvalidMessage(_)
            | LobbyError::Closed { .. }
            | LobbyError::InvalidTransition { .. } => ErrorKind::InvalidState,
            LobbyError::Game(e) => e.kind(),
            LobbyError::Storage(_) => ErrorKind::Storage,
        }
    }
}

type Steps = Vec<(LobbyState, LobbyState)>;

pub struct LobbyCoordinator {
    lobbies: Mutex<HashMap<LobbyId, Lobby>>,
    games: Arc<GameSessionManager>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: LobbyConfig,
}

impl fmt::Debug for LobbyCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LobbyCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LobbyCoordinator {
    pub fn new(
        config: LobbyConfig,
        games: Arc<GameSessionManager>,
        storage: Arc<dyn Storage>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lobbies: Mutex::new(HashMap::new()),
            games,
            storage,
            events,
            clock,
            config,
        }
    }

    /// Opens a lobby with `host` as its only, non-ready member.
    pub async fn create(&self, host: Player, settings: LobbySettings) -> Result<Lobby, LobbyError> {
        let name = settings.name.trim().to_string();
        if name.is_empty() || name.chars().count() > MAX_NAME_LENGTH {
            return Err(LobbyError::InvalidSettings(format!(
                "name must be 1 to {MAX_NAME_LENGTH} characters"
            )));
        }
        let max_players = settings.max_players.unwrap_or(self.config.default_max_players);
        if !(self.config.min_players..=self.config.max_players).contains(&max_players) {
            return Err(LobbyError::InvalidSettings(format!(
                "max_players must be between {} and {}",
                self.config.min_players, self.config.max_players
            )));
        }
        let ruleset = settings
            .ruleset
            .unwrap_or_else(|| self.games.config().default_ruleset.clone());
        if !self.games.has_ruleset(&ruleset) {
            return Err(GameError::UnknownRuleset(ruleset).into());
        }

        let now = self.clock.now();
        let lobby = Lobby {
            id: LobbyId::new(),
            name,
            host_id: host.id,
            members: vec![LobbyMember {
                player_id: host.id,
                username: host.username,
                rating: host.rating,
                ready: false,
                joined_at: now,
            }],
            max_players,
            is_private: settings.is_private,
            password: settings
                .password
                .filter(|p| settings.is_private && !p.is_empty()),
            state: LobbyState::Created,
            ruleset,
            game_id: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.lobbies.lock().await.insert(lobby.id, lobby.clone());
        self.persist(None, &lobby).await?;

        info!("🏠 Lobby {} '{}' created by {}", lobby.id, lobby.name, lobby.host_id);
        self.announce(&lobby, Vec::new(), vec![Notification::LobbyCreated { lobby: lobby.clone() }]);
        Ok(lobby)
    }

    pub async fn join(
        &self,
        lobby_id: LobbyId,
        player: Player,
        access: JoinAccess,
    ) -> Result<Lobby, LobbyError> {
        let (prior, lobby, steps) = {
            let mut lobbies = self.lobbies.lock().await;
            let lobby = lobbies.get_mut(&lobby_id).ok_or(LobbyError::NotFound(lobby_id))?;
            if lobby.is_member(player.id) {
                return Err(LobbyError::AlreadyMember {
                    lobby_id,
                    player_id: player.id,
                });
            }
            if !matches!(lobby.state, LobbyState::Created | LobbyState::Filling) {
                return Err(LobbyError::NotJoinable {
                    lobby_id,
                    state: lobby.state,
                });
            }
            if lobby.is_full() {
                return Err(LobbyError::Full(lobby_id));
            }
            if lobby.is_private {
                let admitted = match (&access, &lobby.password) {
                    (JoinAccess::Invited, _) => true,
                    (JoinAccess::Password(Some(given)), Some(expected)) => given == expected,
                    _ => false,
                };
                if !admitted {
                    return Err(LobbyError::WrongPassword(lobby_id));
                }
            }

            let prior = lobby.clone();
            let now = self.clock.now();
            lobby.members.push(LobbyMember {
                player_id: player.id,
                username: player.username.clone(),
                rating: player.rating,
                ready: false,
                joined_at: now,
            });
            let steps = lobby.settle();
            lobby.touch(now);
            (prior, lobby.clone(), steps)
        };

        self.persist(Some(prior), &lobby).await?;

        debug!("🚪 Player {} joined lobby {}", player.id, lobby_id);
        self.announce(
            &lobby,
            steps,
            vec![Notification::PlayerJoinedLobby {
                lobby_id,
                player_id: player.id,
                username: player.username,
            }],
        );
        Ok(lobby)
    }

    /// Removes a member. The last member out retires the lobby, and a
    /// departing host hands over to the earliest-joined remaining member.
    pub async fn leave(&self, lobby_id: LobbyId, player_id: PlayerId) -> Result<LeaveOutcome, LobbyError> {
        let (prior, lobby, steps, new_host) = {
            let mut lobbies = self.lobbies.lock().await;
            let lobby = lobbies.get_mut(&lobby_id).ok_or(LobbyError::NotFound(lobby_id))?;
            if !lobby.is_member(player_id) {
                return Err(LobbyError::NotMember { lobby_id, player_id });
            }

            let prior = lobby.clone();
            lobby.members.retain(|m| m.player_id != player_id);

            let mut steps = Vec::new();
            let mut new_host = None;
            if lobby.members.is_empty() {
                if lobby.state != LobbyState::InGame {
                    steps.push(lobby.transition(LobbyState::Completed)?);
                }
            } else {
                if lobby.host_id == player_id {
                    if let Some(next) = lobby.members.iter().min_by_key(|m| m.joined_at) {
                        lobby.host_id = next.player_id;
                        new_host = Some(next.player_id);
                    }
                }
                steps = lobby.settle();
            }
            lobby.touch(self.clock.now());

            let lobby = lobby.clone();
            if lobby.state == LobbyState::Completed {
                lobbies.remove(&lobby_id);
            }
            (prior, lobby, steps, new_host)
        };

        self.persist(Some(prior), &lobby).await?;

        debug!("🚶 Player {} left lobby {}", player_id, lobby_id);
        if let Some(host) = new_host {
            info!("👑 Lobby {} host passed to {}", lobby_id, host);
        }
        let mut audience = lobby.member_ids();
        audience.push(player_id);
        self.announce_to(
            &lobby,
            audience,
            steps,
            vec![Notification::PlayerLeftLobby {
                lobby_id,
                player_id,
                new_host,
            }],
        );

        let retired = lobby.state == LobbyState::Completed;
        Ok(LeaveOutcome {
            lobby: (!retired).then_some(lobby),
            new_host,
        })
    }

    pub async fn set_ready(
        &self,
        lobby_id: LobbyId,
        player_id: PlayerId,
        ready: bool,
    ) -> Result<Lobby, LobbyError> {
        let (prior, lobby, steps) = {
            let mut lobbies = self.lobbies.lock().await;
            let lobby = lobbies.get_mut(&lobby_id).ok_or(LobbyError::NotFound(lobby_id))?;
            let index = lobby
                .members
                .iter()
                .position(|m| m.player_id == player_id)
                .ok_or(LobbyError::NotMember { lobby_id, player_id })?;
            if !lobby.state.is_gathering() {
                return Err(LobbyError::Closed {
                    lobby_id,
                    state: lobby.state,
                });
            }
            if lobby.members[index].ready == ready {
                return Ok(lobby.clone());
            }

            let prior = lobby.clone();
            lobby.members[index].ready = ready;
            let steps = lobby.settle();
            lobby.touch(self.clock.now());
            (prior, lobby.clone(), steps)
        };

        self.persist(Some(prior), &lobby).await?;

        self.announce(
            &lobby,
            steps,
            vec![Notification::PlayerReadyChanged {
                lobby_id,
                player_id,
                ready,
            }],
        );
        Ok(lobby)
    }

    /// Host-only. Moves a READY lobby to IN_GAME and seats every member in a
    /// new game.
    pub async fn start(&self, lobby_id: LobbyId, requester: PlayerId) -> Result<GameSession, LobbyError> {
        let (prior, buffered) = {
            let mut lobbies = self.lobbies.lock().await;
            let lobby = lobbies.get_mut(&lobby_id).ok_or(LobbyError::NotFound(lobby_id))?;
            if lobby.host_id != requester {
                return Err(LobbyError::NotHost(lobby_id));
            }
            if lobby.members.len() < 2 {
                return Err(LobbyError::NotEnoughPlayers(lobby_id));
            }
            if lobby.state != LobbyState::Ready {
                return Err(LobbyError::NotReady(lobby_id));
            }
            let prior = lobby.clone();
            lobby.transition(LobbyState::InGame)?;
            lobby.touch(self.clock.now());
            (prior, lobby.clone())
        };

        let players = buffered.members.iter().map(LobbyMember::as_player).collect();
        let game = match self
            .games
            .create(players, Some(&buffered.ruleset), Some(lobby_id))
            .await
        {
            Ok(game) => game,
            Err(e) => {
                self.restore(prior, buffered.version).await;
                return Err(e.into());
            }
        };

        // Members may have left while the game was being created. The game is
        // recorded on the lobby as it is now, not on the buffered copy.
        let recorded = {
            let mut lobbies = self.lobbies.lock().await;
            match lobbies.get_mut(&lobby_id) {
                Some(lobby) if lobby.state == LobbyState::InGame && lobby.game_id.is_none() => {
                    let rollback = if lobby.version == buffered.version {
                        prior
                    } else {
                        let mut reverted = lobby.clone();
                        reverted.state = LobbyState::Ready;
                        reverted.settle();
                        reverted
                    };
                    lobby.game_id = Some(game.id);
                    lobby.touch(self.clock.now());
                    Some((rollback, lobby.clone()))
                }
                _ => None,
            }
        };
        let Some((rollback, lobby)) = recorded else {
            warn!("⚠️ Lobby {} vanished while starting game {}", lobby_id, game.id);
            self.discard_game(game.id).await;
            return Err(LobbyError::NotFound(lobby_id));
        };

        if let Err(e) = self.persist(Some(rollback), &lobby).await {
            self.discard_game(game.id).await;
            return Err(e);
        }

        info!("🎬 Lobby {} started game {}", lobby_id, game.id);
        self.announce(&lobby, vec![(LobbyState::Ready, LobbyState::InGame)], Vec::new());
        Ok(game)
    }

    /// Broadcasts a chat line to the lobby. Nothing is stored.
    pub async fn chat(
        &self,
        lobby_id: LobbyId,
        player_id: PlayerId,
        message: &str,
    ) -> Result<ChatMessage, LobbyError> {
        let message = message.trim();
        if message.is_empty() || message.chars().count() > self.config.max_chat_length {
            return Err(LobbyError::InvalidMessage(format!(
                "messages must be 1 to {} characters",
                self.config.max_chat_length
            )));
        }

        let (chat, audience) = {
            let lobbies = self.lobbies.lock().await;
            let lobby = lobbies.get(&lobby_id).ok_or(LobbyError::NotFound(lobby_id))?;
            let member = lobby
                .member(player_id)
                .ok_or(LobbyError::NotMember { lobby_id, player_id })?;
            let chat = ChatMessage {
                player_id,
                username: member.username.clone(),
                message: message.to_string(),
                sent_at: self.clock.now(),
            };
            (chat, lobby.member_ids())
        };

        self.events.emit(
            Scope::Lobby(lobby_id),
            audience,
            Notification::LobbyChat {
                lobby_id,
                message: chat.clone(),
            },
        );
        Ok(chat)
    }

    /// Called when the game a lobby started has ended.
    pub async fn on_game_finished(&self, lobby_id: LobbyId, game_id: GameId) -> Result<Option<Lobby>, LobbyError> {
        let (prior, lobby, steps) = {
            let mut lobbies = self.lobbies.lock().await;
            let lobby = lobbies.get_mut(&lobby_id).ok_or(LobbyError::NotFound(lobby_id))?;
            if lobby.state != LobbyState::InGame || lobby.game_id != Some(game_id) {
                return Err(LobbyError::InvalidTransition {
                    lobby_id,
                    from: lobby.state,
                    to: LobbyState::Ready,
                });
            }

            let prior = lobby.clone();
            lobby.game_id = None;
            let reuse = self.config.reuse_after_game && lobby.members.len() >= 2;
            let mut steps = if reuse {
                vec![lobby.transition(LobbyState::Ready)?]
            } else {
                vec![lobby.transition(LobbyState::Completed)?]
            };
            if reuse {
                steps.extend(lobby.settle());
            }
            lobby.touch(self.clock.now());

            let lobby = lobby.clone();
            if lobby.state == LobbyState::Completed {
                lobbies.remove(&lobby_id);
            }
            (prior, lobby, steps)
        };

        self.persist(Some(prior), &lobby).await?;
        info!("🔁 Lobby {} after game {}: {}", lobby_id, game_id, lobby.state);
        self.announce(&lobby, steps, Vec::new());
        Ok((lobby.state != LobbyState::Completed).then_some(lobby))
    }

    /// Clears the ready flag of a disconnected player in every lobby they
    /// are gathering in.
    pub async fn on_disconnect(&self, player_id: PlayerId) {
        let affected: Vec<LobbyId> = {
            let lobbies = self.lobbies.lock().await;
            lobbies
                .values()
                .filter(|l| l.state.is_gathering())
                .filter(|l| l.member(player_id).is_some_and(|m| m.ready))
                .map(|l| l.id)
                .collect()
        };
        for lobby_id in affected {
            if let Err(e) = self.set_ready(lobby_id, player_id, false).await {
                warn!("⚠️ Could not clear ready flag in lobby {}: {}", lobby_id, e);
            }
        }
    }

    /// Treats an evicted player as leaving every lobby they belong to.
    pub async fn on_departure(&self, player_id: PlayerId) -> Vec<LobbyId> {
        let lobby_ids = self.lobbies_for(player_id).await;
        let mut left = Vec::new();
        for lobby_id in lobby_ids {
            match self.leave(lobby_id, player_id).await {
                Ok(_) => left.push(lobby_id),
                Err(e) => warn!("⚠️ Could not remove {} from lobby {}: {}", player_id, lobby_id, e),
            }
        }
        left
    }

    /// Public lobbies that can still be joined.
    pub async fn list_public(&self) -> Vec<Lobby> {
        let lobbies = self.lobbies.lock().await;
        let mut open: Vec<Lobby> = lobbies
            .values()
            .filter(|l| !l.is_private && !l.is_full())
            .filter(|l| matches!(l.state, LobbyState::Created | LobbyState::Filling))
            .cloned()
            .collect();
        open.sort_by_key(|l| l.created_at);
        open
    }

    pub async fn get(&self, lobby_id: LobbyId) -> Result<Lobby, LobbyError> {
        self.lobbies
            .lock()
            .await
            .get(&lobby_id)
            .cloned()
            .ok_or(LobbyError::NotFound(lobby_id))
    }

    pub async fn lobbies_for(&self, player_id: PlayerId) -> Vec<LobbyId> {
        self.lobbies
            .lock()
            .await
            .values()
            .filter(|l| l.is_member(player_id))
            .map(|l| l.id)
            .collect()
    }

    /// Writes `updated`. On failure the table goes back to `prior`, unless
    /// the lobby has moved on since.
    async fn persist(&self, prior: Option<Lobby>, updated: &Lobby) -> Result<(), LobbyError> {
        let Err(e) = self.storage.save_lobby(updated).await else {
            return Ok(());
        };
        error!("❌ Failed to persist lobby {}: {}", updated.id, e);

        let mut lobbies = self.lobbies.lock().await;
        let current_version = lobbies.get(&updated.id).map(|l| l.version);
        match (prior, current_version) {
            (Some(prior), Some(v)) if v == updated.version => {
                lobbies.insert(prior.id, prior);
            }
            (Some(prior), None) if updated.state == LobbyState::Completed => {
                lobbies.insert(prior.id, prior);
            }
            (None, Some(v)) if v == updated.version => {
                lobbies.remove(&updated.id);
            }
            _ => warn!("⚠️ Lobby {} changed during failed write, keeping newer state", updated.id),
        }
        Err(e.into())
    }

    /// Ends a game no lobby will take. If storage cannot record that either,
    /// the game is ended in memory so it does not linger unowned.
    async fn discard_game(&self, game_id: GameId) {
        if let Err(e) = self.games.abort(game_id).await {
            error!("❌ Could not abort orphaned game {}: {}", game_id, e);
            self.games.abandon_unrecorded(game_id).await;
        }
    }

    async fn restore(&self, prior: Lobby, expected_version: u64) {
        let mut lobbies = self.lobbies.lock().await;
        match lobbies.get_mut(&prior.id) {
            Some(current) if current.version == expected_version => *current = prior,
            _ => warn!("⚠️ Lobby {} changed before rollback, keeping newer state", prior.id),
        }
    }

    fn announce(&self, lobby: &Lobby, steps: Steps, leading: Vec<Notification>) {
        self.announce_to(lobby, lobby.member_ids(), steps, leading);
    }

    fn announce_to(
        &self,
        lobby: &Lobby,
        audience: Vec<PlayerId>,
        steps: Steps,
        leading: Vec<Notification>,
    ) {
        let scope = Scope::Lobby(lobby.id);
        for notification in leading {
            self.events.emit(scope, audience.clone(), notification);
        }
        for (old, new) in steps {
            self.events.emit(
                scope,
                audience.clone(),
                Notification::LobbyStateChanged {
                    lobby_id: lobby.id,
                    old,
                    new,
                },
            );
        }
        let closing = if lobby.state == LobbyState::Completed {
            Notification::LobbyDeleted { lobby_id: lobby.id }
        } else {
            Notification::LobbyUpdated {
                lobby: lobby.clone(),
            }
        };
        self.events.emit(scope, audience, closing);
    }
}
