//! # Arena
//!
//! The command hub. Owns one of each coordinator, routes client commands to
//! them, and carries the fallout between coordinators:
//!
//! - a finished game returns its lobby to READY or retires it
//! - a disconnect clears lobby ready flags and starts game grace periods
//! - an eviction removes the player from the queue, their lobbies and games
//!
//! The scheduler drives the periodic sweeps through the `sweep_*` methods.

use crate::clock::Clock;
use crate::command::{Command, Reply};
use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::events::EventBus;
use crate::game::{GameConclusion, GameSessionManager, MoveOutcome};
use crate::invitation::InvitationService;
use crate::lobby::{JoinAccess, LobbyCoordinator};
use crate::matchmaking::MatchmakingQueue;
use crate::presence::{ConnectOutcome, PresenceTracker};
use crate::rules::RulesetRegistry;
use crate::storage::Storage;
use crate::types::{Player, PlayerId, DEFAULT_RATING};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counts from one pass of every sweep, mostly for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub matches: usize,
    pub expired_turns: usize,
    pub expired_invitations: usize,
    pub evictions: usize,
}

#[derive(Debug)]
pub struct Arena {
    players: DashMap<PlayerId, Player>,
    queue: MatchmakingQueue,
    lobbies: Arc<LobbyCoordinator>,
    games: Arc<GameSessionManager>,
    invitations: InvitationService,
    presence: PresenceTracker,
    storage: Arc<dyn Storage>,
    events: EventBus,
    config: ArenaConfig,
}

impl Arena {
    /// Wires every coordinator to shared storage, notifications and clock.
    pub fn new(config: ArenaConfig, storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::default();
        let mut rulesets = RulesetRegistry::with_builtin();
        if !rulesets.set_default(&config.game.default_ruleset) {
            warn!(
                "⚠️ Unknown default ruleset '{}', using '{}'",
                config.game.default_ruleset,
                rulesets.default_name()
            );
        }
        let mut game_config = config.game.clone();
        game_config.default_ruleset = rulesets.default_name().to_string();

        let games = Arc::new(GameSessionManager::new(
            game_config,
            Arc::new(rulesets),
            storage.clone(),
            events.clone(),
            clock.clone(),
        ));
        let lobbies = Arc::new(LobbyCoordinator::new(
            config.lobby.clone(),
            games.clone(),
            storage.clone(),
            events.clone(),
            clock.clone(),
        ));
        let queue = MatchmakingQueue::new(config.matchmaking.clone(), games.clone(), clock.clone());
        let invitations = InvitationService::new(
            config.invitations.clone(),
            lobbies.clone(),
            games.clone(),
            events.clone(),
            clock.clone(),
        );
        let presence = PresenceTracker::new(config.presence.clone(), clock);

        Self {
            players: DashMap::new(),
            queue,
            lobbies,
            games,
            invitations,
            presence,
            storage,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &MatchmakingQueue {
        &self.queue
    }

    pub fn lobbies(&self) -> &LobbyCoordinator {
        &self.lobbies
    }

    pub fn games(&self) -> &GameSessionManager {
        &self.games
    }

    pub fn invitations(&self) -> &InvitationService {
        &self.invitations
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn player(&self, player_id: PlayerId) -> Option<Player> {
        self.players.get(&player_id).map(|p| p.clone())
    }

    /// Registers a player's connection. The rating comes from storage when
    /// one has been recorded.
    pub async fn connect(
        &self,
        player_id: PlayerId,
        username: impl Into<String>,
    ) -> Result<(Player, ConnectOutcome), ArenaError> {
        let known = self.player(player_id).map(|p| p.rating);
        let stored = self.storage.load_rating(player_id).await?;
        let rating = stored.or(known).unwrap_or(DEFAULT_RATING);
        let player = Player::new(player_id, username).with_rating(rating);
        self.players.insert(player_id, player.clone());

        let outcome = self.presence.connect(player_id);
        if outcome == ConnectOutcome::Reconnected {
            self.games.on_reconnect(player_id).await;
        }
        info!("👋 Player {} ({}) connected: {:?}", player.username, player_id, outcome);
        Ok((player, outcome))
    }

    /// Handles a dropped connection. The player keeps their seats until the
    /// reconnection window runs out.
    pub async fn disconnect(&self, player_id: PlayerId) {
        if !self.presence.disconnect(player_id) {
            return;
        }
        info!("🔌 Player {} disconnected", player_id);
        self.lobbies.on_disconnect(player_id).await;
        let ended = self.games.on_disconnect(player_id).await;
        self.settle_games(ended).await;
    }

    pub fn heartbeat(&self, player_id: PlayerId) -> bool {
        self.presence.heartbeat(player_id)
    }

    /// Runs one command on behalf of `actor`.
    pub async fn execute(&self, actor: PlayerId, command: Command) -> Result<Reply, ArenaError> {
        let player = self.player(actor).ok_or(ArenaError::UnknownPlayer(actor))?;
        self.presence.heartbeat(actor);
        debug!("📨 {} from {}", command.name(), actor);

        let reply = match command {
            Command::Heartbeat {} => Reply::Ack { ok: true },

            Command::QueueJoin {
                rating,
                preferences,
            } => Reply::Queue(
                self.queue
                    .enqueue_claiming(player, rating, preferences)
                    .await?,
            ),
            Command::QueueLeave {} => Reply::Removed {
                removed: self.queue.dequeue(actor).await,
            },
            Command::QueueStatus {} => Reply::QueueStatus(self.queue.status(Some(actor)).await),

            Command::LobbyCreate { settings } => {
                Reply::Lobby(self.lobbies.create(player, settings).await?)
            }
            Command::LobbyJoin { lobby_id, password } => Reply::Lobby(
                self.lobbies
                    .join(lobby_id, player, JoinAccess::Password(password))
                    .await?,
            ),
            Command::LobbyLeave { lobby_id } => Reply::Left(self.lobbies.leave(lobby_id, actor).await?),
            Command::LobbySetReady { lobby_id, ready } => {
                Reply::Lobby(self.lobbies.set_ready(lobby_id, actor, ready).await?)
            }
            Command::LobbyStart { lobby_id } => {
                let game = self.lobbies.start(lobby_id, actor).await?;
                Reply::Started { game_id: game.id }
            }
            Command::LobbyChat { lobby_id, message } => {
                Reply::Chat(self.lobbies.chat(lobby_id, actor, &message).await?)
            }
            Command::LobbyList {} => Reply::Lobbies(self.lobbies.list_public().await),
            Command::LobbyGet { lobby_id } => Reply::Lobby(self.lobbies.get(lobby_id).await?),

            Command::InviteSend {
                recipient_id,
                lobby_id,
            } => Reply::Invitation(self.invitations.send(player, recipient_id, lobby_id).await?),
            Command::InviteRespond {
                invitation_id,
                accept,
            } => Reply::Responded(self.invitations.respond(invitation_id, player, accept).await?),
            Command::InviteCancel { invitation_id } => {
                Reply::Invitation(self.invitations.cancel(invitation_id, actor).await?)
            }

            Command::GameMove { game_id, mv } => {
                let outcome = self.games.apply_move(game_id, actor, mv).await?;
                if let MoveOutcome::GameOver(conclusion) = &outcome {
                    self.settle_games(vec![conclusion.clone()]).await;
                }
                Reply::Move(outcome)
            }
            Command::GameForfeit { game_id } => {
                let conclusion = self.games.forfeit(game_id, actor).await?;
                self.settle_games(vec![conclusion.clone()]).await;
                Reply::Concluded(conclusion)
            }
            Command::GameGet { game_id } => Reply::Game(self.games.get(game_id).await?),
        };
        Ok(reply)
    }

    pub async fn sweep_queue(&self) -> usize {
        self.queue.sweep().await.len()
    }

    pub async fn expand_queue(&self) {
        self.queue.expand().await;
    }

    pub async fn sweep_deadlines(&self) -> usize {
        self.games.sweep_deadlines().await.len()
    }

    pub async fn sweep_invitations(&self) -> usize {
        self.invitations.sweep_expired().await.len()
    }

    /// Evicts players whose reconnection window has run out and treats each
    /// as having left for good.
    pub async fn sweep_presence(&self) -> usize {
        let evicted = self.presence.sweep_evictions();
        for player_id in &evicted {
            let player_id = *player_id;
            self.queue.dequeue(player_id).await;
            self.lobbies.on_departure(player_id).await;
            let ended = self.games.on_departure(player_id).await;
            self.settle_games(ended).await;
            self.invitations.cancel_all_from(player_id).await;
            self.players.remove(&player_id);
            debug!("🗑️ Player {} departed", player_id);
        }
        evicted.len()
    }

    /// One pass of every sweep in dependency order.
    pub async fn sweep_all(&self) -> SweepReport {
        self.expand_queue().await;
        SweepReport {
            matches: self.sweep_queue().await,
            expired_turns: self.sweep_deadlines().await,
            expired_invitations: self.sweep_invitations().await,
            evictions: self.sweep_presence().await,
        }
    }

    /// Applies game endings to lobbies and cached ratings.
    async fn settle_games(&self, conclusions: Vec<GameConclusion>) {
        for conclusion in conclusions {
            for change in &conclusion.rating_changes {
                if let Some(mut player) = self.players.get_mut(&change.player_id) {
                    player.rating = change.new_rating;
                }
            }
            if let Some(lobby_id) = conclusion.lobby_id {
                if let Err(e) = self.lobbies.on_game_finished(lobby_id, conclusion.game_id).await {
                    warn!("⚠️ Lobby {} not updated after game {}: {}", lobby_id, conclusion.game_id, e);
                }
            }
        }
    }
}
