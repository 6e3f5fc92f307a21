//! Time-boxed invitations, either into a lobby or to a direct 1v1 game.
//!
//! Invitations are never reused: once accepted, declined, cancelled or
//! expired they stay terminal until the sweep prunes them.

use crate::clock::{secs, Clock};
use crate::error::ErrorKind;
use crate::events::{EventBus, Notification};
use crate::game::{GameError, GameSession, GameSessionManager};
use crate::lobby::{JoinAccess, Lobby, LobbyCoordinator, LobbyError};
use crate::types::{GameId, InvitationId, LobbyId, Player, PlayerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
    Expired,
}

impl fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
            InvitationStatus::Cancelled => "cancelled",
            InvitationStatus::Expired => "expired",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "lobby_id", rename_all = "snake_case")]
pub enum InvitationTarget {
    Lobby(LobbyId),
    /// A 1v1 game between sender and recipient.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    pub sender_id: PlayerId,
    pub sender_name: String,
    #[serde(skip)]
    sender_rating: i32,
    pub recipient_id: PlayerId,
    pub target: InvitationTarget,
    pub status: InvitationStatus,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub responded_at: Option<Timestamp>,
    /// Game created by accepting a direct invitation.
    pub game_id: Option<GameId>,
}

impl Invitation {
    fn sender(&self) -> Player {
        Player::new(self.sender_id, self.sender_name.clone()).with_rating(self.sender_rating)
    }

    fn is_live(&self, now: Timestamp) -> bool {
        self.status == InvitationStatus::Pending && now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvitationConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long resolved invitations stay queryable.
    pub retention_secs: u64,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            sweep_interval_secs: 5,
            retention_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Declined,
    JoinedLobby { lobby: Lobby },
    GameStarted { game_id: GameId },
}

#[derive(Debug, thiserror::Error)]
pub enum InvitationError {
    #[error("invitation {0} not found")]
    NotFound(InvitationId),

    #[error("invitation {0} has expired")]
    Expired(InvitationId),

    #[error("player {player_id} may not act on invitation {invitation_id}")]
    Unauthorized {
        invitation_id: InvitationId,
        player_id: PlayerId,
    },

    #[error("invitation {invitation_id} is already {status}")]
    NotPending {
        invitation_id: InvitationId,
        status: InvitationStatus,
    },

    #[error("players cannot invite themselves")]
    SelfInvite,

    #[error("player {0} already has a pending invitation from this sender")]
    AlreadyInvited(PlayerId),

    #[error(transparent)]
    Lobby(#[from] LobbyError),

    #[error(transparent)]
    Game(#[from] GameError),
}

impl InvitationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InvitationError::NotFound(_) => ErrorKind::NotFound,
            InvitationError::Expired(_) => ErrorKind::Expired,
            InvitationError::Unauthorized { .. } => ErrorKind::Unauthorized,
            InvitationError::NotPending { .. } | InvitationError::SelfInvite => {
                ErrorKind::InvalidState
            }
            InvitationError::AlreadyInvited(_) => ErrorKind::Conflict,
            InvitationError::Lobby(e) => e.kind(),
            InvitationError::Game(e) => e.kind(),
        }
    }
}

pub struct InvitationService {
    invitations: Mutex<HashMap<InvitationId, Invitation>>,
    lobbies: Arc<LobbyCoordinator>,
    games: Arc<GameSessionManager>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: InvitationConfig,
}

impl fmt::Debug for InvitationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvitationService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InvitationService {
    pub fn new(
        config: InvitationConfig,
        lobbies: Arc<LobbyCoordinator>,
        games: Arc<GameSessionManager>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            invitations: Mutex::new(HashMap::new()),
            lobbies,
            games,
            events,
            clock,
            config,
        }
    }

    /// Invites `recipient_id` into `lobby_id`, or to a direct game when no
    /// lobby is given. Lobby invitations require the sender to be a member.
    pub async fn send(
        &self,
        sender: Player,
        recipient_id: PlayerId,
        lobby_id: Option<LobbyId>,
    ) -> Result<Invitation, InvitationError> {
        if sender.id == recipient_id {
            return Err(InvitationError::SelfInvite);
        }
        let target = match lobby_id {
            Some(lobby_id) => {
                let lobby = self.lobbies.get(lobby_id).await?;
                if !lobby.is_member(sender.id) {
                    return Err(LobbyError::NotMember {
                        lobby_id,
                        player_id: sender.id,
                    }
                    .into());
                }
                InvitationTarget::Lobby(lobby_id)
            }
            None => InvitationTarget::Direct,
        };

        let now = self.clock.now();
        let invitation = {
            let mut invitations = self.invitations.lock().await;
            let duplicate = invitations.values().any(|i| {
                i.sender_id == sender.id
                    && i.recipient_id == recipient_id
                    && i.target == target
                    && i.is_live(now)
            });
            if duplicate {
                return Err(InvitationError::AlreadyInvited(recipient_id));
            }

            let invitation = Invitation {
                id: InvitationId::new(),
                sender_id: sender.id,
                sender_name: sender.username,
                sender_rating: sender.rating,
                recipient_id,
                target,
                status: InvitationStatus::Pending,
                created_at: now,
                expires_at: now + secs(self.config.ttl_secs),
                responded_at: None,
                game_id: None,
            };
            invitations.insert(invitation.id, invitation.clone());
            invitation
        };

        debug!("✉️ Invitation {} from {} to {}", invitation.id, invitation.sender_id, recipient_id);
        self.events.emit_to_user(
            recipient_id,
            Notification::InvitationReceived {
                invitation: invitation.clone(),
            },
        );
        Ok(invitation)
    }

    /// Accepts or declines. Accepting joins the target lobby (bypassing any
    /// password) or starts a direct game.
    pub async fn respond(
        &self,
        invitation_id: InvitationId,
        recipient: Player,
        accept: bool,
    ) -> Result<Response, InvitationError> {
        let now = self.clock.now();
        let invitation = {
            let mut invitations = self.invitations.lock().await;
            let invitation = invitations
                .get_mut(&invitation_id)
                .ok_or(InvitationError::NotFound(invitation_id))?;
            if invitation.recipient_id != recipient.id {
                return Err(InvitationError::Unauthorized {
                    invitation_id,
                    player_id: recipient.id,
                });
            }
            match invitation.status {
                InvitationStatus::Expired => return Err(InvitationError::Expired(invitation_id)),
                InvitationStatus::Pending if now >= invitation.expires_at => {
                    return Err(InvitationError::Expired(invitation_id));
                }
                InvitationStatus::Pending => {}
                status => {
                    return Err(InvitationError::NotPending {
                        invitation_id,
                        status,
                    })
                }
            }
            invitation.status = if accept {
                InvitationStatus::Accepted
            } else {
                InvitationStatus::Declined
            };
            invitation.responded_at = Some(now);
            invitation.clone()
        };

        if !accept {
            debug!("🙅 Invitation {} declined", invitation_id);
            self.events.emit_to_user(
                invitation.sender_id,
                Notification::InvitationDeclined {
                    invitation_id,
                    recipient_id: recipient.id,
                },
            );
            return Ok(Response::Declined);
        }

        let result = match invitation.target {
            InvitationTarget::Lobby(lobby_id) => self
                .lobbies
                .join(lobby_id, recipient.clone(), JoinAccess::Invited)
                .await
                .map(|lobby| Response::JoinedLobby { lobby })
                .map_err(InvitationError::from),
            InvitationTarget::Direct => self
                .games
                .create(vec![invitation.sender(), recipient.clone()], None, None)
                .await
                .map(|game: GameSession| Response::GameStarted { game_id: game.id })
                .map_err(InvitationError::from),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.reopen(invitation_id).await;
                return Err(e);
            }
        };

        let (game_id, lobby_id) = match (&response, invitation.target) {
            (Response::GameStarted { game_id }, _) => (Some(*game_id), None),
            (_, InvitationTarget::Lobby(lobby_id)) => (None, Some(lobby_id)),
            _ => (None, None),
        };
        if game_id.is_some() {
            if let Some(stored) = self.invitations.lock().await.get_mut(&invitation_id) {
                stored.game_id = game_id;
            }
        }

        info!("🤝 Invitation {} accepted by {}", invitation_id, recipient.id);
        let accepted = Notification::InvitationAccepted {
            invitation_id,
            recipient_id: recipient.id,
            game_id,
            lobby_id,
        };
        self.events.emit_to_user(invitation.sender_id, accepted.clone());
        self.events.emit_to_user(recipient.id, accepted);
        Ok(response)
    }

    /// Withdraws a pending invitation. Only the sender may cancel.
    pub async fn cancel(
        &self,
        invitation_id: InvitationId,
        sender_id: PlayerId,
    ) -> Result<Invitation, InvitationError> {
        let invitation = {
            let mut invitations = self.invitations.lock().await;
            let invitation = invitations
                .get_mut(&invitation_id)
                .ok_or(InvitationError::NotFound(invitation_id))?;
            if invitation.sender_id != sender_id {
                return Err(InvitationError::Unauthorized {
                    invitation_id,
                    player_id: sender_id,
                });
            }
            if invitation.status != InvitationStatus::Pending {
                return Err(InvitationError::NotPending {
                    invitation_id,
                    status: invitation.status,
                });
            }
            invitation.status = InvitationStatus::Cancelled;
            invitation.responded_at = Some(self.clock.now());
            invitation.clone()
        };

        self.events.emit_to_user(
            invitation.recipient_id,
            Notification::InvitationCancelled { invitation_id },
        );
        Ok(invitation)
    }

    /// Cancels every pending invitation sent by a player who has left for good.
    pub async fn cancel_all_from(&self, sender_id: PlayerId) -> usize {
        let pending: Vec<InvitationId> = {
            let invitations = self.invitations.lock().await;
            invitations
                .values()
                .filter(|i| i.sender_id == sender_id && i.status == InvitationStatus::Pending)
                .map(|i| i.id)
                .collect()
        };
        let mut cancelled = 0;
        for invitation_id in pending {
            if self.cancel(invitation_id, sender_id).await.is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Expires pending invitations past their deadline and forgets resolved
    /// ones older than the retention period.
    pub async fn sweep_expired(&self) -> Vec<InvitationId> {
        let now = self.clock.now();
        let retention = secs(self.config.retention_secs);
        let expired: Vec<Invitation> = {
            let mut invitations = self.invitations.lock().await;
            let mut expired = Vec::new();
            for invitation in invitations.values_mut() {
                if invitation.status == InvitationStatus::Pending && now >= invitation.expires_at {
                    invitation.status = InvitationStatus::Expired;
                    expired.push(invitation.clone());
                }
            }
            invitations.retain(|_, i| {
                i.status == InvitationStatus::Pending
                    || i.responded_at.unwrap_or(i.expires_at) + retention > now
            });
            expired
        };

        for invitation in &expired {
            debug!("⌛ Invitation {} expired", invitation.id);
            let note = Notification::InvitationExpired {
                invitation_id: invitation.id,
            };
            self.events.emit_to_user(invitation.sender_id, note.clone());
            self.events.emit_to_user(invitation.recipient_id, note);
        }
        expired.into_iter().map(|i| i.id).collect()
    }

    pub async fn get(&self, invitation_id: InvitationId) -> Result<Invitation, InvitationError> {
        self.invitations
            .lock()
            .await
            .get(&invitation_id)
            .cloned()
            .ok_or(InvitationError::NotFound(invitation_id))
    }

    pub async fn pending_for(&self, recipient_id: PlayerId) -> Vec<Invitation> {
        let now = self.clock.now();
        self.invitations
            .lock()
            .await
            .values()
            .filter(|i| i.recipient_id == recipient_id && i.is_live(now))
            .cloned()
            .collect()
    }

    async fn reopen(&self, invitation_id: InvitationId) {
        let mut invitations = self.invitations.lock().await;
        match invitations.get_mut(&invitation_id) {
            Some(invitation) if invitation.status == InvitationStatus::Accepted => {
                invitation.status = InvitationStatus::Pending;
                invitation.responded_at = None;
            }
            _ => warn!("⚠️ Invitation {} changed before it could be reopened", invitation_id),
        }
    }
}
