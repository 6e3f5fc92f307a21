//! Tunables for every coordinator, grouped the way they appear in the
//! `[arena]` section of the server's TOML file.

use crate::game::GameConfig;
use crate::invitation::InvitationConfig;
use crate::lobby::LobbyConfig;
use crate::matchmaking::MatchmakingConfig;
use crate::presence::PresenceConfig;
use crate::rules::RulesetRegistry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub matchmaking: MatchmakingConfig,
    pub lobby: LobbyConfig,
    pub game: GameConfig,
    pub invitations: InvitationConfig,
    pub presence: PresenceConfig,
}

impl ArenaConfig {
    /// Checks that the values can drive the coordinators.
    pub fn validate(&self) -> Result<(), String> {
        let mm = &self.matchmaking;
        if !(mm.base_range.is_finite() && mm.base_range > 0.0) {
            return Err("matchmaking.base_range must be positive".to_string());
        }
        if !(mm.expansion_rate.is_finite() && mm.expansion_rate >= 0.0) {
            return Err("matchmaking.expansion_rate cannot be negative".to_string());
        }

        let lobby = &self.lobby;
        if lobby.min_players < 2 {
            return Err("lobby.min_players must be at least 2".to_string());
        }
        if lobby.max_players < lobby.min_players {
            return Err("lobby.max_players cannot be less than lobby.min_players".to_string());
        }
        if !(lobby.min_players..=lobby.max_players).contains(&lobby.default_max_players) {
            return Err("lobby.default_max_players must lie within the player limits".to_string());
        }
        if lobby.max_chat_length == 0 {
            return Err("lobby.max_chat_length must be positive".to_string());
        }

        let game = &self.game;
        if game.max_turn_secs == 0 {
            return Err("game.max_turn_secs must be positive".to_string());
        }
        if !(game.k_factor > 0.0 && game.forfeit_k_factor > 0.0) {
            return Err("game k factors must be positive".to_string());
        }
        if !RulesetRegistry::with_builtin().contains(&game.default_ruleset) {
            return Err(format!("unknown game.default_ruleset '{}'", game.default_ruleset));
        }

        if self.invitations.ttl_secs == 0 {
            return Err("invitations.ttl_secs must be positive".to_string());
        }
        Ok(())
    }
}
