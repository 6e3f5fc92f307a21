//! Pluggable rules engines.
//!
//! The game session manager never interprets game state itself. It hands the
//! opaque JSON state and the player's move to a [`Ruleset`] and acts on the
//! [`Outcome`]. Rulesets are looked up by name in a [`RulesetRegistry`].

pub mod countdown;
pub mod tic_tac_toe;

use crate::error::ErrorKind;
use crate::types::PlayerId;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::RangeInclusive;
use std::sync::Arc;

pub use countdown::Countdown;
pub use tic_tac_toe::TicTacToe;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RulesError {
    #[error("{ruleset} does not support {count} players")]
    UnsupportedPlayerCount { ruleset: String, count: usize },

    #[error("invalid move: {0}")]
    InvalidMove(String),

    #[error("corrupt game state: {0}")]
    CorruptState(String),
}

impl RulesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RulesError::InvalidMove(_) => ErrorKind::InvalidMove,
            RulesError::UnsupportedPlayerCount { .. } | RulesError::CorruptState(_) => {
                ErrorKind::InvalidState
            }
        }
    }
}

/// Terminal evaluation of a game state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ongoing,
    Winner(PlayerId),
    Draw,
}

impl Outcome {
    pub fn is_over(&self) -> bool {
        !matches!(self, Outcome::Ongoing)
    }
}

/// Move legality and win conditions for one game.
pub trait Ruleset: Send + Sync + Debug {
    /// Registry key, e.g. `"tic_tac_toe"`.
    fn name(&self) -> &'static str;

    /// Number of players this game can be played with.
    fn player_range(&self) -> RangeInclusive<usize>;

    /// Initial state for the given players, in seating order.
    fn initial_state(&self, players: &[PlayerId]) -> Result<Value, RulesError>;

    /// Checks that `player` may make `mv` in `state`. Turn order is enforced
    /// by the caller.
    fn validate(&self, state: &Value, player: PlayerId, mv: &Value) -> Result<(), RulesError>;

    /// Produces the state after a validated move.
    fn apply(&self, state: &Value, player: PlayerId, mv: &Value) -> Result<Value, RulesError>;

    fn evaluate(&self, state: &Value) -> Outcome;

    fn check_player_count(&self, count: usize) -> Result<(), RulesError> {
        if self.player_range().contains(&count) {
            Ok(())
        } else {
            Err(RulesError::UnsupportedPlayerCount {
                ruleset: self.name().to_string(),
                count,
            })
        }
    }
}

/// Named collection of rulesets with a default.
#[derive(Debug, Clone)]
pub struct RulesetRegistry {
    rulesets: HashMap<String, Arc<dyn Ruleset>>,
    default: String,
}

impl RulesetRegistry {
    /// Creates a registry containing only `default`.
    pub fn new(default: Arc<dyn Ruleset>) -> Self {
        let name = default.name().to_string();
        let mut rulesets = HashMap::new();
        rulesets.insert(name.clone(), default);
        Self {
            rulesets,
            default: name,
        }
    }

    /// Registry with every built-in ruleset, defaulting to tic-tac-toe.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new(Arc::new(TicTacToe));
        registry.register(Arc::new(Countdown::default()));
        registry
    }

    pub fn register(&mut self, ruleset: Arc<dyn Ruleset>) {
        self.rulesets.insert(ruleset.name().to_string(), ruleset);
    }

    /// Changes the default. Returns `false` if no ruleset has that name.
    pub fn set_default(&mut self, name: &str) -> bool {
        if self.rulesets.contains_key(name) {
            self.default = name.to_string();
            true
        } else {
            false
        }
    }

    /// Looks up a ruleset by name, or the default when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<dyn Ruleset>> {
        self.rulesets.get(name.unwrap_or(&self.default)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rulesets.contains_key(name)
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rulesets.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for RulesetRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> Result<T, RulesError> {
    serde_json::from_value(value.clone()).map_err(|e| match what {
        "move" => RulesError::InvalidMove(format!("malformed move: {e}")),
        _ => RulesError::CorruptState(format!("{what}: {e}")),
    })
}

pub(crate) fn encode<T: serde::Serialize>(state: &T) -> Result<Value, RulesError> {
    serde_json::to_value(state).map_err(|e| RulesError::CorruptState(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_by_name_and_default() {
        let registry = RulesetRegistry::with_builtin();
        assert_eq!(registry.default_name(), "tic_tac_toe");
        assert_eq!(registry.resolve(None).unwrap().name(), "tic_tac_toe");
        assert_eq!(registry.resolve(Some("countdown")).unwrap().name(), "countdown");
        assert!(registry.resolve(Some("chess")).is_none());
        assert_eq!(registry.names(), vec!["countdown", "tic_tac_toe"]);
    }

    #[test]
    fn default_can_only_point_at_registered_rulesets() {
        let mut registry = RulesetRegistry::with_builtin();
        assert!(!registry.set_default("go"));
        assert!(registry.set_default("countdown"));
        assert_eq!(registry.resolve(None).unwrap().name(), "countdown");
    }

    #[test]
    fn player_count_is_checked_against_range() {
        let err = TicTacToe.check_player_count(3).unwrap_err();
        assert!(matches!(err, RulesError::UnsupportedPlayerCount { count: 3, .. }));
        assert!(Countdown::default().check_player_count(10).is_ok());
    }
}
