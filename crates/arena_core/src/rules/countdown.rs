//! Countdown: players take turns removing counters from a shared pile.
//! Whoever takes the last counter wins. Works for any table size.
//!
//! State: `{"players": [..], "remaining": n, "max_take": k, "last_taker": id?}`.
//! Move: `{"take": 1..=k}`.

use super::{decode, encode, Outcome, Ruleset, RulesError};
use crate::types::PlayerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    pub starting_pile: u32,
    pub max_take: u32,
}

impl Default for Countdown {
    fn default() -> Self {
        Self {
            starting_pile: 21,
            max_take: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pile {
    players: Vec<PlayerId>,
    remaining: u32,
    max_take: u32,
    last_taker: Option<PlayerId>,
}

#[derive(Debug, Deserialize)]
struct Take {
    take: u32,
}

impl Ruleset for Countdown {
    fn name(&self) -> &'static str {
        "countdown"
    }

    fn player_range(&self) -> RangeInclusive<usize> {
        2..=10
    }

    fn initial_state(&self, players: &[PlayerId]) -> Result<Value, RulesError> {
        self.check_player_count(players.len())?;
        encode(&Pile {
            players: players.to_vec(),
            remaining: self.starting_pile,
            max_take: self.max_take,
            last_taker: None,
        })
    }

    fn validate(&self, state: &Value, player: PlayerId, mv: &Value) -> Result<(), RulesError> {
        let pile: Pile = decode(state, "countdown state")?;
        let Take { take } = decode(mv, "move")?;
        if !pile.players.contains(&player) {
            return Err(RulesError::InvalidMove("player is not seated".to_string()));
        }
        if take == 0 || take > pile.max_take {
            return Err(RulesError::InvalidMove(format!(
                "must take between 1 and {}",
                pile.max_take
            )));
        }
        if take > pile.remaining {
            return Err(RulesError::InvalidMove(format!(
                "only {} counters remain",
                pile.remaining
            )));
        }
        Ok(())
    }

    fn apply(&self, state: &Value, player: PlayerId, mv: &Value) -> Result<Value, RulesError> {
        let mut pile: Pile = decode(state, "countdown state")?;
        let Take { take } = decode(mv, "move")?;
        pile.remaining = pile.remaining.saturating_sub(take);
        pile.last_taker = Some(player);
        encode(&pile)
    }

    fn evaluate(&self, state: &Value) -> Outcome {
        match decode::<Pile>(state, "countdown state") {
            Ok(Pile {
                remaining: 0,
                last_taker: Some(winner),
                ..
            }) => Outcome::Winner(winner),
            _ => Outcome::Ongoing,
        }
    }
}
