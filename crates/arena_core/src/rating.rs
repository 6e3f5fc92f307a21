//! Elo rating arithmetic.
//!
//! Pure functions only. Both sides of a two-player result are computed
//! against the opponent's pre-game rating, so with a common K-factor the
//! winner's gain is exactly the loser's loss.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// K-factor applied to games that reach a natural conclusion.
pub const DEFAULT_K_FACTOR: f64 = 32.0;

/// K-factor applied to forfeits, where the outcome says less about skill.
pub const FORFEIT_K_FACTOR: f64 = 16.0;

/// Ratings a client may claim when joining the queue.
pub const RATING_BOUNDS: RangeInclusive<i32> = 0..=5000;

/// Absolute distance between two ratings. Never overflows.
pub fn rating_gap(a: i32, b: i32) -> u32 {
    a.abs_diff(b)
}

/// Result of a game from one player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameResult {
    Win,
    Loss,
    Draw,
}

impl GameResult {
    /// Actual score fed into the Elo update.
    pub fn score(self) -> f64 {
        match self {
            GameResult::Win => 1.0,
            GameResult::Loss => 0.0,
            GameResult::Draw => 0.5,
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            GameResult::Win => GameResult::Loss,
            GameResult::Loss => GameResult::Win,
            GameResult::Draw => GameResult::Draw,
        }
    }
}

/// Probability that a player rated `rating` beats one rated `opponent`.
pub fn expected_score(rating: i32, opponent: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf((f64::from(opponent) - f64::from(rating)) / 400.0))
}

/// Rating change for one side of a game.
pub fn rating_delta(rating: i32, opponent: i32, actual_score: f64, k_factor: f64) -> i32 {
    (k_factor * (actual_score - expected_score(rating, opponent))).round() as i32
}

/// Deltas for both sides of a two-player game, in the order given.
///
/// The second side's formula, `K * ((1 - s) - (1 - e))`, is algebraically the
/// negation of the first. Negating the rounded value keeps the two exactly
/// opposite where floating point might otherwise round them apart.
pub fn pair_deltas(first: i32, second: i32, first_result: GameResult, k_factor: f64) -> (i32, i32) {
    let first_delta = rating_delta(first, second, first_result.score(), k_factor);
    (first_delta, -first_delta)
}
