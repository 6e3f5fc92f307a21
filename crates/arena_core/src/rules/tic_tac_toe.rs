//! Classic three-in-a-row on a 3x3 board.
//!
//! State: `{"players": [x, o], "board": [null | player_id; 9]}`.
//! Move: `{"cell": 0..=8}`, numbered row-major from the top left.

use super::{decode, encode, Outcome, Ruleset, RulesError};
use crate::types::PlayerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::RangeInclusive;

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Debug, Clone, Copy, Default)]
pub struct TicTacToe;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Board {
    players: Vec<PlayerId>,
    board: Vec<Option<PlayerId>>,
}

#[derive(Debug, Deserialize)]
struct Placement {
    cell: usize,
}

impl Board {
    fn winner(&self) -> Option<PlayerId> {
        LINES.iter().find_map(|[a, b, c]| match (self.board[*a], self.board[*b], self.board[*c]) {
            (Some(x), Some(y), Some(z)) if x == y && y == z => Some(x),
            _ => None,
        })
    }

    fn is_full(&self) -> bool {
        self.board.iter().all(Option::is_some)
    }
}

fn load(state: &Value) -> Result<Board, RulesError> {
    let board: Board = decode(state, "tic_tac_toe state")?;
    if board.board.len() != 9 {
        return Err(RulesError::CorruptState(format!(
            "board has {} cells",
            board.board.len()
        )));
    }
    Ok(board)
}

impl Ruleset for TicTacToe {
    fn name(&self) -> &'static str {
        "tic_tac_toe"
    }

    fn player_range(&self) -> RangeInclusive<usize> {
        2..=2
    }

    fn initial_state(&self, players: &[PlayerId]) -> Result<Value, RulesError> {
        self.check_player_count(players.len())?;
        encode(&Board {
            players: players.to_vec(),
            board: vec![None; 9],
        })
    }

    fn validate(&self, state: &Value, player: PlayerId, mv: &Value) -> Result<(), RulesError> {
        let board = load(state)?;
        let Placement { cell } = decode(mv, "move")?;
        if !board.players.contains(&player) {
            return Err(RulesError::InvalidMove("player is not seated".to_string()));
        }
        if board.winner().is_some() || board.is_full() {
            return Err(RulesError::InvalidMove("the board is finished".to_string()));
        }
        match board.board.get(cell) {
            None => Err(RulesError::InvalidMove(format!("cell {cell} is off the board"))),
            Some(Some(_)) => Err(RulesError::InvalidMove(format!("cell {cell} is taken"))),
            Some(None) => Ok(()),
        }
    }

    fn apply(&self, state: &Value, player: PlayerId, mv: &Value) -> Result<Value, RulesError> {
        let mut board = load(state)?;
        let Placement { cell } = decode(mv, "move")?;
        let slot = board
            .board
            .get_mut(cell)
            .ok_or_else(|| RulesError::InvalidMove(format!("cell {cell} is off the board")))?;
        *slot = Some(player);
        encode(&board)
    }

    fn evaluate(&self, state: &Value) -> Outcome {
        let Ok(board) = load(state) else {
            return Outcome::Ongoing;
        };
        match board.winner() {
            Some(winner) => Outcome::Winner(winner),
            None if board.is_full() => Outcome::Draw,
            None => Outcome::Ongoing,
        }
    }
}
