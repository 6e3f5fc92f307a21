//! # Matchmaking Queue
//!
//! Players waiting for an opponent, paired by rating proximity under a window
//! that widens the longer they wait.
//!
//! - `enqueue` inserts and immediately tries to pair the newcomer.
//! - `sweep` walks the queue oldest-first and pairs whoever it can.
//! - `expand` recomputes every entry's range multiplier from its wait time.
//!
//! A player may claim a rating when joining. The claim only places them in
//! the queue; the game is always seated with the rating loaded from storage.
//!
//! Pairing happens inside a single critical section. Creating the game for a
//! pair happens after the lock is released; if that fails both players go
//! back into the queue at their original position, unless they left in the
//! meantime.

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::game::{GameError, GameSessionManager};
use crate::rating::{expected_score, rating_gap, RATING_BOUNDS};
use crate::types::{GameId, Player, PlayerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Widest rating gap accepted at multiplier 1.0.
    pub base_range: f64,
    /// Multiplier growth per minute of waiting.
    pub expansion_rate: f64,
    pub sweep_interval_secs: u64,
    pub expand_interval_secs: u64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            base_range: 200.0,
            expansion_rate: 0.2,
            sweep_interval_secs: 5,
            expand_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPreferences {
    /// Ruleset to play. Players only pair with others asking for the same one.
    #[serde(default)]
    pub ruleset: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitingEntry {
    pub player: Player,
    /// Rating the window is centred on. Defaults to the stored rating.
    pub match_rating: i32,
    pub joined_at: Timestamp,
    pub range_multiplier: f64,
    pub preferences: MatchPreferences,
    #[serde(skip)]
    seq: u64,
}

impl WaitingEntry {
    fn window(&self, base_range: f64) -> f64 {
        base_range * self.range_multiplier
    }

    fn wants_same_game(&self, other: &WaitingEntry) -> bool {
        self.preferences.ruleset == other.preferences.ruleset
    }

    fn order_key(&self) -> (Timestamp, u64) {
        (self.joined_at, self.seq)
    }
}

/// A pair taken off the queue and seated in a new game.
#[derive(Debug, Clone, Serialize)]
pub struct MatchFound {
    pub game_id: GameId,
    pub players: Vec<PlayerId>,
    /// Distance between the ratings the pair was matched on.
    pub rating_gap: u32,
    /// Expected score of the first player against the second, from their
    /// seated ratings.
    pub expected_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued { position: usize },
    Matched(MatchFound),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub matches_made: u64,
    pub longest_wait_secs: i64,
    /// 1-based position of the asking player, when queued.
    pub position: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("player {0} is already queued")]
    AlreadyQueued(PlayerId),

    #[error("unknown ruleset '{0}'")]
    UnknownRuleset(String),

    #[error("rating {0} is outside the accepted range")]
    RatingOutOfRange(i32),

    #[error(transparent)]
    Game(#[from] GameError),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::AlreadyQueued(_) => ErrorKind::Conflict,
            QueueError::UnknownRuleset(_) => ErrorKind::NotFound,
            QueueError::RatingOutOfRange(_) => ErrorKind::InvalidState,
            QueueError::Game(e) => e.kind(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueTable {
    /// Kept in `(joined_at, seq)` order.
    entries: Vec<WaitingEntry>,
    /// Players taken off the queue whose game is still being created.
    launching: HashSet<PlayerId>,
    /// Launching players who asked to leave. They are not put back if the
    /// game cannot be created.
    cancelled: HashSet<PlayerId>,
    next_seq: u64,
    matches_made: u64,
}

impl QueueTable {
    fn position(&self, player_id: PlayerId) -> Option<usize> {
        self.entries.iter().position(|e| e.player.id == player_id)
    }

    fn is_waiting(&self, player_id: PlayerId) -> bool {
        self.position(player_id).is_some()
            || (self.launching.contains(&player_id) && !self.cancelled.contains(&player_id))
    }

    fn settle_launch(&mut self, players: [PlayerId; 2]) {
        for id in players {
            self.launching.remove(&id);
            self.cancelled.remove(&id);
        }
    }

    fn insert_ordered(&mut self, entry: WaitingEntry) {
        let at = self
            .entries
            .partition_point(|e| e.order_key() <= entry.order_key());
        self.entries.insert(at, entry);
    }

    /// Finds the closest-rated compatible opponent for the entry at `index`
    /// within its window. Ties go to the earliest joined.
    fn best_opponent(&self, index: usize, base_range: f64) -> Option<usize> {
        let entry = &self.entries[index];
        let window = entry.window(base_range);
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, other)| *i != index && entry.wants_same_game(other))
            .map(|(i, other)| (i, rating_gap(entry.match_rating, other.match_rating)))
            .filter(|(_, gap)| f64::from(*gap) <= window)
            .min_by_key(|(i, gap)| (*gap, self.entries[*i].order_key()))
            .map(|(i, _)| i)
    }

    /// Removes the entry for `player_id` and its best opponent, oldest first.
    fn take_pair(&mut self, player_id: PlayerId, base_range: f64) -> Option<(WaitingEntry, WaitingEntry)> {
        let index = self.position(player_id)?;
        let opponent = self.best_opponent(index, base_range)?;
        let (low, high) = if index < opponent {
            (index, opponent)
        } else {
            (opponent, index)
        };
        let later = self.entries.remove(high);
        let earlier = self.entries.remove(low);
        self.launching.insert(earlier.player.id);
        self.launching.insert(later.player.id);
        self.matches_made += 1;
        Some((earlier, later))
    }
}

pub struct MatchmakingQueue {
    table: Mutex<QueueTable>,
    games: Arc<GameSessionManager>,
    clock: Arc<dyn Clock>,
    config: MatchmakingConfig,
}

impl fmt::Debug for MatchmakingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchmakingQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MatchmakingQueue {
    pub fn new(config: MatchmakingConfig, games: Arc<GameSessionManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(QueueTable::default()),
            games,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    /// Adds a player and tries to pair them straight away.
    pub async fn enqueue(
        &self,
        player: Player,
        preferences: MatchPreferences,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.enqueue_claiming(player, None, preferences).await
    }

    /// Like [`enqueue`](Self::enqueue), but matches on `claimed` instead of
    /// the player's stored rating. The claim must lie in [`RATING_BOUNDS`].
    pub async fn enqueue_claiming(
        &self,
        player: Player,
        claimed: Option<i32>,
        mut preferences: MatchPreferences,
    ) -> Result<EnqueueOutcome, QueueError> {
        if let Some(rating) = claimed {
            if !RATING_BOUNDS.contains(&rating) {
                return Err(QueueError::RatingOutOfRange(rating));
            }
        }
        let match_rating = claimed.unwrap_or(player.rating);
        let ruleset = preferences
            .ruleset
            .take()
            .unwrap_or_else(|| self.games.config().default_ruleset.clone());
        if !self.games.has_ruleset(&ruleset) {
            return Err(QueueError::UnknownRuleset(ruleset));
        }
        preferences.ruleset = Some(ruleset);

        let player_id = player.id;
        let pair = {
            let mut table = self.table.lock().await;
            if table.is_waiting(player_id) {
                return Err(QueueError::AlreadyQueued(player_id));
            }
            let seq = table.next_seq;
            table.next_seq += 1;
            table.insert_ordered(WaitingEntry {
                player,
                match_rating,
                joined_at: self.clock.now(),
                range_multiplier: 1.0,
                preferences,
                seq,
            });
            debug!("⏳ Player {} queued ({} waiting)", player_id, table.entries.len());

            match table.take_pair(player_id, self.config.base_range) {
                Some(pair) => pair,
                None => {
                    let position = table.position(player_id).map_or(0, |p| p + 1);
                    return Ok(EnqueueOutcome::Queued { position });
                }
            }
        };

        let found = self.launch(pair).await?;
        Ok(EnqueueOutcome::Matched(found))
    }

    /// Removes a player if queued. Returns whether anything was removed.
    ///
    /// A player whose game is being created counts as queued. If that game
    /// then fails to start they are not put back.
    pub async fn dequeue(&self, player_id: PlayerId) -> bool {
        let mut table = self.table.lock().await;
        if let Some(index) = table.position(player_id) {
            table.entries.remove(index);
            debug!("🚶 Player {} left the queue", player_id);
            return true;
        }
        if table.launching.contains(&player_id) {
            debug!("🚶 Player {} left the queue mid-launch", player_id);
            return table.cancelled.insert(player_id);
        }
        false
    }

    /// Tries to pair every waiting player, oldest first.
    pub async fn sweep(&self) -> Vec<MatchFound> {
        let pairs = {
            let mut table = self.table.lock().await;
            let order: Vec<PlayerId> = table.entries.iter().map(|e| e.player.id).collect();
            let mut pairs = Vec::new();
            for player_id in order {
                if let Some(pair) = table.take_pair(player_id, self.config.base_range) {
                    pairs.push(pair);
                }
            }
            pairs
        };

        let mut found = Vec::new();
        for pair in pairs {
            match self.launch(pair).await {
                Ok(m) => found.push(m),
                Err(e) => warn!("⚠️ Could not start matched game: {}", e),
            }
        }
        found
    }

    /// Widens each entry's window according to how long it has waited.
    /// Multipliers never shrink.
    pub async fn expand(&self) {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        for entry in table.entries.iter_mut() {
            let waited = (now - entry.joined_at).num_milliseconds() as f64 / 1000.0;
            let computed = 1.0 + (waited / 60.0) * self.config.expansion_rate;
            entry.range_multiplier = entry.range_multiplier.max(computed);
        }
    }

    pub async fn contains(&self, player_id: PlayerId) -> bool {
        self.table.lock().await.position(player_id).is_some()
    }

    pub async fn entries(&self) -> Vec<WaitingEntry> {
        self.table.lock().await.entries.clone()
    }

    pub async fn status(&self, player_id: Option<PlayerId>) -> QueueStats {
        let now = self.clock.now();
        let table = self.table.lock().await;
        QueueStats {
            waiting: table.entries.len(),
            matches_made: table.matches_made,
            longest_wait_secs: table
                .entries
                .first()
                .map_or(0, |e| (now - e.joined_at).num_seconds()),
            position: player_id.and_then(|id| table.position(id)).map(|p| p + 1),
        }
    }

    async fn launch(&self, (first, second): (WaitingEntry, WaitingEntry)) -> Result<MatchFound, QueueError> {
        let ruleset = first.preferences.ruleset.clone();
        let players = vec![first.player.clone(), second.player.clone()];
        let ids = [first.player.id, second.player.id];

        let created = self.games.create(players, ruleset.as_deref(), None).await;
        match created {
            Ok(game) => {
                self.table.lock().await.settle_launch(ids);
                let found = MatchFound {
                    game_id: game.id,
                    players: ids.to_vec(),
                    rating_gap: rating_gap(first.match_rating, second.match_rating),
                    expected_score: expected_score(first.player.rating, second.player.rating),
                };
                info!(
                    "🤝 Matched {} and {} (gap {}) into game {}",
                    first.player.id, second.player.id, found.rating_gap, game.id
                );
                Ok(found)
            }
            Err(e) => {
                let mut table = self.table.lock().await;
                table.matches_made = table.matches_made.saturating_sub(1);
                for entry in [first, second] {
                    let id = entry.player.id;
                    if table.cancelled.contains(&id) {
                        debug!("🚶 Player {} not requeued after leaving", id);
                    } else if table.position(id).is_none() {
                        table.insert_ordered(entry);
                    }
                }
                table.settle_launch(ids);
                Err(e.into())
            }
        }
    }
}
