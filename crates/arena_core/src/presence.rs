//! Presence and reconnection tracking.
//!
//! One [`ConnectionRecord`] per known player. A dropped connection starts a
//! reconnection window; [`PresenceTracker::sweep_evictions`] removes records
//! whose window has elapsed without a reconnect. Deciding what an eviction
//! means for lobbies and games is left to the caller.

use crate::clock::{secs, Clock};
use crate::types::{PlayerId, Timestamp};
use chrono::Duration;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub reconnect_window_secs: u64,
    pub eviction_sweep_interval_secs: u64,
    /// Window used by `is_active` checks that do not supply their own.
    pub activity_window_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            reconnect_window_secs: 60,
            eviction_sweep_interval_secs: 5,
            activity_window_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub player_id: PlayerId,
    pub connected: bool,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
    pub disconnected_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// First time seen, or seen again after eviction.
    New,
    /// Came back inside the reconnection window.
    Reconnected,
    /// Was already connected; only activity was refreshed.
    AlreadyConnected,
}

#[derive(Debug)]
pub struct PresenceTracker {
    records: DashMap<PlayerId, ConnectionRecord>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Marks the player connected and cancels any pending eviction.
    pub fn connect(&self, player_id: PlayerId) -> ConnectOutcome {
        let now = self.clock.now();
        let mut outcome = ConnectOutcome::New;
        self.records
            .entry(player_id)
            .and_modify(|record| {
                outcome = if record.connected {
                    ConnectOutcome::AlreadyConnected
                } else {
                    ConnectOutcome::Reconnected
                };
                record.connected = true;
                record.last_activity = now;
                record.disconnected_at = None;
            })
            .or_insert_with(|| ConnectionRecord {
                player_id,
                connected: true,
                connected_at: now,
                last_activity: now,
                disconnected_at: None,
            });
        debug!("🔗 Player {} connect: {:?}", player_id, outcome);
        outcome
    }

    /// Marks the player disconnected and opens the reconnection window.
    /// Returns `false` if the player was unknown or already disconnected.
    pub fn disconnect(&self, player_id: PlayerId) -> bool {
        let now = self.clock.now();
        match self.records.get_mut(&player_id) {
            Some(mut record) if record.connected => {
                record.connected = false;
                record.disconnected_at = Some(now);
                debug!("🔌 Player {} disconnected, window open", player_id);
                true
            }
            _ => false,
        }
    }

    /// Refreshes activity for a connected player.
    pub fn heartbeat(&self, player_id: PlayerId) -> bool {
        match self.records.get_mut(&player_id) {
            Some(mut record) if record.connected => {
                record.last_activity = self.clock.now();
                true
            }
            _ => false,
        }
    }

    /// Connected and active within `window`.
    pub fn is_active(&self, player_id: PlayerId, window: Duration) -> bool {
        let now = self.clock.now();
        self.records
            .get(&player_id)
            .is_some_and(|r| r.connected && now - r.last_activity <= window)
    }

    /// [`Self::is_active`] with the configured activity window.
    pub fn is_recently_active(&self, player_id: PlayerId) -> bool {
        self.is_active(player_id, secs(self.config.activity_window_secs))
    }

    pub fn is_connected(&self, player_id: PlayerId) -> bool {
        self.records.get(&player_id).is_some_and(|r| r.connected)
    }

    pub fn record(&self, player_id: PlayerId) -> Option<ConnectionRecord> {
        self.records.get(&player_id).map(|r| r.clone())
    }

    pub fn connected_players(&self) -> Vec<PlayerId> {
        self.records
            .iter()
            .filter(|r| r.connected)
            .map(|r| r.player_id)
            .collect()
    }

    /// Removes every record whose reconnection window has elapsed and
    /// returns the evicted players.
    pub fn sweep_evictions(&self) -> Vec<PlayerId> {
        let now = self.clock.now();
        let window = secs(self.config.reconnect_window_secs);
        let due = |record: &ConnectionRecord| {
            !record.connected && record.disconnected_at.is_some_and(|at| at + window <= now)
        };

        let candidates: Vec<PlayerId> = self
            .records
            .iter()
            .filter(|r| due(r.value()))
            .map(|r| *r.key())
            .collect();

        let evicted: Vec<PlayerId> = candidates
            .into_iter()
            .filter(|id| self.records.remove_if(id, |_, r| due(r)).is_some())
            .collect();

        if !evicted.is_empty() {
            info!("🧹 Evicted {} player(s) after reconnection window", evicted.len());
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker() -> (PresenceTracker, ManualClock) {
        let clock = ManualClock::starting_now();
        (
            PresenceTracker::new(PresenceConfig::default(), Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn reconnecting_inside_window_cancels_eviction() {
        let (presence, clock) = tracker();
        let player = PlayerId::new();

        assert_eq!(presence.connect(player), ConnectOutcome::New);
        assert!(presence.disconnect(player));
        clock.advance_secs(30);
        assert_eq!(presence.connect(player), ConnectOutcome::Reconnected);

        clock.advance_secs(60);
        assert!(presence.sweep_evictions().is_empty());
        assert!(presence.is_connected(player));
    }

    #[test]
    fn absent_players_are_evicted_after_window() {
        let (presence, clock) = tracker();
        let player = PlayerId::new();
        presence.connect(player);
        presence.disconnect(player);

        clock.advance_secs(59);
        assert!(presence.sweep_evictions().is_empty());
        clock.advance_secs(1);
        assert_eq!(presence.sweep_evictions(), vec![player]);
        assert!(presence.record(player).is_none());
        assert_eq!(presence.connect(player), ConnectOutcome::New);
    }

    #[test]
    fn heartbeats_keep_a_player_active() {
        let (presence, clock) = tracker();
        let player = PlayerId::new();
        presence.connect(player);

        clock.advance_secs(90);
        assert!(!presence.is_active(player, Duration::seconds(60)));
        assert!(presence.heartbeat(player));
        assert!(presence.is_active(player, Duration::seconds(60)));

        presence.disconnect(player);
        assert!(!presence.heartbeat(player));
        assert!(!presence.is_recently_active(player));
    }

    #[test]
    fn double_disconnect_is_ignored() {
        let (presence, _clock) = tracker();
        let player = PlayerId::new();
        assert!(!presence.disconnect(player));
        presence.connect(player);
        assert!(presence.disconnect(player));
        assert!(!presence.disconnect(player));
        assert_eq!(presence.connect(player), ConnectOutcome::Reconnected);
        assert_eq!(presence.connect(player), ConnectOutcome::AlreadyConnected);
    }
}
