//! Shard state tracking
//!
//! Status table shared between the shard manager, the session layer and the
//! health endpoints.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle status for a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardHealth {
    /// Waiting in the manager's pending queue
    Queued,
    /// Session being constructed by the scheduling worker
    Building,
    /// Waiting for admission or performing the handshake
    Connecting,
    /// Shard is ready and receiving events
    Ready,
    /// Shard is resuming after disconnect
    Resuming,
    /// Shard is disconnected and will reconnect
    Disconnected,
    /// Session construction or the connection failed fatally
    Dead,
    /// Session disposed
    Shutdown,
}

impl ShardHealth {
    /// Returns true if the shard is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, ShardHealth::Ready | ShardHealth::Resuming)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardHealth::Ready)
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub health: ShardHealth,
    pub guilds: u64,
    pub events_received: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_heartbeat: Option<Instant>,
    pub connected_at: Option<Instant>,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            health: ShardHealth::Queued,
            guilds: 0,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat: None,
            connected_at: None,
        }
    }
}

/// Point-in-time view of one shard
#[derive(Debug, Clone, Serialize)]
pub struct ShardSnapshot {
    pub shard_id: u32,
    pub health: ShardHealth,
    pub guilds: u64,
    pub events_received: u64,
    pub reconnects: u64,
}

/// Shared state across all shards of a manager
#[derive(Debug, Clone, Default)]
pub struct ShardState {
    inner: Arc<DashMap<u32, ShardStateEntry>>,
}

impl ShardState {
    /// Create an empty shard state tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Update shard health, registering the shard if unknown
    pub fn set_health(&self, shard_id: u32, health: ShardHealth) {
        let mut entry = self.inner.entry(shard_id).or_default();
        entry.health = health;
        match health {
            ShardHealth::Ready if entry.connected_at.is_none() => {
                entry.connected_at = Some(Instant::now());
            }
            ShardHealth::Disconnected | ShardHealth::Shutdown | ShardHealth::Dead => {
                entry.connected_at = None;
            }
            _ => {}
        }
    }

    /// Set `to` only if the shard is currently `from`
    pub fn transition(&self, shard_id: u32, from: ShardHealth, to: ShardHealth) -> bool {
        match self.inner.get_mut(&shard_id) {
            Some(mut entry) if entry.health == from => {
                entry.health = to;
                true
            }
            _ => false,
        }
    }

    /// Update shard guild count
    pub fn set_guilds(&self, shard_id: u32, count: u64) {
        if let Some(mut entry) = self.inner.get_mut(&shard_id) {
            entry.guilds = count;
        }
    }

    /// Add or remove guilds from a shard's count
    pub fn adjust_guilds(&self, shard_id: u32, delta: i64) {
        if let Some(mut entry) = self.inner.get_mut(&shard_id) {
            entry.guilds = entry.guilds.saturating_add_signed(delta);
        }
    }

    /// Increment event received counter
    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.inner.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Increment reconnect counter
    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record heartbeat
    pub fn record_heartbeat(&self, shard_id: u32) {
        if let Some(mut entry) = self.inner.get_mut(&shard_id) {
            entry.last_heartbeat = Some(Instant::now());
        }
    }

    /// Get health for a specific shard
    pub fn get_health(&self, shard_id: u32) -> Option<ShardHealth> {
        self.inner.get(&shard_id).map(|e| e.health)
    }

    /// Get total guilds across all shards
    pub fn total_guilds(&self) -> u64 {
        self.inner.iter().map(|e| e.guilds).sum()
    }

    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.inner.iter().filter(|e| e.health.is_ready()).count()
    }

    /// Get count of healthy shards (ready or resuming)
    pub fn healthy_shards(&self) -> usize {
        self.inner.iter().filter(|e| e.health.is_healthy()).count()
    }

    /// Get count of tracked shards
    pub fn shard_count(&self) -> usize {
        self.inner.len()
    }

    /// Check if at least one shard is ready
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// All tracked shards in ascending id order
    pub fn snapshot(&self) -> Vec<ShardSnapshot> {
        let mut shards: Vec<_> = self
            .inner
            .iter()
            .map(|e| ShardSnapshot {
                shard_id: *e.key(),
                health: e.health,
                guilds: e.guilds,
                events_received: e.events_received.load(Ordering::Relaxed),
                reconnects: e.reconnects.load(Ordering::Relaxed),
            })
            .collect();
        shards.sort_by_key(|s| s.shard_id);
        shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_transitions_track_connection_time() {
        let state = ShardState::new();
        state.set_health(2, ShardHealth::Connecting);
        assert_eq!(state.get_health(2), Some(ShardHealth::Connecting));
        assert!(!state.is_ready());

        state.set_health(2, ShardHealth::Ready);
        assert!(state.is_ready());
        assert!(state.inner.get(&2).unwrap().connected_at.is_some());

        state.set_health(2, ShardHealth::Disconnected);
        assert!(state.inner.get(&2).unwrap().connected_at.is_none());
        assert_eq!(state.healthy_shards(), 0);
    }

    #[test]
    fn resuming_shard_is_healthy_but_not_ready() {
        let state = ShardState::new();
        state.set_health(0, ShardHealth::Ready);
        state.set_health(1, ShardHealth::Resuming);
        state.set_health(2, ShardHealth::Connecting);

        assert_eq!(state.ready_shards(), 1);
        assert_eq!(state.healthy_shards(), 2);
        assert!(!ShardHealth::Resuming.is_ready());
    }

    #[test]
    fn unknown_shard_counters_are_ignored() {
        let state = ShardState::new();
        state.record_event(9);
        state.set_guilds(9, 10);
        assert_eq!(state.get_health(9), None);
        assert_eq!(state.shard_count(), 0);
    }

    #[test]
    fn snapshot_is_sorted() {
        let state = ShardState::new();
        for id in [3, 0, 2] {
            state.set_health(id, ShardHealth::Ready);
            state.record_event(id);
        }
        state.set_guilds(0, 5);
        let ids: Vec<_> = state.snapshot().iter().map(|s| s.shard_id).collect();
        assert_eq!(ids, vec![0, 2, 3]);
        assert_eq!(state.total_guilds(), 5);
        assert_eq!(state.snapshot()[1].events_received, 1);
    }

    #[test]
    fn transition_only_applies_from_expected_state() {
        let state = ShardState::new();
        assert!(!state.transition(1, ShardHealth::Building, ShardHealth::Connecting));

        state.set_health(1, ShardHealth::Building);
        assert!(state.transition(1, ShardHealth::Building, ShardHealth::Connecting));
        assert!(!state.transition(1, ShardHealth::Building, ShardHealth::Connecting));
        assert_eq!(state.get_health(1), Some(ShardHealth::Connecting));
    }

    #[test]
    fn guild_adjustments_saturate() {
        let state = ShardState::new();
        state.set_health(0, ShardHealth::Ready);
        state.adjust_guilds(0, 2);
        state.adjust_guilds(0, -5);
        assert_eq!(state.total_guilds(), 0);
        state.adjust_guilds(0, 1);
        assert_eq!(state.total_guilds(), 1);
    }

    #[test]
    fn health_serializes_snake_case() {
        let json = serde_json::to_string(&ShardHealth::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
    }
}
