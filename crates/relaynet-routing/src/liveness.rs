//! Last-activity bookkeeping for every tracked connection.
//!
//! A connection that stays silent past the threshold is handed out by
//! [`LivenessTable::sweep`] once, and only once.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use relaynet_core::ConnectionId;

/// Last inbound activity per classified connection.
pub struct LivenessTable {
    activity: DashMap<ConnectionId, Instant>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self {
            activity: DashMap::new(),
        }
    }

    /// Start tracking `connection`, or refresh it if already tracked.
    pub fn register(&self, connection: ConnectionId) {
        self.register_at(connection, Instant::now());
    }

    pub fn register_at(&self, connection: ConnectionId, now: Instant) {
        self.activity.insert(connection, now);
    }

    /// Refresh a tracked connection. Untracked connections are ignored so
    /// unclassified sockets never enter the table through plain traffic.
    pub fn touch(&self, connection: ConnectionId) -> bool {
        match self.activity.get_mut(&connection) {
            Some(mut last) => {
                *last = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, connection: ConnectionId) -> bool {
        self.activity.remove(&connection).is_some()
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.activity.contains_key(&connection)
    }

    /// Remove and return every connection silent for longer than `threshold`.
    pub fn sweep(&self, threshold: Duration) -> Vec<ConnectionId> {
        self.sweep_at(Instant::now(), threshold)
    }

    /// Like [`sweep`](Self::sweep) relative to `now`.
    ///
    /// Each stale connection is returned by exactly one sweep, even when
    /// sweeps race.
    pub fn sweep_at(&self, now: Instant, threshold: Duration) -> Vec<ConnectionId> {
        let is_stale = |last: &Instant| now.saturating_duration_since(*last) > threshold;

        let candidates: Vec<ConnectionId> = self
            .activity
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut evicted: Vec<ConnectionId> = candidates
            .into_iter()
            .filter(|conn| self.activity.remove_if(conn, |_, last| is_stale(last)).is_some())
            .collect();
        evicted.sort();
        evicted
    }

    pub fn len(&self) -> usize {
        self.activity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activity.is_empty()
    }

    pub fn clear(&self) {
        self.activity.clear();
    }
}

impl Default for LivenessTable {
    fn default() -> Self {
        Self::new()
    }
}
