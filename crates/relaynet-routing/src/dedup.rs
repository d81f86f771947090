//! Suppression of repeated gossip.
//!
//! Gossip is flooded, so every router sees most sync records several times.
//! The cache remembers fingerprints for a fixed window; expiry happens only in
//! [`DedupCache::gc`], never on lookup.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relaynet_core::{Envelope, Fingerprint};

/// Default retention window for seen fingerprints.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Fingerprint to first-seen time.
pub struct DedupCache {
    seen: DashMap<Fingerprint, Instant>,
    window: Duration,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `fingerprint` and return `true` if it was not already present.
    pub fn insert(&self, fingerprint: Fingerprint) -> bool {
        self.insert_at(fingerprint, Instant::now())
    }

    /// Like [`insert`](Self::insert) with an explicit first-seen time.
    pub fn insert_at(&self, fingerprint: Fingerprint, now: Instant) -> bool {
        match self.seen.entry(fingerprint) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    /// Record the fingerprint of `envelope`; `true` means first sighting.
    pub fn observe(&self, envelope: &Envelope) -> bool {
        let fingerprint = envelope.fingerprint();
        let fresh = self.insert(fingerprint);
        if !fresh {
            tracing::trace!(%fingerprint, kind = %envelope.kind, "duplicate gossip suppressed");
        }
        fresh
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains_key(fingerprint)
    }

    /// Drop fingerprints older than the window. Returns how many were removed.
    pub fn gc(&self) -> usize {
        self.gc_at(Instant::now())
    }

    /// Like [`gc`](Self::gc) relative to `now`.
    pub fn gc_at(&self, now: Instant) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) <= window);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            tracing::trace!(removed, "dedup cache swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&self) {
        self.seen.clear();
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}
