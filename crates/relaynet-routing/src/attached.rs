//! Peers attached to this router and the connections they use.

use dashmap::DashMap;
use relaynet_core::{ConnectionId, PeerInfo};

/// Peers attached directly to this router, keyed by peer id.
pub struct AttachedPeers {
    peers: DashMap<String, ConnectionId>,
}

impl AttachedPeers {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Attach `peer` over `connection`. Returns the connection it replaced.
    pub fn attach(&self, peer: &PeerInfo, connection: ConnectionId) -> Option<ConnectionId> {
        self.peers
            .insert(peer.id.clone(), connection)
            .filter(|old| *old != connection)
    }

    /// Detach every peer served over `connection`.
    pub fn detach_connection(&self, connection: ConnectionId) -> Vec<PeerInfo> {
        let ids: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| *entry.value() == connection)
            .map(|entry| entry.key().clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.peers.remove_if(&id, |_, conn| *conn == connection))
            .map(|(id, _)| PeerInfo { id })
            .collect()
    }

    /// Whether `connection` serves at least one attached peer.
    pub fn serves(&self, connection: ConnectionId) -> bool {
        self.peers.iter().any(|entry| *entry.value() == connection)
    }

    /// Attached peers addressed by `destination` (exact id or chain prefix).
    pub fn matching(&self, destination: &str) -> Vec<(PeerInfo, ConnectionId)> {
        let mut matches: Vec<(PeerInfo, ConnectionId)> = self
            .peers
            .iter()
            .map(|entry| (PeerInfo { id: entry.key().clone() }, *entry.value()))
            .filter(|(peer, _)| peer.matches(destination))
            .collect();
        matches.sort();
        matches
    }

    /// All attached peers, sorted by id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|entry| PeerInfo { id: entry.key().clone() })
            .collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}

impl Default for AttachedPeers {
    fn default() -> Self {
        Self::new()
    }
}
