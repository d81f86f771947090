//! Where each peer in the mesh can be reached.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use relaynet_core::{is_chain_prefix, PeerInfo};

#[derive(Default)]
struct Locations {
    /// `peer id -> routers serving it`. Ordered so chain prefixes are a range scan.
    by_peer: BTreeMap<String, BTreeSet<String>>,
    /// `router address -> peer ids`, the last snapshot from that router.
    by_router: HashMap<String, BTreeSet<String>>,
}

/// Maps peer ids to the router addresses currently able to deliver to them.
///
/// Built from full peer snapshots: each [`update`](Self::update) replaces
/// everything previously attributed to that router.
#[derive(Default)]
pub struct PeerLocationTable {
    inner: RwLock<Locations>,
}

impl PeerLocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the peers attributed to `router_address`.
    ///
    /// Returns `true` if the attribution changed.
    pub fn update<'a, I>(&self, router_address: &str, peers: I) -> bool
    where
        I: IntoIterator<Item = &'a PeerInfo>,
    {
        let next: BTreeSet<String> = peers.into_iter().map(|p| p.id.clone()).collect();
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let locations = &mut *guard;

        let previous = locations.by_router.remove(router_address).unwrap_or_default();
        if previous == next {
            if !next.is_empty() {
                locations.by_router.insert(router_address.to_string(), next);
            }
            return false;
        }

        for peer_id in previous.difference(&next) {
            if let Some(routers) = locations.by_peer.get_mut(peer_id) {
                routers.remove(router_address);
                if routers.is_empty() {
                    locations.by_peer.remove(peer_id);
                }
            }
        }
        for peer_id in next.difference(&previous) {
            locations
                .by_peer
                .entry(peer_id.clone())
                .or_default()
                .insert(router_address.to_string());
        }

        tracing::debug!(
            router = router_address,
            peers = next.len(),
            "peer locations updated"
        );

        if !next.is_empty() {
            locations.by_router.insert(router_address.to_string(), next);
        }
        true
    }

    /// Routers serving `destination`.
    ///
    /// A destination ending in the chain delimiter matches every peer of that
    /// chain; anything else must match a peer id exactly. An empty set means
    /// the destination is currently unreachable.
    pub fn lookup(&self, destination: &str) -> BTreeSet<String> {
        let locations = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        if is_chain_prefix(destination) {
            locations
                .by_peer
                .range(destination.to_string()..)
                .take_while(|(peer_id, _)| peer_id.starts_with(destination))
                .flat_map(|(_, routers)| routers.iter().cloned())
                .collect()
        } else {
            locations
                .by_peer
                .get(destination)
                .cloned()
                .unwrap_or_default()
        }
    }

    /// All known peer ids, sorted.
    pub fn peer_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_peer
            .keys()
            .cloned()
            .collect()
    }

    /// Number of distinct peers known.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Locations::default();
    }
}
