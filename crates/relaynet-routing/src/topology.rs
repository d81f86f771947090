//! Router adjacency and next-hop computation.
//!
//! Every router floods its own neighbor set. [`Topology`] keeps the most
//! recent set per source router and derives the next-hop table by a
//! breadth-first search rooted at the local router.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;

use crate::error::RoutingError;

/// `destination address -> next hop address`.
pub type NextHopTable = HashMap<String, String>;

/// Gossiped router adjacency plus the derived next-hop table.
pub struct Topology {
    local_address: String,
    /// `source address -> neighbor addresses`, as last reported by the source.
    adjacency: DashMap<String, BTreeSet<String>>,
    /// Published as a whole so readers never see a half-built table.
    next_hops: RwLock<Arc<NextHopTable>>,
    recomputations: AtomicU64,
}

impl Topology {
    /// Create an empty topology rooted at `local_address`.
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            adjacency: DashMap::new(),
            next_hops: RwLock::new(Arc::new(NextHopTable::new())),
            recomputations: AtomicU64::new(0),
        }
    }

    /// Replace the neighbor set attributed to `source`.
    ///
    /// Returns `true` only when the stored adjacency actually changed. An
    /// empty neighbor set removes the source.
    pub fn update_topology<I, S>(&self, source: &str, neighbors: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let neighbors: BTreeSet<String> = neighbors
            .into_iter()
            .map(Into::into)
            .filter(|n| n != source)
            .collect();

        if neighbors.is_empty() {
            return self.adjacency.remove(source).is_some();
        }

        match self.adjacency.get_mut(source) {
            Some(mut existing) => {
                if *existing == neighbors {
                    return false;
                }
                *existing = neighbors;
            }
            None => {
                self.adjacency.insert(source.to_string(), neighbors);
            }
        }

        tracing::debug!(source, "topology changed");
        true
    }

    /// Rebuild the next-hop table from the current adjacency.
    ///
    /// Unweighted shortest paths from the local address. Neighbor sets are
    /// visited in sorted order, so ties always resolve to the same first hop
    /// within one computation.
    pub fn recompute_next_hop(&self) {
        let adjacency: HashMap<String, BTreeSet<String>> = self
            .adjacency
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut table = NextHopTable::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, &str)> = VecDeque::new();
        visited.insert(self.local_address.as_str());

        if let Some(neighbors) = adjacency.get(&self.local_address) {
            for neighbor in neighbors {
                if visited.insert(neighbor.as_str()) {
                    queue.push_back((neighbor.as_str(), neighbor.as_str()));
                }
            }
        }

        while let Some((node, first_hop)) = queue.pop_front() {
            table.insert(node.to_string(), first_hop.to_string());
            if let Some(neighbors) = adjacency.get(node) {
                for neighbor in neighbors {
                    if visited.insert(neighbor.as_str()) {
                        queue.push_back((neighbor.as_str(), first_hop));
                    }
                }
            }
        }

        let reachable = table.len();
        *self.next_hops.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        self.recomputations.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            local = %self.local_address,
            reachable,
            "next-hop table recomputed"
        );
    }

    /// Apply a gossiped neighbor set and recompute next hops if it changed.
    pub fn update_and_recompute<I, S>(&self, source: &str, neighbors: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let changed = self.update_topology(source, neighbors);
        if changed {
            self.recompute_next_hop();
        }
        changed
    }

    /// The adjacent router to forward to for `destination`.
    pub fn next_hop(&self, destination: &str) -> Result<String, RoutingError> {
        let no_route = || RoutingError::NoRoute {
            from: self.local_address.clone(),
            to: destination.to_string(),
        };
        if destination == self.local_address {
            return Err(no_route());
        }
        self.next_hops
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .cloned()
            .ok_or_else(no_route)
    }

    /// Snapshot of the current next-hop table.
    pub fn next_hops(&self) -> Arc<NextHopTable> {
        Arc::clone(&self.next_hops.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Neighbors last reported by `node`.
    pub fn neighbors_of(&self, node: &str) -> Option<BTreeSet<String>> {
        self.adjacency.get(node).map(|n| n.value().clone())
    }

    /// All source routers with a reported neighbor set, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.adjacency.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// How many times the next-hop table has been rebuilt.
    pub fn recompute_count(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }

    /// Forget all adjacency and routes.
    pub fn clear(&self) {
        self.adjacency.clear();
        *self.next_hops.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(NextHopTable::new());
    }
}
