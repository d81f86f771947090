//! Relaynet Routing: the router's bookkeeping tables.
//!
//! This crate provides:
//! - [`Topology`]: gossiped router adjacency and the BFS next-hop table.
//! - [`PeerLocationTable`]: which routers serve which peers, with chain-prefix lookup.
//! - [`RouterTable`]: directly connected routers, one connection per address.
//! - [`AttachedPeers`]: peers attached to this router.
//! - [`DedupCache`]: windowed suppression of repeated gossip.
//! - [`LivenessTable`]: last activity per connection, swept for eviction.
//!
//! Every table guards its own state; none of them calls into another.

pub mod attached;
pub mod dedup;
pub mod error;
pub mod liveness;
pub mod peers;
pub mod router_table;
pub mod topology;

// Re-exports for convenience.
pub use attached::AttachedPeers;
pub use dedup::{DedupCache, DEFAULT_DEDUP_WINDOW};
pub use error::RoutingError;
pub use liveness::LivenessTable;
pub use peers::PeerLocationTable;
pub use router_table::{RouterEntry, RouterTable};
pub use topology::{NextHopTable, Topology};
