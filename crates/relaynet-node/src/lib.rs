//! Relaynet router node.
//!
//! Wires the routing tables from `relaynet-routing` to a transport from
//! `relaynet-network` and runs the housekeeping that keeps a router's view of
//! the overlay current: keepalive and liveness eviction, router-list,
//! topology and peer gossip, and dedup cache expiry.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;

#[cfg(test)]
mod mock;

pub use config::{parse_duration, RouterConfig, Timings, DEFAULT_INTERVAL};
pub use error::RouterError;
pub use handler::{ConnectionStates, ProtocolHandler};
pub use router::{RouteOutcome, Router, RouterSummary};
