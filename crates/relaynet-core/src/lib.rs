//! Relaynet core types shared by the routing, network and node crates.

pub mod error;
pub mod message;
pub mod state_machine;
pub mod types;

pub use error::CoreError;
pub use message::{
    ApplicationEnvelope, Envelope, Fingerprint, Hello, MessageKind, PeerSnapshot, RouterList,
    RoutingTrail, TopologySnapshot,
};
pub use state_machine::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
pub use types::{
    address_port, is_chain_prefix, ConnectionId, PeerInfo, RouterInfo, CHAIN_DELIMITER,
};
