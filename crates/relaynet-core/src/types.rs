use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Separator between the chain id and the node id of a peer id.
pub const CHAIN_DELIMITER: char = ':';

/// Opaque handle for a transport connection.
///
/// Handles are allocated by the transport and never reused within one
/// process, so they can key tables after the connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identity of a router: a display id plus the address it listens on.
///
/// The address is the routing key everywhere in the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouterInfo {
    pub id: String,
    pub address: String,
}

impl RouterInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for RouterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// An application endpoint attached to a router, identified by
/// `"<chain-id>:<node-id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
}

impl PeerInfo {
    /// Create a peer, rejecting ids that are empty or only a chain prefix.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        if id.is_empty() || is_chain_prefix(&id) {
            return Err(CoreError::InvalidPeerId(id));
        }
        Ok(Self { id })
    }

    /// Whether this peer is addressed by `destination`, either exactly or as
    /// a member of the chain prefix `destination`.
    pub fn matches(&self, destination: &str) -> bool {
        if is_chain_prefix(destination) {
            self.id.starts_with(destination)
        } else {
            self.id == destination
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A destination ending in the delimiter names every peer of a chain.
pub fn is_chain_prefix(destination: &str) -> bool {
    destination.ends_with(CHAIN_DELIMITER)
}

/// Port component of a `host:port` address.
pub fn address_port(address: &str) -> Option<u16> {
    address.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_exact_match() {
        let peer = PeerInfo::new("chain1:nodeX").unwrap();
        assert!(peer.matches("chain1:nodeX"));
        assert!(!peer.matches("chain1:nodeY"));
    }

    #[test]
    fn test_peer_prefix_match() {
        let peer = PeerInfo::new("chain1:nodeX").unwrap();
        assert!(peer.matches("chain1:"));
        assert!(!peer.matches("chain2:"));
    }

    #[test]
    fn test_prefix_requires_delimiter() {
        // "chain1" without the delimiter is an exact id, not a prefix.
        let peer = PeerInfo::new("chain1:nodeX").unwrap();
        assert!(!peer.matches("chain1"));
    }

    #[test]
    fn test_peer_rejects_prefix_id() {
        assert!(PeerInfo::new("chain1:").is_err());
        assert!(PeerInfo::new("").is_err());
    }

    #[test]
    fn test_address_port() {
        assert_eq!(address_port("127.0.0.1:9000"), Some(9000));
        assert_eq!(address_port("[::1]:7000"), Some(7000));
        assert_eq!(address_port("localhost"), None);
        assert_eq!(address_port("host:notaport"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
        assert_eq!(RouterInfo::new("r1", "a:1").to_string(), "r1@a:1");
    }
}
