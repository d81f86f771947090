//! Wire envelope exchanged between routers and attached peers.
//!
//! Every record on the wire is an [`Envelope`]: a kind tag, an opaque payload
//! whose shape depends on the kind, and the routing trail of router addresses
//! the record has already passed through.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::types::{PeerInfo, RouterInfo};

/// Kind tag of a wire record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Identifies the sender as a router or an attached peer.
    Hello,
    /// The sending router is going away.
    Close,
    /// Asks the receiver for the routers it knows.
    RouterListRequest,
    /// Reply to a router list request.
    RouterList,
    /// A router's view of its own neighbors, flooded through the mesh.
    TopologySync,
    /// A router's set of attached peers, flooded through the mesh.
    PeerSync,
    /// Liveness probe with no payload.
    Keepalive,
    /// Opaque application traffic carried for peers.
    Application,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hello => "HELLO",
            Self::Close => "CLOSE",
            Self::RouterListRequest => "ROUTER_LIST_REQUEST",
            Self::RouterList => "ROUTER_LIST",
            Self::TopologySync => "TOPOLOGY_SYNC",
            Self::PeerSync => "PEER_SYNC",
            Self::Keepalive => "KEEPALIVE",
            Self::Application => "APPLICATION",
        };
        f.write_str(name)
    }
}

/// Ordered list of router addresses a record has visited.
///
/// Gossip snapshots also carry a `"<timestamp>:<address>"` stamp here so two
/// snapshots with the same content still fingerprint differently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTrail(Vec<String>);

impl RoutingTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.iter().any(|hop| hop == address)
    }

    pub fn push(&mut self, address: impl Into<String>) {
        self.0.push(address.into());
    }

    pub fn hops(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for RoutingTrail {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// BLAKE3 digest of a serialized envelope, used to recognise repeated gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// A single wire record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub routing_trail: RoutingTrail,
}

impl Envelope {
    /// Create an envelope with a raw payload and an empty trail.
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            routing_trail: RoutingTrail::new(),
        }
    }

    /// Create an envelope with no payload (keepalive, router list request).
    pub fn empty(kind: MessageKind) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Create an envelope whose payload is the JSON encoding of `body`.
    pub fn with_payload<T: Serialize>(kind: MessageKind, body: &T) -> Result<Self, CoreError> {
        Ok(Self::new(kind, serde_json::to_vec(body)?))
    }

    /// Decode the payload as `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_slice(&self.payload).map_err(CoreError::from)
    }

    pub fn hello(hello: &Hello) -> Result<Self, CoreError> {
        Self::with_payload(MessageKind::Hello, hello)
    }

    pub fn application(app: &ApplicationEnvelope) -> Result<Self, CoreError> {
        Self::with_payload(MessageKind::Application, app)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(CoreError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(CoreError::from)
    }

    /// Fingerprint over kind, payload and trail.
    pub fn fingerprint(&self) -> Fingerprint {
        // Serializing an envelope of plain data cannot fail; fall back to
        // hashing the payload alone if it ever does.
        let hash = match serde_json::to_vec(self) {
            Ok(bytes) => blake3::hash(&bytes),
            Err(_) => blake3::hash(&self.payload),
        };
        Fingerprint(*hash.as_bytes())
    }
}

/// Payload of a HELLO record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Hello {
    Router(RouterInfo),
    Peer(PeerInfo),
}

/// Payload of a ROUTER_LIST reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterList {
    pub routers: Vec<RouterInfo>,
}

/// Payload of a TOPOLOGY_SYNC record: `source` and its direct neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub source: String,
    pub neighbors: Vec<RouterInfo>,
}

impl TopologySnapshot {
    pub fn neighbor_addresses(&self) -> Vec<String> {
        self.neighbors.iter().map(|r| r.address.clone()).collect()
    }
}

/// Payload of a PEER_SYNC record: the peers attached to router `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub source: String,
    pub peers: Vec<PeerInfo>,
}

/// Payload of an APPLICATION record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationEnvelope {
    pub source_peer_id: String,
    pub destination_peer_id: String,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl ApplicationEnvelope {
    pub fn new(
        source_peer_id: impl Into<String>,
        destination_peer_id: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            source_peer_id: source_peer_id.into(),
            destination_peer_id: destination_peer_id.into(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trail_contains_exact_entries() {
        let trail: RoutingTrail = ["127.0.0.1:9000", "127.0.0.1:9001"].into_iter().collect();
        assert!(trail.contains("127.0.0.1:9000"));
        // No substring matching: ":900" is not a visited hop.
        assert!(!trail.contains(":900"));
        assert_eq!(trail.len(), 2);
    }

    #[test]
    fn test_trail_push() {
        let mut trail = RoutingTrail::new();
        assert!(trail.is_empty());
        trail.push("a");
        assert_eq!(trail.hops(), &["a".to_string()]);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::empty(MessageKind::RouterListRequest);
        let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "ROUTER_LIST_REQUEST");
        assert_eq!(json["routing_trail"], serde_json::json!([]));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let env = Envelope::from_bytes(br#"{"kind":"KEEPALIVE"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Keepalive);
        assert!(env.payload.is_empty());
        assert!(env.routing_trail.is_empty());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Envelope::from_bytes(br#"{"kind":"GOSSIP"}"#).is_err());
    }

    #[test]
    fn test_hello_payload() {
        let hello = Hello::Router(RouterInfo::new("r1", "127.0.0.1:9000"));
        let env = Envelope::hello(&hello).unwrap();
        assert_eq!(env.kind, MessageKind::Hello);
        assert_eq!(env.decode_payload::<Hello>().unwrap(), hello);

        let json: serde_json::Value = serde_json::from_slice(&env.payload).unwrap();
        assert_eq!(json["role"], "router");
    }

    #[test]
    fn test_decode_wrong_payload_fails() {
        let env = Envelope::new(MessageKind::Application, b"not json".to_vec());
        assert!(env.decode_payload::<ApplicationEnvelope>().is_err());
    }

    #[test]
    fn test_fingerprint_identical_envelopes() {
        let snapshot = TopologySnapshot {
            source: "a".into(),
            neighbors: vec![RouterInfo::new("b", "b"), RouterInfo::new("c", "c")],
        };
        let first = Envelope::with_payload(MessageKind::TopologySync, &snapshot).unwrap();
        let second = first.clone();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_fingerprint_covers_trail() {
        let mut first = Envelope::empty(MessageKind::PeerSync);
        let mut second = Envelope::empty(MessageKind::PeerSync);
        first.routing_trail.push("t1:a");
        second.routing_trail.push("t2:a");
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_neighbor_addresses() {
        let snapshot = TopologySnapshot {
            source: "a".into(),
            neighbors: vec![RouterInfo::new("rb", "b"), RouterInfo::new("rc", "c")],
        };
        assert_eq!(snapshot.neighbor_addresses(), vec!["b", "c"]);
    }

    #[test]
    fn test_fingerprint_display_is_short_hex() {
        let fp = Envelope::empty(MessageKind::Keepalive).fingerprint();
        assert_eq!(fp.to_string().len(), 16);
    }
}
