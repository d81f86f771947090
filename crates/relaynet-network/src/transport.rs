//! The transport contract the router core is written against.
//!
//! A transport owns sockets and framing. The router only ever sees
//! [`ConnectionId`] handles, hands the transport a [`MessageHandler`] for
//! inbound records, and pushes outbound records through the methods below.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use relaynet_core::{ConnectionId, Envelope};

use crate::error::NetworkError;

/// Who opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The remote dialed our listener.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// Socket-level facts about a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub direction: Direction,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// Selects which connections a broadcast reaches.
pub type ConnectionFilter<'a> = &'a (dyn Fn(ConnectionId) -> bool + Send + Sync);

/// Broadcast filter that accepts every connection.
pub fn all_connections(_: ConnectionId) -> bool {
    true
}

/// Receives every decoded inbound record.
///
/// Called from the connection's reader task, one record at a time per
/// connection. An error is logged by the transport; the connection stays open.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(
        &self,
        connection: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), NetworkError>;
}

/// Connection management and record delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting connections. Returns the bound listen address.
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<SocketAddr, NetworkError>;

    /// Close the listener, let queued records reach the sockets, then close
    /// every connection.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Dial `address`. `None` when the connection could not be established.
    async fn connect(&self, address: &str) -> Option<ConnectionId>;

    fn disconnect(&self, connection: ConnectionId);

    /// Queue `envelope`, waiting for queue space. `false` if the connection is gone.
    async fn send(&self, connection: ConnectionId, envelope: &Envelope) -> bool;

    /// Queue `envelope` without waiting. `false` if the queue is full or the
    /// connection is gone.
    fn try_send(&self, connection: ConnectionId, envelope: &Envelope) -> bool;

    /// Queue `envelope` on every inbound connection accepted by `filter`.
    /// Returns how many connections it was queued on.
    fn broadcast_to_inbound(&self, envelope: &Envelope, filter: ConnectionFilter<'_>) -> usize;

    /// Queue `envelope` on every outbound connection accepted by `filter`.
    fn broadcast_to_outbound(&self, envelope: &Envelope, filter: ConnectionFilter<'_>) -> usize;

    fn connection_info(&self, connection: ConnectionId) -> Option<ConnectionInfo>;

    /// Ids of all live connections.
    fn connections(&self) -> Vec<ConnectionId>;
}
