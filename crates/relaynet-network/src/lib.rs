//! Relaynet Networking Crate
//!
//! This crate provides the connection layer under the router core:
//!
//! - **Transport**: the contract the router is written against
//!   (connect, send, broadcast, per-message callback)
//! - **TcpTransport**: a TCP implementation with one reader and one writer
//!   task per connection and a bounded outbound queue
//! - **EnvelopeCodec**: 4-byte big-endian length-prefixed JSON framing
//! - **PeerClient**: attaches an application endpoint to a router
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use relaynet_network::{PeerClient, PeerClientConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let routers = vec!["127.0.0.1:9000".to_string()];
//!     let config = PeerClientConfig::default();
//!     let client = PeerClient::attach("chain1:node1", &routers, config, |msg| {
//!         println!("from {}: {} bytes", msg.source_peer_id, msg.body.len());
//!     })
//!     .await
//!     .unwrap();
//!     client.send("chain2:", b"ping".to_vec(), None);
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod peer;
pub mod tcp;
pub mod transport;

// Re-exports for convenience.
pub use codec::{encode_envelope, EnvelopeCodec, MAX_FRAME_LEN};
pub use connection::next_connection_id;
pub use error::NetworkError;
pub use peer::{PeerClient, PeerClientConfig, SendCallback};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use transport::{
    all_connections, ConnectionFilter, ConnectionInfo, Direction, MessageHandler, Transport,
};
