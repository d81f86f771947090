//! Helpers for running real routers over loopback TCP.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use relaynet_core::RouterInfo;
use relaynet_network::{PeerClientConfig, TcpTransport, TcpTransportConfig};
use relaynet_node::{Router, Timings};

/// Housekeeping interval used by every test router.
pub const TICK: Duration = Duration::from_millis(100);

/// How long a scenario may take to converge.
pub const CONVERGENCE: Duration = Duration::from_secs(10);

/// A loopback address with a port that was free a moment ago.
pub fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").to_string()
}

/// A TCP transport listening on `address`.
pub fn tcp_transport(address: &str) -> Arc<TcpTransport> {
    Arc::new(TcpTransport::new(TcpTransportConfig {
        listen_address: address.to_string(),
        connect_timeout: Duration::from_millis(500),
        ..TcpTransportConfig::default()
    }))
}

/// Build a router over `transport` with short intervals.
pub fn router_over(
    id: &str,
    address: &str,
    discovery: &[String],
    transport: Arc<TcpTransport>,
) -> Router {
    Router::new(
        RouterInfo::new(id, address),
        discovery.to_vec(),
        Timings::uniform(TICK),
        transport,
    )
}

/// Build a router listening on `address` with short intervals.
pub fn test_router(id: &str, address: &str, discovery: &[String]) -> Router {
    router_over(id, address, discovery, tcp_transport(address))
}

/// Build and start a router.
pub async fn start_router(id: &str, address: &str, discovery: &[String]) -> Router {
    let router = test_router(id, address, discovery);
    router
        .start()
        .await
        .expect("router starts")
        .expect("router was not running");
    router
}

/// Peer settings that keep a peer alive under [`TICK`].
pub fn peer_config() -> PeerClientConfig {
    PeerClientConfig {
        keepalive_interval: TICK / 2,
        ..PeerClientConfig::default()
    }
}

/// Poll `condition` until it holds or [`CONVERGENCE`] elapses.
pub async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    tokio::time::timeout(CONVERGENCE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}
