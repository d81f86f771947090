use relaynet_core::CoreError;
use relaynet_network::NetworkError;
use relaynet_routing::RoutingError;

/// Errors surfaced by the router orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("coordinating loop failed: {0}")]
    LoopFailure(String),
}
