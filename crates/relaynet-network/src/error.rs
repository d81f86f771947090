//! Network error types for the relaynet transport layer.

/// Errors that can occur in the relaynet network layer.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Error listening on an address.
    #[error("listen error: {0}")]
    Listen(String),

    /// The transport is already running.
    #[error("transport already running")]
    AlreadyRunning,

    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// The outbound queue of a connection is full.
    #[error("send queue full")]
    QueueFull,

    /// None of the given router addresses accepted a connection.
    #[error("no router reachable among {0:?}")]
    NoRouterReachable(Vec<String>),

    /// The message handler rejected a record.
    #[error("handler error: {0}")]
    Handler(String),

    /// Error from the core layer.
    #[error("core error: {0}")]
    Core(#[from] relaynet_core::CoreError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetworkError::Listen("0.0.0.0:9000: address in use".into());
        assert_eq!(err.to_string(), "listen error: 0.0.0.0:9000: address in use");

        let err = NetworkError::AlreadyRunning;
        assert_eq!(err.to_string(), "transport already running");

        let err = NetworkError::QueueFull;
        assert_eq!(err.to_string(), "send queue full");
    }

    #[test]
    fn test_no_router_reachable_lists_addresses() {
        let err = NetworkError::NoRouterReachable(vec!["a:1".into(), "b:2".into()]);
        assert_eq!(err.to_string(), r#"no router reachable among ["a:1", "b:2"]"#);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let net_err: NetworkError = io_err.into();
        assert!(matches!(net_err, NetworkError::Io(_)));
        assert!(net_err.to_string().contains("refused"));
    }

    #[test]
    fn test_core_error_conversion() {
        let core_err = relaynet_core::CoreError::InvalidPeerId("".into());
        let net_err: NetworkError = core_err.into();
        assert!(matches!(net_err, NetworkError::Core(_)));
    }
}
