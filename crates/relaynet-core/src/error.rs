use crate::state_machine::{ConnectionEvent, ConnectionState};

/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid connection transition from {from} on {event:?}")]
    InvalidTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
}
