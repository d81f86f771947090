use std::fmt;

use crate::error::CoreError;
use crate::message::MessageKind;

/// The lifecycle states of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ConnectionState {
    /// Connection is open but nothing has been exchanged.
    Init,
    /// A HELLO went one way or the other; the remote is not classified yet.
    HelloExchanged,
    /// The remote is known to be a router or a peer.
    Established,
    /// Explicitly closed or evicted. Final state.
    Closed,
}

impl ConnectionState {
    /// Whether this is the terminal state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether a record of `kind` may be processed in this state.
    ///
    /// Before classification only HELLO and the harmless probes are
    /// accepted; gossip and application traffic need an established remote.
    pub fn accepts(&self, kind: MessageKind) -> bool {
        match self {
            Self::Closed => false,
            Self::Established => true,
            Self::Init | Self::HelloExchanged => matches!(
                kind,
                MessageKind::Hello
                    | MessageKind::Keepalive
                    | MessageKind::RouterListRequest
                    | MessageKind::Close
            ),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::HelloExchanged => write!(f, "HelloExchanged"),
            Self::Established => write!(f, "Established"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Events that drive connection state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// We sent a HELLO on this connection.
    HelloSent,
    /// We received a HELLO on this connection.
    HelloReceived,
    /// The remote was registered as a router or a peer.
    Classified,
    /// Any other record was processed.
    Message,
    /// The remote sent CLOSE or we disconnected it.
    Close,
    /// The liveness sweep evicted the connection.
    Evicted,
}

/// Connection state transitions.
///
/// Valid transitions:
/// - Init → HelloExchanged (HelloSent, HelloReceived)
/// - HelloExchanged → HelloExchanged (HelloSent, HelloReceived)
/// - HelloExchanged → Established (Classified)
/// - Established → Established (HelloReceived, Classified, Message)
/// - any non-final state → Closed (Close, Evicted)
pub struct ConnectionStateMachine;

impl ConnectionStateMachine {
    /// Attempt a state transition based on an event.
    /// Returns the new state on success, or an error for invalid transitions.
    pub fn transition(
        current: ConnectionState,
        event: ConnectionEvent,
    ) -> Result<ConnectionState, CoreError> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let new_state = match (current, event) {
            (S::Init, E::HelloSent | E::HelloReceived) => S::HelloExchanged,

            (S::HelloExchanged, E::HelloSent | E::HelloReceived) => S::HelloExchanged,
            (S::HelloExchanged, E::Classified) => S::Established,

            // A router may re-announce itself after a restart.
            (S::Established, E::HelloReceived | E::Classified | E::Message) => S::Established,

            (S::Init | S::HelloExchanged | S::Established, E::Close | E::Evicted) => S::Closed,

            _ => {
                return Err(CoreError::InvalidTransition {
                    from: current,
                    event,
                })
            }
        };

        if new_state != current {
            tracing::trace!(
                from = %current,
                to = %new_state,
                event = ?event,
                "connection state transition"
            );
        }

        Ok(new_state)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: ConnectionState, event: ConnectionEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
