//! Protocol handler: the per-message entry point the transport calls.
//!
//! Every inbound record first touches the liveness table, then is checked
//! against the connection's handshake state, then dispatched by kind.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use relaynet_core::{
    ConnectionEvent, ConnectionId, ConnectionState, ConnectionStateMachine, CoreError, Envelope,
    Hello, MessageKind, PeerSnapshot, RouterList, TopologySnapshot,
};
use relaynet_network::{MessageHandler, NetworkError};

use crate::router::RouterInner;

/// Handshake state of every connection the router has heard from.
///
/// Connections without an entry are in [`ConnectionState::Init`]. Entries are
/// dropped once a connection reaches [`ConnectionState::Closed`].
#[derive(Debug, Default)]
pub struct ConnectionStates {
    states: DashMap<ConnectionId, ConnectionState>,
}

impl ConnectionStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, connection: ConnectionId) -> ConnectionState {
        self.states
            .get(&connection)
            .map(|s| *s)
            .unwrap_or(ConnectionState::Init)
    }

    /// Drive `connection` through `event`.
    pub fn apply(
        &self,
        connection: ConnectionId,
        event: ConnectionEvent,
    ) -> Result<ConnectionState, CoreError> {
        let mut entry = self.states.entry(connection).or_insert(ConnectionState::Init);
        let next = ConnectionStateMachine::transition(*entry, event)?;
        if next.is_final() {
            drop(entry);
            self.states.remove(&connection);
        } else {
            *entry = next;
        }
        Ok(next)
    }

    pub fn remove(&self, connection: ConnectionId) {
        self.states.remove(&connection);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&self) {
        self.states.clear();
    }
}

/// The [`MessageHandler`] a router hands to its transport.
pub struct ProtocolHandler {
    router: Arc<RouterInner>,
}

impl ProtocolHandler {
    pub(crate) fn new(router: Arc<RouterInner>) -> Self {
        Self { router }
    }

    async fn on_hello(
        &self,
        connection: ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), NetworkError> {
        let router = &self.router;
        let hello: Hello = envelope.decode_payload()?;
        let before = router.states.get(connection);
        router.states.apply(connection, ConnectionEvent::HelloReceived)?;

        match hello {
            Hello::Router(info) => {
                if info.address == router.info.address {
                    tracing::warn!(%connection, "dropping connection to self");
                    router.forget_connection(connection);
                    router.transport.disconnect(connection);
                    return Ok(());
                }

                // Answer a dial we did not initiate so both ends learn each other.
                if before == ConnectionState::Init {
                    let reply = Envelope::hello(&Hello::Router(router.info.clone()))?;
                    if !router.transport.send(connection, &reply).await {
                        tracing::warn!(%connection, router = %info, "failed to answer HELLO");
                        router.forget_connection(connection);
                        router.transport.disconnect(connection);
                        return Ok(());
                    }
                    router.states.apply(connection, ConnectionEvent::HelloSent)?;
                }

                if let Some(existing) = router.routers.connection(&info.address) {
                    if existing != connection
                        && router.keeps_existing(existing, connection, &info.address)
                    {
                        tracing::debug!(
                            router = %info,
                            %existing,
                            %connection,
                            "dropping duplicate router connection"
                        );
                        router.forget_connection(connection);
                        router.transport.disconnect(connection);
                        return Ok(());
                    }
                }

                router.track(connection);
                router.states.apply(connection, ConnectionEvent::Classified)?;
                if let Some(displaced) = router.routers.insert(info.clone(), connection) {
                    tracing::debug!(
                        router = %info,
                        %displaced,
                        %connection,
                        "router moved to a new connection"
                    );
                    router.forget_connection(displaced);
                    router.transport.disconnect(displaced);
                }
                tracing::info!(router = %info, %connection, "router registered");
                router.broadcast_topology();
            }
            Hello::Peer(peer) => {
                if let Some(previous) = router.attached.attach(&peer, connection) {
                    tracing::debug!(%peer, %previous, %connection, "peer reattached");
                }
                router.track(connection);
                router.states.apply(connection, ConnectionEvent::Classified)?;
                tracing::info!(%peer, %connection, "peer attached");
                router.broadcast_peers();
            }
        }
        Ok(())
    }

    fn on_close(&self, connection: ConnectionId) {
        let router = &self.router;
        if let Err(e) = router.states.apply(connection, ConnectionEvent::Close) {
            tracing::debug!(%connection, error = %e, "close on unexpected state");
        }
        router.untrack(connection);

        let peers = router.attached.detach_connection(connection);
        if !peers.is_empty() {
            tracing::info!(%connection, peers = peers.len(), "peer detached");
            router.broadcast_peers();
        }
        if let Some(entry) = router.routers.remove_by_connection(connection) {
            tracing::info!(router = %entry.info, %connection, "router closed");
            router.broadcast_topology();
        }
        router.transport.disconnect(connection);
    }

    async fn on_router_list_request(&self, connection: ConnectionId) -> Result<(), NetworkError> {
        let list = RouterList {
            routers: self.router.routers.routers(),
        };
        let reply = Envelope::with_payload(MessageKind::RouterList, &list)?;
        if !self.router.transport.send(connection, &reply).await {
            tracing::debug!(%connection, "failed to answer router list request");
        }
        Ok(())
    }

    fn on_router_list(&self, envelope: &Envelope) -> Result<(), NetworkError> {
        let list: RouterList = envelope.decode_payload()?;
        let unknown: Vec<String> = list
            .routers
            .into_iter()
            .map(|r| r.address)
            .filter(|a| *a != self.router.info.address && !self.router.routers.contains(a))
            .collect();
        if !unknown.is_empty() {
            tracing::debug!(count = unknown.len(), "discovering advertised routers");
            let router = Arc::clone(&self.router);
            tokio::spawn(async move { router.discovery(unknown).await });
        }
        Ok(())
    }

    fn on_topology_sync(
        &self,
        connection: ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), NetworkError> {
        let snapshot: TopologySnapshot = envelope.decode_payload()?;
        if !self.router.dedup.observe(envelope) {
            return Ok(());
        }
        self.router.apply_topology(&snapshot);
        self.router.relay(envelope, connection);
        Ok(())
    }

    fn on_peer_sync(
        &self,
        connection: ConnectionId,
        envelope: &Envelope,
    ) -> Result<(), NetworkError> {
        let snapshot: PeerSnapshot = envelope.decode_payload()?;
        if !self.router.dedup.observe(envelope) {
            return Ok(());
        }
        self.router.apply_peers(&snapshot);
        self.router.relay(envelope, connection);
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for ProtocolHandler {
    async fn on_message(
        &self,
        connection: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), NetworkError> {
        let router = &self.router;
        router.liveness.touch(connection);

        let state = router.states.get(connection);
        if !state.accepts(envelope.kind) {
            tracing::debug!(
                %connection,
                %state,
                kind = %envelope.kind,
                "ignoring message before handshake"
            );
            return Ok(());
        }
        if state == ConnectionState::Established && envelope.kind != MessageKind::Hello {
            router.states.apply(connection, ConnectionEvent::Message)?;
        }

        match envelope.kind {
            MessageKind::Hello => self.on_hello(connection, &envelope).await,
            MessageKind::Close => {
                self.on_close(connection);
                Ok(())
            }
            MessageKind::RouterListRequest => self.on_router_list_request(connection).await,
            MessageKind::RouterList => self.on_router_list(&envelope),
            MessageKind::TopologySync => self.on_topology_sync(connection, &envelope),
            MessageKind::PeerSync => self.on_peer_sync(connection, &envelope),
            MessageKind::Keepalive => Ok(()),
            MessageKind::Application => match router.route_message(envelope).await {
                Ok(outcome) => {
                    tracing::trace!(%connection, ?outcome, "application message routed");
                    Ok(())
                }
                Err(e) => Err(NetworkError::Handler(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_connection_is_init() {
        let states = ConnectionStates::new();
        assert_eq!(states.get(ConnectionId(1)), ConnectionState::Init);
        assert!(states.is_empty());
    }

    #[test]
    fn test_handshake_to_established() {
        let states = ConnectionStates::new();
        let conn = ConnectionId(1);
        assert_eq!(
            states.apply(conn, ConnectionEvent::HelloReceived).unwrap(),
            ConnectionState::HelloExchanged
        );
        assert_eq!(
            states.apply(conn, ConnectionEvent::HelloSent).unwrap(),
            ConnectionState::HelloExchanged
        );
        assert_eq!(
            states.apply(conn, ConnectionEvent::Classified).unwrap(),
            ConnectionState::Established
        );
        assert_eq!(states.get(conn), ConnectionState::Established);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let states = ConnectionStates::new();
        let conn = ConnectionId(2);
        assert!(states.apply(conn, ConnectionEvent::Classified).is_err());
        assert_eq!(states.get(conn), ConnectionState::Init);
    }

    #[test]
    fn test_close_drops_entry() {
        let states = ConnectionStates::new();
        let conn = ConnectionId(3);
        states.apply(conn, ConnectionEvent::HelloSent).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(
            states.apply(conn, ConnectionEvent::Close).unwrap(),
            ConnectionState::Closed
        );
        assert!(states.is_empty());
    }

    #[test]
    fn test_connections_are_independent() {
        let states = ConnectionStates::new();
        states.apply(ConnectionId(1), ConnectionEvent::HelloSent).unwrap();
        states.apply(ConnectionId(1), ConnectionEvent::Classified).unwrap();
        states.apply(ConnectionId(2), ConnectionEvent::HelloReceived).unwrap();
        assert_eq!(states.get(ConnectionId(1)), ConnectionState::Established);
        assert_eq!(states.get(ConnectionId(2)), ConnectionState::HelloExchanged);
    }
}
