//! In-memory transport that records traffic instead of touching sockets.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relaynet_core::{ConnectionId, Envelope, MessageKind};
use relaynet_network::{
    ConnectionFilter, ConnectionInfo, Direction, MessageHandler, NetworkError, Transport,
};

#[derive(Default)]
pub(crate) struct MockTransport {
    running: AtomicBool,
    fail_start: AtomicBool,
    queue_full: AtomicBool,
    starts: AtomicUsize,
    next_id: AtomicU64,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    reachable: Mutex<HashSet<String>>,
    connections: Mutex<BTreeMap<ConnectionId, ConnectionInfo>>,
    sent: Mutex<Vec<(ConnectionId, Envelope)>>,
    broadcasts: Mutex<Vec<(Direction, Envelope)>>,
    dials: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<ConnectionId>>,
}

fn socket(address: &str) -> SocketAddr {
    address
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)))
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            ..Self::default()
        }
    }

    /// Register a live connection without dialing.
    pub(crate) fn open(&self, direction: Direction, local: &str, remote: &str) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = ConnectionInfo {
            id,
            direction,
            local_addr: socket(local),
            remote_addr: socket(remote),
        };
        self.connections.lock().unwrap().insert(id, info);
        id
    }

    /// Forget a connection as if the socket died, without recording a disconnect.
    pub(crate) fn drop_connection(&self, connection: ConnectionId) {
        self.connections.lock().unwrap().remove(&connection);
    }

    pub(crate) fn set_reachable(&self, address: &str) {
        self.reachable.lock().unwrap().insert(address.to_string());
    }

    pub(crate) fn set_queue_full(&self, full: bool) {
        self.queue_full.store(full, Ordering::SeqCst);
    }

    pub(crate) fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub(crate) fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<(ConnectionId, Envelope)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_on(&self, connection: ConnectionId) -> Vec<Envelope> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == connection)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub(crate) fn broadcasts_of(&self, kind: MessageKind) -> Vec<Envelope> {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub(crate) fn broadcasts_of_in(
        &self,
        kind: MessageKind,
        direction: Direction,
    ) -> Vec<Envelope> {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, e)| e.kind == kind && *d == direction)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Hand `envelope` to the handler the router registered on start.
    pub(crate) async fn deliver(
        &self,
        connection: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), NetworkError> {
        let handler = self
            .handler
            .lock()
            .unwrap()
            .clone()
            .ok_or(NetworkError::ConnectionClosed)?;
        handler.on_message(connection, envelope).await
    }

    pub(crate) fn dials(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }

    pub(crate) fn disconnected(&self) -> Vec<ConnectionId> {
        self.disconnected.lock().unwrap().clone()
    }

    fn record_send(&self, connection: ConnectionId, envelope: &Envelope) -> bool {
        if !self.connections.lock().unwrap().contains_key(&connection) {
            return false;
        }
        self.sent.lock().unwrap().push((connection, envelope.clone()));
        true
    }

    fn record_broadcast(
        &self,
        direction: Direction,
        envelope: &Envelope,
        filter: ConnectionFilter<'_>,
    ) -> usize {
        self.broadcasts
            .lock()
            .unwrap()
            .push((direction, envelope.clone()));
        self.connections
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.direction == direction && filter(info.id))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<SocketAddr, NetworkError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(NetworkError::Listen("mock refused to listen".into()));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyRunning);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.handler.lock().unwrap() = Some(handler);
        Ok(SocketAddr::from(([127, 0, 0, 1], 9000)))
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.handler.lock().unwrap().take();
        self.connections.lock().unwrap().clear();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn connect(&self, address: &str) -> Option<ConnectionId> {
        self.dials.lock().unwrap().push(address.to_string());
        if !self.reachable.lock().unwrap().contains(address) {
            return None;
        }
        Some(self.open(Direction::Outbound, "127.0.0.1:50000", address))
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.connections.lock().unwrap().remove(&connection);
        self.disconnected.lock().unwrap().push(connection);
    }

    async fn send(&self, connection: ConnectionId, envelope: &Envelope) -> bool {
        self.record_send(connection, envelope)
    }

    fn try_send(&self, connection: ConnectionId, envelope: &Envelope) -> bool {
        if self.queue_full.load(Ordering::SeqCst) {
            return false;
        }
        self.record_send(connection, envelope)
    }

    fn broadcast_to_inbound(&self, envelope: &Envelope, filter: ConnectionFilter<'_>) -> usize {
        self.record_broadcast(Direction::Inbound, envelope, filter)
    }

    fn broadcast_to_outbound(&self, envelope: &Envelope, filter: ConnectionFilter<'_>) -> usize {
        self.record_broadcast(Direction::Outbound, envelope, filter)
    }

    fn connection_info(&self, connection: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.lock().unwrap().get(&connection).cloned()
    }

    fn connections(&self) -> Vec<ConnectionId> {
        self.connections.lock().unwrap().keys().copied().collect()
    }
}
