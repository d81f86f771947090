//! TCP implementation of [`Transport`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use relaynet_core::{ConnectionId, Envelope};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{encode_envelope, MAX_FRAME_LEN};
use crate::connection::{drain_writer, next_connection_id, open_connection};
use crate::error::NetworkError;
use crate::transport::{ConnectionFilter, ConnectionInfo, Direction, MessageHandler, Transport};

/// Configuration for the TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// The listen address, e.g. "0.0.0.0:9000". Port 0 picks a free port.
    pub listen_address: String,
    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,
    /// Upper bound for a single frame.
    pub max_frame_len: usize,
    /// How long to wait for an outbound connection.
    pub connect_timeout: Duration,
    /// How long [`Transport::stop`] waits for queued records to reach the sockets.
    pub drain_timeout: Duration,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:0".into(),
            queue_capacity: 256,
            max_frame_len: MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(1),
        }
    }
}

struct Connection {
    info: ConnectionInfo,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    drain: CancellationToken,
    writer: JoinHandle<()>,
}

struct Running {
    handler: Arc<dyn MessageHandler>,
    /// Parent of every connection token.
    cancel: CancellationToken,
    listener: CancellationToken,
    local_addr: SocketAddr,
}

/// Listens for inbound connections and dials outbound ones.
pub struct TcpTransport {
    config: TcpTransportConfig,
    connections: Arc<DashMap<ConnectionId, Connection>>,
    running: Mutex<Option<Running>>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            connections: Arc::new(DashMap::new()),
            running: Mutex::new(None),
        }
    }

    /// The bound listen address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.local_addr)
    }

    fn handler_and_token(&self) -> Option<(Arc<dyn MessageHandler>, CancellationToken)> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| (Arc::clone(&r.handler), r.cancel.clone()))
    }

    fn outbound(&self, connection: ConnectionId) -> Option<mpsc::Sender<Bytes>> {
        self.connections.get(&connection).map(|c| c.outbound.clone())
    }

    fn broadcast(
        &self,
        direction: Direction,
        envelope: &Envelope,
        filter: ConnectionFilter<'_>,
    ) -> usize {
        let frame = match encode_envelope(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(kind = %envelope.kind, error = %e, "failed to encode broadcast");
                return 0;
            }
        };

        let targets: Vec<(ConnectionId, mpsc::Sender<Bytes>)> = self
            .connections
            .iter()
            .filter(|c| c.info.direction == direction && filter(*c.key()))
            .map(|c| (*c.key(), c.outbound.clone()))
            .collect();

        targets
            .into_iter()
            .filter(|(id, outbound)| enqueue(*id, outbound, frame.clone()))
            .count()
    }
}

/// Non-blocking enqueue; a full queue drops the frame.
fn enqueue(connection: ConnectionId, outbound: &mpsc::Sender<Bytes>, frame: Bytes) -> bool {
    match outbound.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%connection, "send queue full, dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Register `stream` and spawn its tasks.
///
/// The connection is in the registry before its reader starts, so the
/// handler can answer on it and a quick remote close still unregisters it.
fn register(
    connections: &Arc<DashMap<ConnectionId, Connection>>,
    config: &TcpTransportConfig,
    stream: TcpStream,
    direction: Direction,
    handler: Arc<dyn MessageHandler>,
    parent: &CancellationToken,
) -> Result<ConnectionId, NetworkError> {
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let id = next_connection_id();
    let cancel = parent.child_token();
    let (writer, reader) = open_connection(
        id,
        stream,
        cancel.clone(),
        config.queue_capacity,
        config.max_frame_len,
    );

    connections.insert(
        id,
        Connection {
            info: ConnectionInfo {
                id,
                direction,
                local_addr,
                remote_addr,
            },
            outbound: writer.outbound,
            cancel,
            drain: writer.drain,
            writer: writer.task,
        },
    );

    let registry = Arc::clone(connections);
    reader.spawn(handler, move |id| {
        registry.remove(&id);
    });

    tracing::debug!(
        connection = %id,
        %direction,
        %local_addr,
        %remote_addr,
        "connection registered"
    );
    Ok(id)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<SocketAddr, NetworkError> {
        if self.is_running() {
            return Err(NetworkError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| NetworkError::Listen(format!("{}: {}", self.config.listen_address, e)))?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let listener_cancel = cancel.child_token();

        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.is_some() {
                return Err(NetworkError::AlreadyRunning);
            }
            *running = Some(Running {
                handler: Arc::clone(&handler),
                cancel: cancel.clone(),
                listener: listener_cancel.clone(),
                local_addr,
            });
        }

        let connections = Arc::clone(&self.connections);
        let config = self.config.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = listener_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&handler);
                        let registered = register(
                            &connections,
                            &config,
                            stream,
                            Direction::Inbound,
                            handler,
                            &cancel,
                        );
                        if let Err(e) = registered {
                            tracing::warn!(error = %e, "failed to register inbound connection");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            tracing::debug!(%local_addr, "listener closed");
        });

        tracing::info!(%local_addr, "TCP transport listening");
        Ok(local_addr)
    }

    /// Stop accepting, let every connection flush its queue, then close them all.
    async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };
        running.listener.cancel();

        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();
        let drains = ids
            .into_iter()
            .filter_map(|id| self.connections.remove(&id))
            .map(|(_, conn)| {
                let timeout = self.config.drain_timeout;
                async move { drain_writer(&conn.drain, conn.writer, timeout).await }
            });
        let drained = join_all(drains).await;
        let stuck = drained.iter().filter(|flushed| !**flushed).count();
        if stuck > 0 {
            tracing::debug!(stuck, "connections closed before their queue drained");
        }

        running.cancel.cancel();
        tracing::info!(local_addr = %running.local_addr, "TCP transport stopped");
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn connect(&self, address: &str) -> Option<ConnectionId> {
        let (handler, cancel) = match self.handler_and_token() {
            Some(parts) => parts,
            None => {
                tracing::warn!(address, "connect while transport is stopped");
                return None;
            }
        };

        let dial = TcpStream::connect(address);
        let stream = match tokio::time::timeout(self.config.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(address, error = %e, "connect failed");
                return None;
            }
            Err(_) => {
                tracing::debug!(address, "connect timed out");
                return None;
            }
        };

        let registered = register(
            &self.connections,
            &self.config,
            stream,
            Direction::Outbound,
            handler,
            &cancel,
        );
        match registered {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(address, error = %e, "failed to register outbound connection");
                None
            }
        }
    }

    fn disconnect(&self, connection: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&connection) {
            conn.cancel.cancel();
            tracing::debug!(%connection, remote_addr = %conn.info.remote_addr, "disconnected");
        }
    }

    async fn send(&self, connection: ConnectionId, envelope: &Envelope) -> bool {
        let Some(outbound) = self.outbound(connection) else {
            return false;
        };
        match encode_envelope(envelope) {
            Ok(frame) => outbound.send(frame).await.is_ok(),
            Err(e) => {
                tracing::error!(
                    %connection,
                    kind = %envelope.kind,
                    error = %e,
                    "failed to encode message"
                );
                false
            }
        }
    }

    fn try_send(&self, connection: ConnectionId, envelope: &Envelope) -> bool {
        let Some(outbound) = self.outbound(connection) else {
            return false;
        };
        match encode_envelope(envelope) {
            Ok(frame) => enqueue(connection, &outbound, frame),
            Err(e) => {
                tracing::error!(
                    %connection,
                    kind = %envelope.kind,
                    error = %e,
                    "failed to encode message"
                );
                false
            }
        }
    }

    fn broadcast_to_inbound(&self, envelope: &Envelope, filter: ConnectionFilter<'_>) -> usize {
        self.broadcast(Direction::Inbound, envelope, filter)
    }

    fn broadcast_to_outbound(&self, envelope: &Envelope, filter: ConnectionFilter<'_>) -> usize {
        self.broadcast(Direction::Outbound, envelope, filter)
    }

    fn connection_info(&self, connection: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&connection).map(|c| c.info.clone())
    }

    fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();
        ids.sort();
        ids
    }
}
