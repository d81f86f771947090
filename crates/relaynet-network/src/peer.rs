//! Client side of peer attachment.
//!
//! An application endpoint attaches to one router, announces itself with a
//! peer HELLO, and from then on sends and receives [`ApplicationEnvelope`]s.
//! The router evicts silent connections, so the client keeps the connection
//! alive with periodic KEEPALIVE records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relaynet_core::{ApplicationEnvelope, ConnectionId, Envelope, Hello, MessageKind, PeerInfo};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{encode_envelope, MAX_FRAME_LEN};
use crate::connection::{drain_writer, next_connection_id, open_connection};
use crate::error::NetworkError;
use crate::transport::MessageHandler;

/// Invoked with the outcome of queueing a message.
pub type SendCallback = Box<dyn FnOnce(Result<(), NetworkError>) + Send>;

/// Configuration for a [`PeerClient`].
#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    /// Interval between KEEPALIVE records.
    pub keepalive_interval: Duration,
    /// Capacity of the outbound queue.
    pub queue_capacity: usize,
    /// How long to wait for each router address.
    pub connect_timeout: Duration,
}

impl Default for PeerClientConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(5),
            queue_capacity: 256,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Hands inbound application records to the user callback.
struct Inbox<F> {
    peer_id: String,
    on_message: F,
}

#[async_trait]
impl<F> MessageHandler for Inbox<F>
where
    F: Fn(ApplicationEnvelope) + Send + Sync,
{
    async fn on_message(
        &self,
        connection: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), NetworkError> {
        if envelope.kind != MessageKind::Application {
            return Ok(());
        }
        let app: ApplicationEnvelope = envelope.decode_payload()?;
        tracing::trace!(
            peer = %self.peer_id,
            %connection,
            source = %app.source_peer_id,
            "application message received"
        );
        (self.on_message)(app);
        Ok(())
    }
}

/// A peer attached to a router.
pub struct PeerClient {
    peer: PeerInfo,
    router_address: String,
    connection: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    drain: CancellationToken,
    writer: Option<JoinHandle<()>>,
    connect_timeout: Duration,
}

impl PeerClient {
    /// Attach `peer_id` to the first reachable router in `addresses`.
    ///
    /// `on_message` receives every application record delivered to this peer.
    pub async fn attach<F>(
        peer_id: &str,
        addresses: &[String],
        config: PeerClientConfig,
        on_message: F,
    ) -> Result<Self, NetworkError>
    where
        F: Fn(ApplicationEnvelope) + Send + Sync + 'static,
    {
        let peer = PeerInfo::new(peer_id)?;

        let mut attached = None;
        for address in addresses {
            let dial = TcpStream::connect(address.as_str());
            match tokio::time::timeout(config.connect_timeout, dial).await {
                Ok(Ok(stream)) => {
                    attached = Some((address.clone(), stream));
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(%peer, %address, error = %e, "router unreachable");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer, address = %address, "router connect timed out");
                }
            }
        }
        let (router_address, stream) =
            attached.ok_or_else(|| NetworkError::NoRouterReachable(addresses.to_vec()))?;

        let connection = next_connection_id();
        let cancel = CancellationToken::new();
        let inbox: Arc<dyn MessageHandler> = Arc::new(Inbox {
            peer_id: peer.id.clone(),
            on_message,
        });
        let (writer, reader) = open_connection(
            connection,
            stream,
            cancel.clone(),
            config.queue_capacity,
            MAX_FRAME_LEN,
        );
        let closed_peer = peer.id.clone();
        reader.spawn(inbox, move |_| {
            tracing::info!(peer = %closed_peer, "detached from router")
        });

        let hello = encode_envelope(&Envelope::hello(&Hello::Peer(peer.clone()))?)?;
        writer
            .outbound
            .send(hello)
            .await
            .map_err(|_| NetworkError::ConnectionClosed)?;

        spawn_keepalive(writer.outbound.clone(), cancel.clone(), config.keepalive_interval)?;

        tracing::info!(peer = %peer, router = %router_address, "attached to router");

        Ok(Self {
            peer,
            router_address,
            connection,
            outbound: writer.outbound,
            cancel,
            drain: writer.drain,
            writer: Some(writer.task),
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// The router this peer is attached to.
    pub fn router_address(&self) -> &str {
        &self.router_address
    }

    /// Handle of the connection to the router.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_attached(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    /// Send `body` to `destination` (an exact peer id or a `"<chain-id>:"`
    /// prefix). Never blocks: a full queue fails the send.
    ///
    /// Returns whether the message was queued; `callback`, when given,
    /// receives the same outcome with the reason for a failure.
    pub fn send(&self, destination: &str, body: Vec<u8>, callback: Option<SendCallback>) -> bool {
        let outcome = self.enqueue(destination, body);
        let queued = outcome.is_ok();
        if let Err(e) = &outcome {
            tracing::warn!(peer = %self.peer, destination, error = %e, "send failed");
        }
        if let Some(callback) = callback {
            callback(outcome);
        }
        queued
    }

    fn enqueue(&self, destination: &str, body: Vec<u8>) -> Result<(), NetworkError> {
        let app = ApplicationEnvelope::new(self.peer.id.clone(), destination, body);
        let frame = encode_envelope(&Envelope::application(&app)?)?;
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => NetworkError::QueueFull,
            TrySendError::Closed(_) => NetworkError::ConnectionClosed,
        })
    }

    /// Say goodbye and close the connection once the CLOSE is written.
    pub async fn detach(mut self) {
        if let Ok(frame) = encode_envelope(&Envelope::empty(MessageKind::Close)) {
            let _ = self.outbound.send(frame).await;
        }
        if let Some(writer) = self.writer.take() {
            if !drain_writer(&self.drain, writer, self.connect_timeout).await {
                tracing::debug!(peer = %self.peer, "CLOSE not flushed before detach");
            }
        }
        self.cancel.cancel();
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_keepalive(
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    interval: Duration,
) -> Result<(), NetworkError> {
    let keepalive = encode_envelope(&Envelope::empty(MessageKind::Keepalive))?;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(TrySendError::Closed(_)) = outbound.try_send(keepalive.clone()) {
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}
