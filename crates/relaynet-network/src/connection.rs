//! Per-connection reader and writer tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relaynet_core::ConnectionId;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::EnvelopeCodec;
use crate::transport::MessageHandler;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type FramedConnection = Framed<TcpStream, EnvelopeCodec>;

/// Allocate a process-unique connection handle.
pub fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// The sending half of a connection, already running.
pub(crate) struct ConnectionWriter {
    /// Bounded queue the writer task drains into the socket.
    pub(crate) outbound: mpsc::Sender<Bytes>,
    /// Cancelling this makes the writer flush what is queued and exit.
    pub(crate) drain: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

/// The receiving half of a connection, not yet started.
pub(crate) struct ConnectionReader {
    id: ConnectionId,
    frames: SplitStream<FramedConnection>,
    cancel: CancellationToken,
}

/// Split `stream` and start its writer.
///
/// The reader is returned unstarted so the caller can publish the
/// connection before the first inbound record is handled. Either side
/// ending cancels `cancel`, which stops the other.
pub(crate) fn open_connection(
    id: ConnectionId,
    stream: TcpStream,
    cancel: CancellationToken,
    queue_capacity: usize,
    max_frame_len: usize,
) -> (ConnectionWriter, ConnectionReader) {
    let (outbound, outbound_rx) = mpsc::channel::<Bytes>(queue_capacity.max(1));
    let framed = Framed::new(stream, EnvelopeCodec::with_max_frame_len(max_frame_len));
    let (sink, frames) = framed.split();

    let drain = CancellationToken::new();
    let task = tokio::spawn(write_loop(id, sink, outbound_rx, cancel.clone(), drain.clone()));

    let writer = ConnectionWriter {
        outbound,
        drain,
        task,
    };
    let reader = ConnectionReader { id, frames, cancel };
    (writer, reader)
}

async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<FramedConnection, Bytes>,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    drain: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = drain.cancelled() => {
                outbound.close();
                while let Some(frame) = outbound.recv().await {
                    if let Err(e) = sink.send(frame).await {
                        tracing::debug!(connection = %id, error = %e, "write failed on drain");
                        break;
                    }
                }
                break;
            }
            next = outbound.recv() => match next {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        tracing::debug!(connection = %id, error = %e, "write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
    cancel.cancel();
}

impl ConnectionReader {
    /// Decode frames and hand each envelope to `handler` in order.
    ///
    /// `on_closed` runs once when the reader has exited.
    pub(crate) fn spawn<F>(self, handler: Arc<dyn MessageHandler>, on_closed: F)
    where
        F: FnOnce(ConnectionId) + Send + 'static,
    {
        let ConnectionReader {
            id,
            mut frames,
            cancel,
        } = self;
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = frames.next() => next,
                };

                match next {
                    Some(Ok(Ok(envelope))) => {
                        let kind = envelope.kind;
                        if let Err(e) = handler.on_message(id, envelope).await {
                            tracing::warn!(
                                connection = %id,
                                %kind,
                                error = %e,
                                "failed to handle message"
                            );
                        }
                    }
                    Some(Ok(Err(e))) => {
                        tracing::warn!(connection = %id, error = %e, "dropping malformed frame");
                    }
                    Some(Err(e)) => {
                        tracing::debug!(connection = %id, error = %e, "read failed");
                        break;
                    }
                    None => {
                        tracing::debug!(connection = %id, "connection closed by remote");
                        break;
                    }
                }
            }
            cancel.cancel();
            on_closed(id);
        });
    }
}

/// Let a writer flush its queue, waiting at most `timeout` for it.
///
/// Returns whether the writer finished in time.
pub(crate) async fn drain_writer(
    drain: &CancellationToken,
    task: JoinHandle<()>,
    timeout: Duration,
) -> bool {
    drain.cancel();
    matches!(tokio::time::timeout(timeout, task).await, Ok(Ok(())))
}
