//! The router orchestrator.
//!
//! A [`Router`] owns every routing table, the transport it speaks through and
//! one coordinating task that drives gossip, keepalive and cache expiry.
//! Inbound records reach it through the [`ProtocolHandler`] the router hands
//! to the transport on [`Router::start`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use dashmap::{DashMap, DashSet};
use rand::Rng;
use relaynet_core::{
    address_port, ApplicationEnvelope, ConnectionEvent, ConnectionId, Envelope, Hello,
    MessageKind, PeerInfo, PeerSnapshot, RouterInfo, TopologySnapshot,
};
use relaynet_network::{all_connections, ConnectionFilter, ConnectionInfo, Direction, Transport};
use relaynet_routing::{
    AttachedPeers, DedupCache, LivenessTable, PeerLocationTable, RouterTable, RoutingError,
    Topology,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{RouterConfig, Timings};
use crate::error::RouterError;
use crate::handler::{ConnectionStates, ProtocolHandler};

/// Discovery retry delays never exceed this multiple of the keepalive interval.
const MAX_RETRY_FACTOR: u32 = 8;

/// What [`Router::route_message`] did with an application record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The trail already named this router.
    Looped,
    /// No router is known to serve the destination.
    Unreachable,
    /// Queued to `delivered` local peers and `forwarded` next hops.
    Routed { delivered: usize, forwarded: usize },
}

/// Point-in-time view of a router, logged on the router-list timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSummary {
    pub id: String,
    pub address: String,
    pub routers: Vec<String>,
    pub routers_cnt: usize,
    pub peers: Vec<String>,
    pub peers_cnt: usize,
}

/// State shared by the router handle, the protocol handler and background tasks.
pub(crate) struct RouterInner {
    pub(crate) info: RouterInfo,
    pub(crate) timings: Timings,
    pub(crate) bootstrap: Vec<String>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) routers: RouterTable,
    pub(crate) topology: Topology,
    pub(crate) peer_locations: PeerLocationTable,
    pub(crate) attached: AttachedPeers,
    pub(crate) dedup: DedupCache,
    pub(crate) liveness: LivenessTable,
    pub(crate) states: ConnectionStates,
    /// Socket facts of every tracked connection, kept after the socket dies.
    sockets: DashMap<ConnectionId, ConnectionInfo>,
    /// Addresses owned by a pending discovery retry.
    retrying: DashSet<String>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    topology_reset: Notify,
    peers_reset: Notify,
}

impl RouterInner {
    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn reset_tables(&self) {
        self.routers.clear();
        self.topology.clear();
        self.peer_locations.clear();
        self.attached.clear();
        self.dedup.clear();
        self.liveness.clear();
        self.states.clear();
        self.sockets.clear();
        self.retrying.clear();
    }

    /// Start watching `connection` for liveness and remember where it leads.
    pub(crate) fn track(&self, connection: ConnectionId) {
        self.liveness.register(connection);
        if let Some(info) = self.transport.connection_info(connection) {
            self.sockets.insert(connection, info);
        }
    }

    pub(crate) fn untrack(&self, connection: ConnectionId) -> Option<ConnectionInfo> {
        self.liveness.remove(connection);
        self.sockets.remove(&connection).map(|(_, info)| info)
    }

    /// Drop every trace of a connection.
    pub(crate) fn forget_connection(&self, connection: ConnectionId) {
        self.states.remove(connection);
        self.untrack(connection);
    }

    /// Whether `existing` should stay the link to the router at `remote`
    /// when `candidate` completes a handshake with it too.
    ///
    /// A closed `existing` always loses. Two open links in opposite
    /// directions resolve to the one dialed by the lower address, which both
    /// ends agree on.
    pub(crate) fn keeps_existing(
        &self,
        existing: ConnectionId,
        candidate: ConnectionId,
        remote: &str,
    ) -> bool {
        let Some(existing) = self.transport.connection_info(existing) else {
            return false;
        };
        let Some(candidate) = self.transport.connection_info(candidate) else {
            return true;
        };
        if existing.direction == candidate.direction {
            return false;
        }
        let lower_dials = if self.info.address.as_str() < remote {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        existing.direction == lower_dials
    }

    /// Dial `address` and introduce ourselves. Returns whether the dial connected.
    async fn dial(&self, address: &str) -> bool {
        let Some(connection) = self.transport.connect(address).await else {
            return false;
        };

        let hello = match Envelope::hello(&Hello::Router(self.info.clone())) {
            Ok(hello) => hello,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode HELLO");
                self.transport.disconnect(connection);
                return true;
            }
        };
        if let Err(e) = self.states.apply(connection, ConnectionEvent::HelloSent) {
            tracing::warn!(%connection, error = %e, "unexpected state for new connection");
        }
        self.track(connection);

        if self.transport.send(connection, &hello).await {
            tracing::info!(address, %connection, "connected to router");
        } else {
            tracing::warn!(address, %connection, "failed to send HELLO, disconnecting");
            self.forget_connection(connection);
            self.transport.disconnect(connection);
        }
        true
    }

    /// Connect to every address that is neither us nor a known router.
    ///
    /// Addresses that fail are handed to a background retry task.
    pub(crate) async fn discovery(self: &Arc<Self>, addresses: Vec<String>) {
        let mut seen = BTreeSet::new();
        let mut failed = Vec::new();
        for address in addresses {
            if address == self.info.address
                || self.routers.contains(&address)
                || self.retrying.contains(&address)
                || !seen.insert(address.clone())
            {
                continue;
            }
            if !self.dial(&address).await {
                failed.push(address);
            }
        }
        if !failed.is_empty() {
            self.spawn_discovery_retry(failed);
        }
    }

    fn spawn_discovery_retry(self: &Arc<Self>, mut pending: Vec<String>) {
        pending.retain(|address| self.retrying.insert(address.clone()));
        if pending.is_empty() {
            return;
        }
        tracing::debug!(pending = pending.len(), "scheduling discovery retry");

        let inner = Arc::clone(self);
        let cancel = self.cancel_token().child_token();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            while !pending.is_empty() {
                let delay = retry_delay(inner.timings.keepalive, attempt);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        for address in &pending {
                            inner.retrying.remove(address);
                        }
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt = attempt.saturating_add(1);

                let mut still_failing = Vec::new();
                for address in pending.drain(..) {
                    if inner.routers.contains(&address) || inner.dial(&address).await {
                        inner.retrying.remove(&address);
                    } else {
                        still_failing.push(address);
                    }
                }
                if !still_failing.is_empty() {
                    tracing::debug!(
                        attempt,
                        pending = still_failing.len(),
                        "discovery retry failed"
                    );
                }
                pending = still_failing;
            }
        });
    }

    /// Re-dial an evicted router link until it is back.
    ///
    /// Stops early once the router is registered again, under its advertised
    /// address when known and its socket address otherwise.
    fn spawn_reconnect(self: &Arc<Self>, remote: String, router_address: Option<String>) {
        let inner = Arc::clone(self);
        let cancel = self.cancel_token().child_token();
        let address = router_address.unwrap_or_else(|| remote.clone());
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if inner.routers.contains(&address) {
                    tracing::debug!(%address, "router reappeared, reconnect finished");
                    return;
                }
                tracing::warn!(%remote, "router connection timed out, reconnecting");
                if inner.dial(&remote).await {
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(inner.timings.reconnect) => {}
                }
            }
        });
    }

    pub(crate) async fn route_message(
        &self,
        mut envelope: Envelope,
    ) -> Result<RouteOutcome, RouterError> {
        let local = self.info.address.as_str();
        if envelope.routing_trail.contains(local) {
            tracing::trace!(trail = envelope.routing_trail.len(), "dropping looped message");
            return Ok(RouteOutcome::Looped);
        }
        envelope.routing_trail.push(local);

        let app: ApplicationEnvelope = envelope.decode_payload()?;
        let destination = app.destination_peer_id.as_str();
        let serving = self.peer_locations.lookup(destination);
        if serving.is_empty() {
            tracing::warn!(
                source = %app.source_peer_id,
                destination,
                "no router serves destination, dropping message"
            );
            return Ok(RouteOutcome::Unreachable);
        }

        let mut delivered = 0;
        let mut hops = BTreeSet::new();
        for address in serving {
            if address == local {
                for (peer, connection) in self.attached.matching(destination) {
                    if self.transport.try_send(connection, &envelope) {
                        delivered += 1;
                    } else {
                        tracing::warn!(%peer, %connection, "peer queue full, dropping message");
                    }
                }
                continue;
            }
            match self.topology.next_hop(&address) {
                Ok(hop) => {
                    hops.insert(hop);
                }
                Err(e) => tracing::warn!(destination, error = %e, "cannot forward message"),
            }
        }

        let mut forwarded = 0;
        for hop in hops {
            let Some(connection) = self.routers.connection(&hop) else {
                tracing::warn!(%hop, "next hop has no connection");
                continue;
            };
            if self.transport.send(connection, &envelope).await {
                tracing::debug!(destination, %hop, "message forwarded");
                forwarded += 1;
            } else {
                tracing::warn!(%hop, %connection, "forward failed, disconnecting hop");
                self.transport.disconnect(connection);
            }
        }

        Ok(RouteOutcome::Routed { delivered, forwarded })
    }

    pub(crate) fn apply_topology(&self, snapshot: &TopologySnapshot) -> bool {
        self.topology
            .update_and_recompute(&snapshot.source, snapshot.neighbor_addresses())
    }

    pub(crate) fn apply_peers(&self, snapshot: &PeerSnapshot) -> bool {
        self.peer_locations.update(&snapshot.source, &snapshot.peers)
    }

    /// Forward a gossip record to every connection except the one it came from.
    pub(crate) fn relay(&self, envelope: &Envelope, from: ConnectionId) -> usize {
        self.broadcast(envelope, &|c| c != from)
    }

    fn broadcast(&self, envelope: &Envelope, filter: ConnectionFilter<'_>) -> usize {
        self.transport.broadcast_to_inbound(envelope, filter)
            + self.transport.broadcast_to_outbound(envelope, filter)
    }

    fn gossip_stamp(&self) -> String {
        format!(
            "{}:{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.info.address
        )
    }

    /// Stamp, remember and flood one of our own snapshots.
    fn publish<T: Serialize>(&self, kind: MessageKind, body: &T) {
        let mut envelope = match Envelope::with_payload(kind, body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(%kind, error = %e, "failed to encode gossip");
                return;
            }
        };
        envelope.routing_trail.push(self.gossip_stamp());
        self.dedup.observe(&envelope);
        let reached = self.broadcast(&envelope, &all_connections);
        tracing::trace!(%kind, reached, "gossip published");
    }

    pub(crate) fn broadcast_topology(&self) {
        let snapshot = TopologySnapshot {
            source: self.info.address.clone(),
            neighbors: self.routers.routers(),
        };
        self.apply_topology(&snapshot);
        self.publish(MessageKind::TopologySync, &snapshot);
        self.topology_reset.notify_one();
    }

    pub(crate) fn broadcast_peers(&self) {
        let snapshot = PeerSnapshot {
            source: self.info.address.clone(),
            peers: self.attached.peers(),
        };
        self.apply_peers(&snapshot);
        self.publish(MessageKind::PeerSync, &snapshot);
        self.peers_reset.notify_one();
    }

    fn broadcast_router_request(&self) {
        self.broadcast(&Envelope::empty(MessageKind::RouterListRequest), &all_connections);
    }

    fn broadcast_keepalive(&self) {
        self.broadcast(&Envelope::empty(MessageKind::Keepalive), &all_connections);
    }

    /// Evict every connection idle for longer than twice the keepalive interval.
    pub(crate) fn sweep_liveness(self: &Arc<Self>) -> Vec<ConnectionId> {
        let stale = self.liveness.sweep(self.timings.liveness_threshold());
        for &connection in &stale {
            self.evict(connection);
        }
        stale
    }

    fn evict(self: &Arc<Self>, connection: ConnectionId) {
        if let Err(e) = self.states.apply(connection, ConnectionEvent::Evicted) {
            tracing::debug!(%connection, error = %e, "evicting connection in unexpected state");
        }
        self.states.remove(connection);
        let socket = self.untrack(connection);

        let peers = self.attached.detach_connection(connection);
        if !peers.is_empty() {
            tracing::info!(%connection, peers = peers.len(), "peer connection timed out");
            self.broadcast_peers();
        } else {
            let removed = self.routers.remove_by_connection(connection);
            if let Some(entry) = &removed {
                tracing::info!(router = %entry.info, %connection, "router connection timed out");
                self.broadcast_topology();
            }

            // A local port other than our listen port means we dialed out.
            // Socket facts come from `track`, since the transport drops a
            // socket as soon as the remote closes it.
            if let Some(socket) = socket {
                if Some(socket.local_addr.port()) != address_port(&self.info.address) {
                    self.spawn_reconnect(
                        socket.remote_addr.to_string(),
                        removed.map(|entry| entry.info.address),
                    );
                }
            }
        }
        self.transport.disconnect(connection);
    }

    pub(crate) fn summary(&self) -> RouterSummary {
        let routers = self.routers.addresses();
        let mut peers: Vec<String> = self.attached.peers().into_iter().map(|p| p.id).collect();
        peers.sort();
        RouterSummary {
            id: self.info.id.clone(),
            address: self.info.address.clone(),
            routers_cnt: routers.len(),
            routers,
            peers_cnt: peers.len(),
            peers,
        }
    }
}

/// Delay before discovery retry number `attempt` (zero based).
///
/// The first retry waits exactly `base`. Later retries double with jitter
/// and are capped at eight times `base`.
pub(crate) fn retry_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return base;
    }
    let factor = 1u32
        .checked_shl(attempt)
        .unwrap_or(MAX_RETRY_FACTOR)
        .min(MAX_RETRY_FACTOR);
    let ceiling = base * factor;
    let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
    ceiling.mul_f64(jitter).max(base)
}

fn interval_after(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// The coordinating loop. Returns `Ok` when the router is stopped.
async fn run(inner: Arc<RouterInner>, cancel: CancellationToken) -> Result<(), RouterError> {
    enum Action {
        Shutdown,
        Keepalive,
        RouterList,
        Topology,
        Peers,
        DedupGc,
        ResetTopology,
        ResetPeers,
    }

    let timings = inner.timings;
    let mut keepalive = interval_after(timings.keepalive);
    let mut router_list = interval_after(timings.routers);
    let mut topology = interval_after(timings.topology);
    let mut peers = interval_after(timings.peers);
    let mut dedup_gc = interval_after(timings.dedup_window);

    tracing::info!(router = %inner.info, "router loop started");

    loop {
        let action = tokio::select! {
            biased;
            _ = cancel.cancelled() => Action::Shutdown,
            _ = keepalive.tick() => Action::Keepalive,
            _ = router_list.tick() => Action::RouterList,
            _ = topology.tick() => Action::Topology,
            _ = peers.tick() => Action::Peers,
            _ = dedup_gc.tick() => Action::DedupGc,
            _ = inner.topology_reset.notified() => Action::ResetTopology,
            _ = inner.peers_reset.notified() => Action::ResetPeers,
        };

        match action {
            Action::Shutdown => {
                tracing::info!(router = %inner.info, "router loop stopped");
                return Ok(());
            }
            Action::Keepalive => {
                if !inner.transport.is_running() && !cancel.is_cancelled() {
                    return Err(RouterError::LoopFailure("transport stopped unexpectedly".into()));
                }
                let evicted = inner.sweep_liveness();
                if !evicted.is_empty() {
                    tracing::debug!(evicted = evicted.len(), "liveness sweep");
                }
                inner.broadcast_keepalive();
            }
            Action::RouterList => {
                let summary = serde_json::to_string(&inner.summary())
                    .map_err(|e| RouterError::LoopFailure(format!("summary encoding: {e}")))?;
                tracing::info!(%summary, "router information");
                inner.broadcast_router_request();
            }
            Action::Topology => inner.broadcast_topology(),
            Action::Peers => inner.broadcast_peers(),
            Action::DedupGc => {
                let expired = inner.dedup.gc();
                if expired > 0 {
                    tracing::trace!(expired, "dedup cache collected");
                }
            }
            Action::ResetTopology => topology.reset(),
            Action::ResetPeers => peers.reset(),
        }
    }
}

/// A relaynet router.
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router announcing `info` and bootstrapping from `discovery`.
    pub fn new(
        info: RouterInfo,
        discovery: Vec<String>,
        timings: Timings,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let topology = Topology::new(info.address.clone());
        tracing::info!(router = %info, "router created");
        Self {
            inner: Arc::new(RouterInner {
                topology,
                timings,
                bootstrap: discovery,
                transport,
                routers: RouterTable::new(),
                peer_locations: PeerLocationTable::new(),
                attached: AttachedPeers::new(),
                dedup: DedupCache::new(timings.dedup_window),
                liveness: LivenessTable::new(),
                states: ConnectionStates::new(),
                sockets: DashMap::new(),
                retrying: DashSet::new(),
                running: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                topology_reset: Notify::new(),
                peers_reset: Notify::new(),
                info,
            }),
        }
    }

    pub fn from_config(config: &RouterConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            RouterInfo::new(config.router.id.clone(), config.router.address.clone()),
            config.router.discovery.clone(),
            config.timings(),
            transport,
        )
    }

    /// Start the transport, bootstrap and spawn the coordinating loop.
    ///
    /// Returns `Ok(None)` with a warning when already running. The returned
    /// handle resolves when the loop ends.
    pub async fn start(&self) -> Result<Option<JoinHandle<Result<(), RouterError>>>, RouterError> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(router = %inner.info, "router is already running");
            return Ok(None);
        }

        let cancel = CancellationToken::new();
        *inner.cancel.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();
        inner.reset_tables();

        let handler = Arc::new(ProtocolHandler::new(Arc::clone(inner)));
        match inner.transport.start(handler).await {
            Ok(local_addr) => {
                tracing::info!(router = %inner.info, %local_addr, "router started");
            }
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        inner.discovery(inner.bootstrap.clone()).await;
        Ok(Some(tokio::spawn(run(Arc::clone(inner), cancel))))
    }

    /// Say goodbye to every neighbor and shut everything down.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            tracing::warn!(router = %inner.info, "router is already stopped");
            return;
        }

        match Envelope::with_payload(MessageKind::Close, &inner.info) {
            Ok(close) => {
                let reached = inner.broadcast(&close, &all_connections);
                tracing::debug!(reached, "CLOSE broadcast");
            }
            Err(e) => tracing::error!(error = %e, "failed to encode CLOSE"),
        }

        // The transport drains the queued CLOSE records before closing.
        inner.cancel_token().cancel();
        inner.transport.stop().await;
        tracing::info!(router = %inner.info, "router stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    pub fn address(&self) -> &str {
        &self.inner.info.address
    }

    pub fn timings(&self) -> Timings {
        self.inner.timings
    }

    /// Directly connected routers.
    pub fn routers(&self) -> Vec<RouterInfo> {
        self.inner.routers.routers()
    }

    /// Peers attached to this router.
    pub fn local_peers(&self) -> Vec<PeerInfo> {
        self.inner.attached.peers()
    }

    /// Every peer id known anywhere in the network.
    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.peer_locations.peer_ids()
    }

    /// Router addresses serving `destination` (exact id or `chain:` prefix).
    pub fn lookup_peer(&self, destination: &str) -> BTreeSet<String> {
        self.inner.peer_locations.lookup(destination)
    }

    pub fn next_hop(&self, address: &str) -> Result<String, RoutingError> {
        self.inner.topology.next_hop(address)
    }

    pub fn summary(&self) -> RouterSummary {
        self.inner.summary()
    }

    /// Connect to the given routers, retrying failures in the background.
    pub async fn discovery(&self, addresses: Vec<String>) {
        self.inner.discovery(addresses).await;
    }

    /// Loop-check, stamp and deliver or forward an APPLICATION record.
    pub async fn route_message(&self, envelope: Envelope) -> Result<RouteOutcome, RouterError> {
        self.inner.route_message(envelope).await
    }
}
