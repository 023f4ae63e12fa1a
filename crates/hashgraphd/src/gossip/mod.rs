//! Gossip service
//!
//! Keeps one long-lived connection per roster peer. The node with the
//! smaller id dials and initiates every sync on that connection; the other
//! side only responds. Outgoing syncs are bounded by [`SyncPermitProvider`].

pub mod fallen_behind;
pub mod permits;
pub mod protocol;

pub use fallen_behind::FallenBehindMonitor;
pub use permits::{PermitMetrics, SyncPermit, SyncPermitProvider};
pub use protocol::{SyncContext, SyncError, SyncOutcome};

use crate::config::SyncConfig;
use hashgraph_core::types::NodeId;
use hashgraph_net::{Message, PeerConnection, PeerInfo, TlsContext, Transport};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Connection state of a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Handshaking,
    Syncing,
    /// The last exchange found this node behind the peer
    FallenBehind,
}

/// Per-peer bookkeeping
#[derive(Clone, Debug)]
pub struct PeerStats {
    pub state: PeerState,
    /// End of the last completed exchange
    pub last_sync: Option<Instant>,
    pub sync_count: u64,
    /// Failed connections and exchanges
    pub failures: u32,
    pub events_sent: u64,
    pub events_received: u64,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            state: PeerState::Disconnected,
            last_sync: None,
            sync_count: 0,
            failures: 0,
            events_sent: 0,
            events_received: 0,
        }
    }
}

/// Gossip statistics
#[derive(Debug, Clone)]
pub struct GossipStats {
    pub peer_count: usize,
    pub connected: usize,
    pub total_syncs: u64,
    pub events_sent: u64,
    pub events_received: u64,
    pub permits: PermitMetrics,
}

/// Dials, accepts and drives sync connections
pub struct Gossip {
    ctx: SyncContext,
    config: SyncConfig,
    transport: Transport,
    permits: SyncPermitProvider,
    peers: RwLock<HashMap<NodeId, PeerStats>>,
}

impl Gossip {
    /// `peers` is the address book of the roster; this node's own entry is
    /// skipped. `tls` presents this node's certificate.
    pub fn new(
        ctx: SyncContext,
        tls: TlsContext,
        peers: Vec<PeerInfo>,
        config: SyncConfig,
    ) -> Self {
        let transport = Transport::new(tls, config.connect_timeout(), config.max_frame_size);
        let mut stats = HashMap::new();
        for peer in peers {
            if peer.node_id == ctx.self_id {
                continue;
            }
            stats.insert(peer.node_id, PeerStats::default());
            transport.add_peer(peer);
        }
        let permits = SyncPermitProvider::new(config.permits);
        Self {
            ctx,
            config,
            transport,
            permits,
            peers: RwLock::new(stats),
        }
    }

    /// Bind the gossip listener
    pub async fn bind(&self, addr: SocketAddr) -> Result<TcpListener, SyncError> {
        Ok(self.transport.bind(addr).await?)
    }

    pub fn permits(&self) -> &SyncPermitProvider {
        &self.permits
    }

    pub fn fallen_behind(&self) -> &Arc<FallenBehindMonitor> {
        &self.ctx.fallen_behind
    }

    /// Accept peers and keep outgoing connections alive until shutdown
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<(), SyncError> {
        if let Ok(addr) = listener.local_addr() {
            info!("Gossip listening on {}", addr);
        }
        let dial_handles: Vec<JoinHandle<()>> = self
            .transport
            .peers()
            .into_iter()
            .filter(|peer| PeerInfo::dials(self.ctx.self_id, peer.node_id))
            .map(|peer| self.spawn_dial_task(peer.node_id))
            .collect();

        let mut inbound = JoinSet::new();
        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = self.transport.accept(&listener) => {
                    match result {
                        Ok((stream, addr)) => {
                            let gossip = Arc::clone(&self);
                            inbound.spawn(async move {
                                if let Err(e) = gossip.run_inbound(stream, addr).await {
                                    debug!("Inbound connection from {} ended: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => warn!("Accept error: {}", e),
                    }
                }
                Some(_) = inbound.join_next(), if !inbound.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Gossip shutting down");
                    break;
                }
            }
        }

        for handle in &dial_handles {
            handle.abort();
        }
        futures::future::join_all(dial_handles).await;
        inbound.shutdown().await;
        Ok(())
    }

    fn spawn_dial_task(self: &Arc<Self>, peer: NodeId) -> JoinHandle<()> {
        let gossip = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = gossip.run_outbound(peer).await {
                    warn!("Connection to {} failed: {}", peer, e);
                    gossip.record_failure(peer);
                }
                gossip.set_state(peer, PeerState::Disconnected);

                let backoff = gossip.config.reconnect_backoff();
                let jitter_ms =
                    rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                sleep(backoff + Duration::from_millis(jitter_ms)).await;
            }
        })
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    async fn run_outbound(&self, peer: NodeId) -> Result<(), SyncError> {
        let mut conn = self.transport.connect(peer).await?;
        self.set_state(peer, PeerState::Handshaking);
        let remote = self.handshake(&mut conn).await?;
        if remote != peer {
            return Err(SyncError::UnexpectedPeer(remote));
        }
        info!("Connected to {}", peer);
        self.set_state(peer, PeerState::Syncing);

        let keepalive = self.config.sync_timeout() / 2;
        loop {
            let permit = tokio::select! {
                permit = self.permits.acquire() => permit,
                _ = sleep(keepalive) => {
                    self.ping(&mut conn).await?;
                    continue;
                }
            };
            let outcome = timeout(
                self.config.sync_timeout(),
                protocol::initiate(&mut conn, &self.ctx, peer),
            )
            .await
            .map_err(|_| SyncError::Timeout)??;
            drop(permit);
            self.record_outcome(peer, outcome);
            sleep(self.config.sync_interval()).await;
        }
    }

    async fn run_inbound(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), SyncError> {
        let mut conn = self.transport.secure_inbound(stream, addr).await?;
        let peer = self.handshake(&mut conn).await?;
        // Only known peers with a smaller id dial this node
        if self.transport.get_peer(peer).is_none() || !PeerInfo::dials(peer, self.ctx.self_id) {
            return Err(SyncError::UnexpectedPeer(peer));
        }
        info!("Accepted {}", peer);
        self.set_state(peer, PeerState::Syncing);

        let result = self.serve(&mut conn, peer).await;
        self.set_state(peer, PeerState::Disconnected);
        if let Err(e) = &result {
            self.record_failure(peer);
            warn!("Connection from {} failed: {}", peer, e);
        }
        result
    }

    async fn serve(&self, conn: &mut PeerConnection, peer: NodeId) -> Result<(), SyncError> {
        loop {
            let message = match conn.recv().await {
                Ok(message) => message,
                Err(hashgraph_net::TransportError::ConnectionClosed) => {
                    debug!("{} closed the connection", peer);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            match message {
                Message::Ping => conn.send(&Message::Pong).await?,
                Message::SyncData(theirs) => {
                    let outcome = timeout(
                        self.config.sync_timeout(),
                        protocol::respond(conn, &self.ctx, peer, theirs),
                    )
                    .await
                    .map_err(|_| SyncError::Timeout)??;
                    self.record_outcome(peer, outcome);
                }
                other => {
                    return Err(SyncError::UnexpectedMessage {
                        expected: "sync-data",
                        got: other.name(),
                    })
                }
            }
        }
    }

    async fn handshake(&self, conn: &mut PeerConnection) -> Result<NodeId, SyncError> {
        timeout(
            self.config.connect_timeout(),
            protocol::handshake(conn, &self.ctx),
        )
        .await
        .map_err(|_| SyncError::Timeout)?
    }

    async fn ping(&self, conn: &mut PeerConnection) -> Result<(), SyncError> {
        conn.send(&Message::Ping).await?;
        let reply = timeout(self.config.connect_timeout(), conn.recv())
            .await
            .map_err(|_| SyncError::Timeout)??;
        match reply {
            Message::Pong => Ok(()),
            other => Err(SyncError::UnexpectedMessage {
                expected: "pong",
                got: other.name(),
            }),
        }
    }

    // =========================================================================
    // BOOKKEEPING
    // =========================================================================

    fn set_state(&self, peer: NodeId, state: PeerState) {
        if let Some(stats) = self.peers.write().get_mut(&peer) {
            stats.state = state;
        }
    }

    fn record_failure(&self, peer: NodeId) {
        if let Some(stats) = self.peers.write().get_mut(&peer) {
            stats.failures += 1;
        }
    }

    fn record_outcome(&self, peer: NodeId, outcome: SyncOutcome) {
        let mut peers = self.peers.write();
        let Some(stats) = peers.get_mut(&peer) else {
            return;
        };
        stats.last_sync = Some(Instant::now());
        stats.sync_count += 1;
        match outcome {
            SyncOutcome::Completed { sent, received } => {
                stats.state = PeerState::Syncing;
                stats.events_sent += sent as u64;
                stats.events_received += received.accepted as u64;
            }
            SyncOutcome::SelfFallenBehind => stats.state = PeerState::FallenBehind,
            SyncOutcome::PeerFallenBehind => stats.state = PeerState::Syncing,
        }
    }

    pub fn peer_stats(&self, peer: NodeId) -> Option<PeerStats> {
        self.peers.read().get(&peer).cloned()
    }

    pub fn stats(&self) -> GossipStats {
        let peers = self.peers.read();
        GossipStats {
            peer_count: peers.len(),
            connected: peers
                .values()
                .filter(|s| s.state != PeerState::Disconnected)
                .count(),
            total_syncs: peers.values().map(|s| s.sync_count).sum(),
            events_sent: peers.values().map(|s| s.events_sent).sum(),
            events_received: peers.values().map(|s| s.events_received).sum(),
            permits: self.permits.metrics(),
        }
    }
}
