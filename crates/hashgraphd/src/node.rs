//! hashgraphd node - wires intake, consensus, creation and gossip

use crate::config::{NodeState, PlatformConfig};
use crate::creator::{EventCreator, TransactionPool};
use crate::gossip::{FallenBehindMonitor, Gossip, SyncContext, SyncError};
use crate::intake::{EventIntake, IntakeError};
use crate::pces::{self, PcesError, PcesWriter};
use crate::shadowgraph::Shadowgraph;
use crate::storage::{Storage, StorageError};
use hashgraph_consensus::{ConsensusEngine, ConsensusError};
use hashgraph_core::crypto::roster_digest;
use hashgraph_core::types::{
    ConsensusRound, Event, EventWindow, NodeId, PlatformStatusAction, Roster, Timestamp,
};
use hashgraph_net::{KeyPair, PeerInfo, TlsContext, TlsError, TlsIdentity};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Snapshots kept in storage behind the latest one
const SNAPSHOTS_RETAINED: u64 = 8;

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Preconsensus stream error: {0}")]
    Pces(#[from] PcesError),
    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("Gossip error: {0}")]
    Sync(#[from] SyncError),
    #[error("Core error: {0}")]
    Core(#[from] hashgraph_core::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("{0} is not in the roster")]
    NotInRoster(NodeId),
    #[error("Signing key does not match the roster key of {0}")]
    KeyMismatch(NodeId),
    #[error("TLS certificate does not match the one pinned for {0}")]
    CertificateMismatch(NodeId),
    #[error("Stored identity belongs to {stored}, not {configured}")]
    IdentityMismatch { stored: NodeId, configured: NodeId },
}

/// Everything a node is built from
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub node_id: NodeId,
    pub listen: SocketAddr,
    /// Holds `db/` and `pces/`
    pub data_dir: PathBuf,
    pub roster: Arc<Roster>,
    /// Gossip addresses of the roster members
    pub peers: Vec<PeerInfo>,
    /// Overrides the stored key seed
    pub key_seed: Option<[u8; 32]>,
    /// Certificate presented on peer links
    pub tls: TlsIdentity,
    pub platform: PlatformConfig,
}

/// A running consensus node
pub struct Node {
    node_id: NodeId,
    listen: SocketAddr,
    platform: PlatformConfig,
    keypair: KeyPair,
    storage: Arc<Storage>,
    engine: ConsensusEngine,
    intake: Arc<EventIntake>,
    creator: EventCreator,
    pool: Arc<TransactionPool>,
    gossip: Arc<Gossip>,
    pces_dir: PathBuf,
    /// Round of the restored snapshot, zero at genesis
    starting_round: u64,
    consensus_rx: mpsc::UnboundedReceiver<Arc<Event>>,
    creator_rx: mpsc::UnboundedReceiver<Arc<Event>>,
    status_tx: broadcast::Sender<PlatformStatusAction>,
    rounds_tx: broadcast::Sender<ConsensusRound>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Open storage, restore the latest snapshot and assemble the components
    pub fn new(options: NodeOptions) -> Result<Self, NodeError> {
        let NodeOptions {
            node_id,
            listen,
            data_dir,
            roster,
            peers,
            key_seed,
            tls,
            platform,
        } = options;

        let storage = Arc::new(Storage::open(data_dir.join("db"))?);
        let keypair = load_keypair(&storage, node_id, key_seed)?;
        let entry = roster.entry(node_id).ok_or(NodeError::NotInRoster(node_id))?;
        if entry.public_key != keypair.public_key() {
            return Err(NodeError::KeyMismatch(node_id));
        }
        let pinned = peers.iter().find(|p| p.node_id == node_id);
        if pinned.is_some_and(|p| p.tls_certificate != tls.certificate()) {
            return Err(NodeError::CertificateMismatch(node_id));
        }
        let tls = TlsContext::new(tls)?;

        let mut engine = ConsensusEngine::new(Arc::clone(&roster), platform.consensus.clone())?;
        let starting_round = match storage.latest_snapshot()? {
            Some(snapshot) => {
                engine.load_snapshot(&snapshot)?;
                snapshot.round
            }
            None => 0,
        };
        let window = engine.event_window();

        let pces_dir = data_dir.join("pces");
        let mut pces = PcesWriter::open(
            &pces_dir,
            platform.pces.preferred_file_event_count,
            starting_round,
        )?;
        if window.ancient_threshold > pces.minimum_birth_round_to_store() {
            pces.set_minimum_birth_round_to_store(window.ancient_threshold)?;
        }

        let shadowgraph = Arc::new(Shadowgraph::new());
        shadowgraph.expire(window);
        let (consensus_tx, consensus_rx) = mpsc::unbounded_channel();
        let (creator_tx, creator_rx) = mpsc::unbounded_channel();
        let intake = Arc::new(EventIntake::new(
            Arc::clone(&roster),
            platform.intake.clone(),
            shadowgraph,
            Some(pces),
            consensus_tx,
            Some(creator_tx),
        ));

        let mut creator = EventCreator::new(node_id, Arc::clone(&roster), platform.creator.clone())
            .ok_or(NodeError::NotInRoster(node_id))?;
        creator.set_event_window(window);

        let (status_tx, _) = broadcast::channel(1024);
        let (rounds_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);

        let fallen_behind = Arc::new(FallenBehindMonitor::new(
            node_id,
            Arc::clone(&roster),
            platform.sync.fallen_behind_threshold,
            status_tx.clone(),
        ));
        let ctx = SyncContext {
            self_id: node_id,
            roster_digest: roster_digest(&roster)?,
            intake: Arc::clone(&intake),
            fallen_behind,
            max_events_per_message: platform.sync.max_events_per_message,
        };
        let gossip = Arc::new(Gossip::new(ctx, tls, peers, platform.sync.clone()));
        let pool = Arc::new(TransactionPool::new(platform.creator.max_pool_size));

        Ok(Self {
            node_id,
            listen,
            platform,
            keypair,
            storage,
            engine,
            intake,
            creator,
            pool,
            gossip,
            pces_dir,
            starting_round,
            consensus_rx,
            creator_rx,
            status_tx,
            rounds_tx,
            shutdown_tx,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.keypair.public_key()
    }

    /// Transactions submitted here are packed into this node's next events
    pub fn transaction_pool(&self) -> Arc<TransactionPool> {
        Arc::clone(&self.pool)
    }

    /// Decided rounds, in order
    pub fn subscribe_rounds(&self) -> broadcast::Receiver<ConsensusRound> {
        self.rounds_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<PlatformStatusAction> {
        self.status_tx.subscribe()
    }

    /// Sending on the returned channel stops a running node
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Replay the preconsensus stream, then run until shutdown
    pub async fn run(self) -> Result<(), NodeError> {
        let Node {
            node_id,
            listen,
            platform,
            keypair,
            storage,
            engine,
            intake,
            creator,
            pool,
            gossip,
            pces_dir,
            starting_round,
            consensus_rx,
            creator_rx,
            status_tx,
            rounds_tx,
            shutdown_tx,
        } = self;

        info!("Starting {} (snapshot round {})", node_id, starting_round);
        let window = engine.event_window();
        let mut shutdown_rx = shutdown_tx.subscribe();

        let (window_tx, window_rx) = watch::channel(window);
        let mut consensus = ConsensusTask {
            node_id,
            engine,
            intake: Arc::clone(&intake),
            storage: Arc::clone(&storage),
            consensus_rx,
            window_tx,
            status_tx: status_tx.clone(),
            rounds_tx,
            shutdown_tx: shutdown_tx.clone(),
        };

        // Replay before any task consumes events so consensus sees them first
        let _ = status_tx.send(PlatformStatusAction::ReplayStarted);
        let replayed = pces::replay_events(&pces_dir, starting_round, window.ancient_threshold)?;
        let summary = intake.ingest_replayed(replayed)?;
        if let Err(e) = consensus.apply_replay() {
            error!("Replay does not match snapshot round {}: {}", starting_round, e);
            let _ = status_tx.send(PlatformStatusAction::CatastrophicFailure {
                reason: e.to_string(),
            });
            drop(consensus);
            intake.close_pces()?;
            storage.flush()?;
            return Err(e.into());
        }
        info!("Replayed {} preconsensus events", summary.accepted);
        let _ = status_tx.send(PlatformStatusAction::ReplayDone);

        let consensus_handle = spawn_consensus_task(consensus);
        let creator_handle = spawn_creator_task(CreatorTask {
            creator,
            keypair,
            intake: Arc::clone(&intake),
            pool,
            fallen_behind: Arc::clone(gossip.fallen_behind()),
            creator_rx,
            window_rx,
            shutdown_rx: shutdown_tx.subscribe(),
        });
        let health_handle = spawn_health_task(
            Arc::clone(&intake),
            Arc::clone(&gossip),
            platform.intake.max_backlog,
            platform.sync.health_check_interval(),
            shutdown_tx.subscribe(),
        );

        let listener = gossip.bind(listen).await?;
        let gossip_handle = tokio::spawn(Arc::clone(&gossip).run(listener, shutdown_tx.clone()));

        let _ = shutdown_rx.recv().await;
        info!("Shutting down {}", node_id);

        match gossip_handle.await {
            Ok(Err(e)) => warn!("Gossip stopped with error: {}", e),
            Err(e) => warn!("Gossip task failed: {}", e),
            Ok(Ok(())) => {}
        }
        let handles = [creator_handle, health_handle, consensus_handle];
        for handle in &handles {
            handle.abort();
        }
        // Tasks release storage only once they are dropped
        futures::future::join_all(handles).await;

        intake.close_pces()?;
        storage.flush()?;
        Ok(())
    }
}

fn load_keypair(
    storage: &Storage,
    node_id: NodeId,
    key_seed: Option<[u8; 32]>,
) -> Result<KeyPair, NodeError> {
    let stored = storage.node_state()?;
    if let Some(state) = &stored {
        if state.node_id != node_id {
            return Err(NodeError::IdentityMismatch {
                stored: state.node_id,
                configured: node_id,
            });
        }
    }
    let seed = match (key_seed, &stored) {
        (Some(seed), _) => seed,
        (None, Some(state)) => state.keypair_seed,
        (None, None) => KeyPair::generate().seed(),
    };
    if stored.as_ref().map(|s| s.keypair_seed) != Some(seed) {
        storage.put_node_state(&NodeState {
            keypair_seed: seed,
            node_id,
        })?;
    }
    Ok(KeyPair::from_seed(&seed))
}

// =============================================================================
// CONSENSUS TASK
// =============================================================================

struct ConsensusTask {
    node_id: NodeId,
    engine: ConsensusEngine,
    intake: Arc<EventIntake>,
    storage: Arc<Storage>,
    consensus_rx: mpsc::UnboundedReceiver<Arc<Event>>,
    window_tx: watch::Sender<EventWindow>,
    status_tx: broadcast::Sender<PlatformStatusAction>,
    rounds_tx: broadcast::Sender<ConsensusRound>,
    shutdown_tx: broadcast::Sender<()>,
}

fn spawn_consensus_task(mut task: ConsensusTask) -> JoinHandle<()> {
    let mut shutdown_rx = task.shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = task.consensus_rx.recv() => {
                    let result = task.engine.add_event(event);
                    task.intake.mark_processed(1);
                    match result {
                        Ok(rounds) => {
                            for round in rounds {
                                task.handle_round(round);
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            error!("Consensus failed: {}", e);
                            let _ = task.status_tx.send(PlatformStatusAction::CatastrophicFailure {
                                reason: e.to_string(),
                            });
                            let _ = task.shutdown_tx.send(());
                            break;
                        }
                        Err(e) => warn!("Event not added to consensus: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

impl ConsensusTask {
    /// Order the replayed events queued by intake and check they complete
    /// the restored snapshot
    fn apply_replay(&mut self) -> Result<(), ConsensusError> {
        while let Ok(event) = self.consensus_rx.try_recv() {
            let result = self.engine.add_event(event);
            self.intake.mark_processed(1);
            for round in result? {
                self.handle_round(round);
            }
        }
        self.engine.finish_replay()
    }

    fn handle_round(&mut self, round: ConsensusRound) {
        let window = round.event_window;
        info!(
            "Round {} decided: {} events, ancient threshold {}",
            round.round,
            round.events.len(),
            window.ancient_threshold
        );

        let expired = self.intake.shadowgraph().expire(window);
        debug!("Expired {} events from the shadowgraph", expired);
        self.window_tx.send_replace(window);
        if let Err(e) = self.intake.prune_pces(window.ancient_threshold) {
            warn!("Preconsensus compaction failed: {}", e);
        }
        if let Err(e) = self.storage.put_snapshot(&round.snapshot) {
            warn!("Failed to store snapshot of round {}: {}", round.round, e);
        }
        if let Err(e) = self
            .storage
            .prune_snapshots(round.round.saturating_sub(SNAPSHOTS_RETAINED))
        {
            warn!("Failed to prune snapshots: {}", e);
        }

        if round
            .events
            .iter()
            .any(|e| e.event.creator() == self.node_id)
        {
            let _ = self
                .status_tx
                .send(PlatformStatusAction::SelfEventReachedConsensus { round: round.round });
        }
        let _ = self.rounds_tx.send(round);
    }
}

// =============================================================================
// CREATOR TASK
// =============================================================================

struct CreatorTask {
    creator: EventCreator,
    keypair: KeyPair,
    intake: Arc<EventIntake>,
    pool: Arc<TransactionPool>,
    fallen_behind: Arc<FallenBehindMonitor>,
    creator_rx: mpsc::UnboundedReceiver<Arc<Event>>,
    window_rx: watch::Receiver<EventWindow>,
    shutdown_rx: broadcast::Receiver<()>,
}

fn spawn_creator_task(mut task: CreatorTask) -> JoinHandle<()> {
    let period = task
        .creator
        .config()
        .min_creation_interval()
        .max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                Some(event) = task.creator_rx.recv() => task.creator.register_event(&event),
                Ok(()) = task.window_rx.changed() => {
                    let window = *task.window_rx.borrow_and_update();
                    task.creator.set_event_window(window);
                }
                _ = ticker.tick() => {
                    if !task.try_create() {
                        break;
                    }
                }
                _ = task.shutdown_rx.recv() => break,
            }
        }
    })
}

impl CreatorTask {
    /// Returns false once intake no longer accepts events
    fn try_create(&mut self) -> bool {
        // Know every linked event before choosing parents
        while let Ok(event) = self.creator_rx.try_recv() {
            self.creator.register_event(&event);
        }
        if self.fallen_behind.has_fallen_behind() {
            return true;
        }
        let Some(unsigned) = self.creator.try_create_event(Timestamp::now(), &self.pool) else {
            return true;
        };
        match self.intake.create_local(unsigned, &self.keypair) {
            Ok(event) => {
                self.creator.register_event(&event);
                true
            }
            Err(IntakeError::ConsensusClosed) => false,
            Err(e) => {
                warn!("Failed to create event: {}", e);
                true
            }
        }
    }
}

// =============================================================================
// HEALTH TASK
// =============================================================================

/// Revoke every sync permit while consensus lags behind intake
fn spawn_health_task(
    intake: Arc<EventIntake>,
    gossip: Arc<Gossip>,
    max_backlog: usize,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let backlog = intake.backlog();
                    let permits = gossip.permits();
                    let revoked = permits.metrics().revoked;
                    if backlog > max_backlog && revoked < permits.capacity() {
                        warn!("Intake backlog {} above {}, pausing syncs", backlog, max_backlog);
                        permits.set_revoked(permits.capacity());
                    } else if backlog <= max_backlog && revoked > 0 {
                        info!("Intake backlog drained to {}, resuming syncs", backlog);
                        permits.set_revoked(0);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}
