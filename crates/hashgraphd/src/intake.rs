//! Event intake pipeline
//!
//! Gossiped and locally created events pass the same stages:
//!
//! 1. integrity checks (hash, signature, parent arithmetic), run in
//!    parallel on the blocking pool;
//! 2. link into the shadowgraph;
//! 3. append to the preconsensus event stream and flush;
//! 4. hand over to consensus and the event creator.
//!
//! Stages 2-4 run under one lock so consensus receives events in exactly
//! the order they were linked and persisted. Gossiped batches commit on the
//! blocking pool, so a slow disk never stalls the async workers.

use crate::config::IntakeConfig;
use crate::pces::{PcesError, PcesWriter};
use crate::shadowgraph::{ShadowgraphError, Shadowgraph};
use hashgraph_core::crypto::{verify_event_hash, verify_event_signature};
use hashgraph_core::types::{
    expected_generation, Event, EventHash, EventWindow, NodeId, Roster, UnsignedEvent,
};
use hashgraph_net::crypto::CryptoError;
use hashgraph_net::KeyPair;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reasons an event is dropped before linking
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event {hash} was created by {creator}, who is not in the roster")]
    UnknownCreator { hash: EventHash, creator: NodeId },

    #[error("event {hash} has a {len}-byte signature")]
    SignatureLength { hash: EventHash, len: usize },

    #[error("event {0} does not match its hash")]
    HashMismatch(EventHash),

    #[error("event {0} has an invalid signature")]
    InvalidSignature(EventHash),

    #[error("event {hash} by {creator} has a self-parent created by {parent_creator}")]
    SelfParentCreatorMismatch {
        hash: EventHash,
        creator: NodeId,
        parent_creator: NodeId,
    },

    #[error("event {0} has an other-parent by its own creator")]
    OtherParentBySelf(EventHash),

    #[error("event {hash} has generation {actual}, parents imply {expected}")]
    GenerationMismatch {
        hash: EventHash,
        expected: u64,
        actual: u64,
    },

    #[error(
        "event {hash} has birth round {birth_round} below parent birth round {parent_birth_round}"
    )]
    BirthRoundBelowParent {
        hash: EventHash,
        birth_round: u64,
        parent_birth_round: u64,
    },

    #[error("event {0} is not created after its self-parent")]
    TimeNotIncreasing(EventHash),

    #[error("event {hash} carries {bytes} transaction bytes, limit is {limit}")]
    TransactionsTooLarge {
        hash: EventHash,
        bytes: usize,
        limit: usize,
    },

    #[error("event {hash} is ancient: birth round {birth_round} is below {ancient_threshold}")]
    Ancient {
        hash: EventHash,
        birth_round: u64,
        ancient_threshold: u64,
    },
}

/// Intake errors
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Shadowgraph error: {0}")]
    Link(#[from] ShadowgraphError),
    #[error("Preconsensus stream error: {0}")]
    Pces(#[from] PcesError),
    #[error("Signing error: {0}")]
    Signing(#[from] CryptoError),
    #[error("Intake task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Consensus input closed")]
    ConsensusClosed,
}

/// Stateless checks on an event, against the roster and the current window
pub fn verify_integrity(
    event: &Event,
    roster: &Roster,
    window: &EventWindow,
    max_transaction_bytes: usize,
) -> Result<(), ValidationError> {
    let hash = event.hash;
    let creator = event.creator();
    let entry = roster
        .entry(creator)
        .ok_or(ValidationError::UnknownCreator { hash, creator })?;

    if window.is_ancient(event.birth_round()) {
        return Err(ValidationError::Ancient {
            hash,
            birth_round: event.birth_round(),
            ancient_threshold: window.ancient_threshold,
        });
    }
    if event.signature.len() != 64 {
        return Err(ValidationError::SignatureLength {
            hash,
            len: event.signature.len(),
        });
    }

    if let Some(sp) = event.self_parent() {
        if sp.creator != creator {
            return Err(ValidationError::SelfParentCreatorMismatch {
                hash,
                creator,
                parent_creator: sp.creator,
            });
        }
    }
    if event.other_parent().is_some_and(|op| op.creator == creator) {
        return Err(ValidationError::OtherParentBySelf(hash));
    }
    let expected = expected_generation(event.self_parent(), event.other_parent());
    if event.generation() != expected {
        return Err(ValidationError::GenerationMismatch {
            hash,
            expected,
            actual: event.generation(),
        });
    }
    if let Some(parent_birth_round) = event.parents().map(|p| p.birth_round).max() {
        if event.birth_round() < parent_birth_round {
            return Err(ValidationError::BirthRoundBelowParent {
                hash,
                birth_round: event.birth_round(),
                parent_birth_round,
            });
        }
    }
    let bytes = event.unsigned.transaction_bytes();
    if bytes > max_transaction_bytes {
        return Err(ValidationError::TransactionsTooLarge {
            hash,
            bytes,
            limit: max_transaction_bytes,
        });
    }

    verify_event_hash(event).map_err(|_| ValidationError::HashMismatch(hash))?;
    verify_event_signature(&entry.public_key, event)
        .map_err(|_| ValidationError::InvalidSignature(hash))?;
    Ok(())
}

/// Outcome of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

/// Lifetime intake counters
#[derive(Debug, Clone, Copy, Default)]
pub struct IntakeStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    /// Events handed to consensus and not yet processed
    pub backlog: usize,
}

/// Where committed events go
struct Sink {
    pces: Option<PcesWriter>,
    consensus_tx: mpsc::UnboundedSender<Arc<Event>>,
    creator_tx: Option<mpsc::UnboundedSender<Arc<Event>>>,
}

/// Validates, links, persists and forwards events
pub struct EventIntake {
    roster: Arc<Roster>,
    config: IntakeConfig,
    shadowgraph: Arc<Shadowgraph>,
    sink: Mutex<Sink>,
    backlog: AtomicUsize,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

impl EventIntake {
    pub fn new(
        roster: Arc<Roster>,
        config: IntakeConfig,
        shadowgraph: Arc<Shadowgraph>,
        pces: Option<PcesWriter>,
        consensus_tx: mpsc::UnboundedSender<Arc<Event>>,
        creator_tx: Option<mpsc::UnboundedSender<Arc<Event>>>,
    ) -> Self {
        Self {
            roster,
            config,
            shadowgraph,
            sink: Mutex::new(Sink {
                pces,
                consensus_tx,
                creator_tx,
            }),
            backlog: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn shadowgraph(&self) -> &Arc<Shadowgraph> {
        &self.shadowgraph
    }

    /// Validate and commit events received from a peer, in order.
    ///
    /// Invalid events are logged and dropped; only storage failures and a
    /// closed consensus input are errors.
    pub async fn ingest_batch(
        self: &Arc<Self>,
        events: Vec<Event>,
    ) -> Result<IntakeSummary, IntakeError> {
        let mut summary = IntakeSummary::default();
        let fresh: Vec<Event> = events
            .into_iter()
            .filter(|e| {
                let known = self.shadowgraph.contains(&e.hash);
                if known {
                    summary.duplicates += 1;
                }
                !known
            })
            .collect();

        let window = self.shadowgraph.window();
        let mut verified = Vec::with_capacity(fresh.len());
        let mut chunks = Vec::new();
        let mut pending = fresh.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<Event> = pending
                .by_ref()
                .take(self.config.verify_batch_size)
                .collect();
            let roster = Arc::clone(&self.roster);
            let max_bytes = self.config.max_transaction_bytes;
            chunks.push(tokio::task::spawn_blocking(move || {
                chunk
                    .into_iter()
                    .map(|event| {
                        let result = verify_integrity(&event, &roster, &window, max_bytes);
                        (event, result)
                    })
                    .collect::<Vec<_>>()
            }));
        }
        for chunk in chunks {
            for (event, result) in chunk.await? {
                match result {
                    Ok(()) => verified.push(Arc::new(event)),
                    Err(e) => {
                        warn!("Dropping event: {}", e);
                        summary.rejected += 1;
                    }
                }
            }
        }

        // Appending and syncing the stream blocks under the sink lock
        let intake = Arc::clone(self);
        let committed =
            tokio::task::spawn_blocking(move || intake.commit(verified, true)).await??;
        summary.accepted += committed.accepted;
        summary.duplicates += committed.duplicates;
        summary.rejected += committed.rejected;

        self.duplicates
            .fetch_add(summary.duplicates as u64, Ordering::Relaxed);
        self.rejected
            .fetch_add(summary.rejected as u64, Ordering::Relaxed);
        Ok(summary)
    }

    /// Commit events read back from the preconsensus stream. They were
    /// validated before being stored and are not stored again.
    pub fn ingest_replayed(&self, events: Vec<Event>) -> Result<IntakeSummary, IntakeError> {
        self.commit(events.into_iter().map(Arc::new).collect(), false)
    }

    /// Sign a locally created event and commit it
    pub fn create_local(
        &self,
        unsigned: UnsignedEvent,
        keypair: &KeyPair,
    ) -> Result<Arc<Event>, IntakeError> {
        let event = Arc::new(keypair.sign_event(unsigned)?);
        let mut sink = self.sink.lock();
        self.check_self_parent_time(&event)?;
        self.shadowgraph.link(Arc::clone(&event))?;
        if let Some(pces) = sink.pces.as_mut() {
            pces.append(&event)?;
            pces.flush()?;
        }
        self.forward(&mut sink, &event)?;
        self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(event)
    }

    fn commit(
        &self,
        events: Vec<Arc<Event>>,
        persist: bool,
    ) -> Result<IntakeSummary, IntakeError> {
        let mut summary = IntakeSummary::default();
        let mut sink = self.sink.lock();

        let mut linked = Vec::with_capacity(events.len());
        for event in events {
            if let Err(e) = self.check_self_parent_time(&event) {
                warn!("Dropping event: {}", e);
                summary.rejected += 1;
                continue;
            }
            match self.shadowgraph.link(Arc::clone(&event)) {
                Ok(_) => linked.push(event),
                Err(ShadowgraphError::Duplicate(_)) => summary.duplicates += 1,
                Err(e) => {
                    warn!("Dropping event: {}", e);
                    summary.rejected += 1;
                }
            }
        }

        if persist {
            if let Some(pces) = sink.pces.as_mut() {
                for event in &linked {
                    pces.append(event)?;
                }
                pces.flush()?;
            }
        }
        for event in &linked {
            self.forward(&mut sink, event)?;
        }

        summary.accepted = linked.len();
        self.accepted
            .fetch_add(summary.accepted as u64, Ordering::Relaxed);
        if summary.accepted > 0 {
            debug!(
                "Committed {} events ({} duplicates, {} rejected)",
                summary.accepted, summary.duplicates, summary.rejected
            );
        }
        Ok(summary)
    }

    fn check_self_parent_time(&self, event: &Event) -> Result<(), ValidationError> {
        let Some(sp) = event.self_parent() else {
            return Ok(());
        };
        match self.shadowgraph.get(&sp.hash) {
            Some(parent) if event.time_created() <= parent.event.time_created() => {
                Err(ValidationError::TimeNotIncreasing(event.hash))
            }
            _ => Ok(()),
        }
    }

    fn forward(&self, sink: &mut Sink, event: &Arc<Event>) -> Result<(), IntakeError> {
        sink.consensus_tx
            .send(Arc::clone(event))
            .map_err(|_| IntakeError::ConsensusClosed)?;
        self.backlog.fetch_add(1, Ordering::AcqRel);
        let creator_closed = sink
            .creator_tx
            .as_ref()
            .is_some_and(|tx| tx.send(Arc::clone(event)).is_err());
        if creator_closed {
            sink.creator_tx = None;
        }
        Ok(())
    }

    /// Events handed to consensus and not yet processed
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    /// Called by the consensus loop after it processed `count` events
    pub fn mark_processed(&self, count: usize) {
        let _ = self
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(count))
            });
    }

    pub fn stats(&self) -> IntakeStats {
        IntakeStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            backlog: self.backlog(),
        }
    }

    // =========================================================================
    // PRECONSENSUS STREAM MAINTENANCE
    // =========================================================================

    /// Stop storing ancient events and drop files that became ancient
    pub fn prune_pces(&self, ancient_threshold: u64) -> Result<usize, PcesError> {
        let mut sink = self.sink.lock();
        let Some(pces) = sink.pces.as_mut() else {
            return Ok(0);
        };
        if ancient_threshold > pces.minimum_birth_round_to_store() {
            pces.set_minimum_birth_round_to_store(ancient_threshold)?;
        }
        pces.compact(ancient_threshold)
    }

    pub fn register_pces_discontinuity(&self, origin_round: u64) -> Result<(), PcesError> {
        match self.sink.lock().pces.as_mut() {
            Some(pces) => pces.register_discontinuity(origin_round),
            None => Ok(()),
        }
    }

    pub fn close_pces(&self) -> Result<(), PcesError> {
        match self.sink.lock().pces.as_mut() {
            Some(pces) => pces.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pces::replay_events;
    use crate::test_util::TestNetwork;
    use hashgraph_core::types::Timestamp;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Harness {
        intake: Arc<EventIntake>,
        consensus_rx: mpsc::UnboundedReceiver<Arc<Event>>,
    }

    fn harness(net: &TestNetwork, pces: Option<PcesWriter>) -> Harness {
        let (consensus_tx, consensus_rx) = mpsc::unbounded_channel();
        let intake = Arc::new(EventIntake::new(
            net.roster.clone(),
            IntakeConfig {
                verify_batch_size: 3,
                ..IntakeConfig::default()
            },
            Arc::new(Shadowgraph::new()),
            pces,
            consensus_tx,
            None,
        ));
        Harness {
            intake,
            consensus_rx,
        }
    }

    fn owned(events: &[Arc<Event>]) -> Vec<Event> {
        events.iter().map(|e| (**e).clone()).collect()
    }

    #[tokio::test]
    async fn test_batch_is_linked_persisted_and_forwarded() {
        let dir = tempdir().unwrap();
        let mut net = TestNetwork::new(4);
        let events = net.ring(10);
        let pces = PcesWriter::open(dir.path(), 100, 1).unwrap();
        let mut h = harness(&net, Some(pces));

        let summary = h.intake.ingest_batch(owned(&events)).await.unwrap();
        assert_eq!(summary.accepted, 10);
        assert_eq!(h.intake.shadowgraph().len(), 10);
        assert_eq!(h.intake.backlog(), 10);

        for expected in &events {
            assert_eq!(h.consensus_rx.recv().await.unwrap().hash, expected.hash);
        }
        let stored = replay_events(dir.path(), 1, 1).unwrap();
        assert_eq!(stored, owned(&events));

        h.intake.mark_processed(10);
        assert_eq!(h.intake.backlog(), 0);
    }

    #[tokio::test]
    async fn test_commit_runs_off_the_runtime_thread() {
        let dir = tempdir().unwrap();
        let mut net = TestNetwork::new(4);
        let events = net.ring(4);
        let pces = PcesWriter::open(dir.path(), 100, 1).unwrap();
        let h = harness(&net, Some(pces));

        // A commit waiting on the sink lock leaves this single thread free
        let guard = h.intake.sink.lock();
        let intake = Arc::clone(&h.intake);
        let batch = owned(&events);
        let ingest = tokio::spawn(async move { intake.ingest_batch(batch).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ingest.is_finished());
        drop(guard);

        let summary = ingest.await.unwrap().unwrap();
        assert_eq!(summary.accepted, 4);
        assert_eq!(replay_events(dir.path(), 1, 1).unwrap(), owned(&events));
    }

    #[tokio::test]
    async fn test_duplicates_and_invalid_events_are_dropped() {
        let mut net = TestNetwork::new(2);
        let a = net.event(0, None, None);
        let mut forged = (*net.event(1, None, None)).clone();
        forged.signature = net.key(0).sign(b"not the event").to_vec();
        let mut tampered = (*net.event(1, None, None)).clone();
        tampered.unsigned.transactions.push(vec![9]);

        let h = harness(&net, None);
        let summary = h
            .intake
            .ingest_batch(vec![(*a).clone(), (*a).clone(), forged, tampered])
            .await
            .unwrap();
        assert_eq!(
            summary,
            IntakeSummary {
                accepted: 1,
                duplicates: 1,
                rejected: 2
            }
        );
        assert_eq!(h.intake.stats().rejected, 2);
    }

    #[test]
    fn test_integrity_rules() {
        let mut net = TestNetwork::new(2);
        let roster = net.roster.clone();
        let window = EventWindow::genesis();
        let a = net.event(0, None, None);
        let b = net.event(1, None, None);
        let check = |event: &Event| verify_integrity(event, &roster, &window, 16);

        assert!(check(&a).is_ok());

        let mut unsigned = net.unsigned(0, Some(&a), None, 1);
        unsigned.generation = 5;
        assert!(matches!(
            check(&net.sign(0, unsigned)),
            Err(ValidationError::GenerationMismatch { expected: 2, .. })
        ));

        let unsigned = net.unsigned(0, Some(&b), None, 1);
        assert!(matches!(
            check(&net.sign(0, unsigned)),
            Err(ValidationError::SelfParentCreatorMismatch { .. })
        ));

        let unsigned = net.unsigned(0, None, Some(&a), 1);
        assert!(matches!(
            check(&net.sign(0, unsigned)),
            Err(ValidationError::OtherParentBySelf(_))
        ));

        let late = net.event_in_round(1, None, None, 3);
        let unsigned = net.unsigned(0, Some(&a), Some(&late), 2);
        assert!(matches!(
            check(&net.sign(0, unsigned)),
            Err(ValidationError::BirthRoundBelowParent { .. })
        ));

        let mut unsigned = net.unsigned(0, Some(&a), None, 1);
        unsigned.transactions = vec![vec![0; 17]];
        assert!(matches!(
            check(&net.sign(0, unsigned)),
            Err(ValidationError::TransactionsTooLarge { bytes: 17, .. })
        ));

        let mut unsigned = net.unsigned(0, None, None, 1);
        unsigned.creator = NodeId(7);
        assert!(matches!(
            check(&net.sign(0, unsigned)),
            Err(ValidationError::UnknownCreator { .. })
        ));

        let mut short = (*a).clone();
        short.signature.truncate(10);
        assert!(matches!(
            check(&short),
            Err(ValidationError::SignatureLength { len: 10, .. })
        ));
    }

    #[tokio::test]
    async fn test_ancient_event_rejected() {
        let mut net = TestNetwork::new(2);
        let h = harness(&net, None);
        h.intake.shadowgraph().expire(EventWindow {
            pending_consensus_round: 4,
            event_birth_round_floor: 4,
            ancient_threshold: 3,
            expired_threshold: 1,
        });

        let old = net.event_in_round(0, None, None, 2);
        let summary = h.intake.ingest_batch(vec![(*old).clone()]).await.unwrap();
        assert_eq!(summary.rejected, 1);
        assert!(!h.intake.shadowgraph().contains(&old.hash));
    }

    #[tokio::test]
    async fn test_time_must_increase_along_chain() {
        let mut net = TestNetwork::new(1);
        let a = net.event(0, None, None);
        let mut unsigned = net.unsigned(0, Some(&a), None, 1);
        unsigned.time_created = Timestamp(a.time_created().0 - 1);
        let stale = net.sign(0, unsigned);

        let h = harness(&net, None);
        let summary = h
            .intake
            .ingest_batch(vec![(*a).clone(), (*stale).clone()])
            .await
            .unwrap();
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.rejected, 1);
    }

    #[tokio::test]
    async fn test_create_local_and_replay() {
        let dir = tempdir().unwrap();
        let mut net = TestNetwork::new(1);
        let pces = PcesWriter::open(dir.path(), 100, 1).unwrap();
        let mut h = harness(&net, Some(pces));

        let unsigned = net.unsigned(0, None, None, 1);
        let event = h.intake.create_local(unsigned, net.key(0)).unwrap();
        assert_eq!(h.consensus_rx.recv().await.unwrap().hash, event.hash);

        let replayed = replay_events(dir.path(), 1, 1).unwrap();
        let fresh = harness(&net, None);
        let summary = fresh.intake.ingest_replayed(replayed).unwrap();
        assert_eq!(summary.accepted, 1);
        assert!(fresh.intake.shadowgraph().contains(&event.hash));
    }
}
