//! Consensus engine
//!
//! Consumes linked events one at a time and emits a [`ConsensusRound`] for
//! every round whose witnesses all have a fame verdict. The engine is a plain
//! single-threaded state machine; callers serialize access to it.

use crate::config::{ConsensusConfig, ConsensusTimestampSource};
use crate::election::{Elections, Fame, RoundState};
use crate::error::ConsensusError;
use crate::graph::{EventMeta, Hashgraph};
use crate::ordering::{median, OrderingKey, TimestampAssigner};
use hashgraph_core::types::{
    expected_generation, ConsensusEvent, ConsensusRound, ConsensusSnapshot, Event,
    EventDescriptor, EventHash, EventWindow, JudgeId, MinimumJudgeInfo, Roster, Timestamp,
    ROUND_FIRST,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Judges of a loaded snapshot that have not been replayed yet
#[derive(Debug)]
struct PendingJudges {
    judges: Vec<EventHash>,
    missing: HashSet<EventHash>,
}

/// Virtual-voting consensus over a fixed roster
#[derive(Debug)]
pub struct ConsensusEngine {
    config: ConsensusConfig,
    roster: Arc<Roster>,
    graph: Hashgraph,
    elections: Elections,
    /// Zero until the first round is decided
    last_decided_round: u64,
    next_consensus_number: u64,
    timestamps: TimestampAssigner,
    /// Oldest round first, at most `rounds_expired` entries
    judge_info: VecDeque<MinimumJudgeInfo>,
    window: EventWindow,
    pending_judges: Option<PendingJudges>,
    latest_snapshot: Option<ConsensusSnapshot>,
    halted: bool,
}

impl ConsensusEngine {
    /// Create an engine starting from genesis
    pub fn new(roster: Arc<Roster>, config: ConsensusConfig) -> Result<Self, ConsensusError> {
        config.validate()?;
        let increment = config.min_timestamp_increment_nanos;
        Ok(Self {
            graph: Hashgraph::new(Arc::clone(&roster)),
            roster,
            elections: Elections::default(),
            last_decided_round: 0,
            next_consensus_number: 0,
            timestamps: TimestampAssigner::new(None, increment),
            judge_info: VecDeque::new(),
            window: EventWindow::genesis(),
            pending_judges: None,
            latest_snapshot: None,
            halted: false,
            config,
        })
    }

    /// Resume from a snapshot taken after `snapshot.round` was decided.
    ///
    /// Events replayed afterwards are held without rounds until every judge
    /// of the snapshot has arrived; their common ancestors are then treated
    /// as already ordered.
    pub fn load_snapshot(&mut self, snapshot: &ConsensusSnapshot) -> Result<(), ConsensusError> {
        if self.halted {
            return Err(ConsensusError::Halted);
        }
        if !self.graph.is_empty() || self.last_decided_round != 0 {
            return Err(ConsensusError::SnapshotAfterEvents);
        }

        self.last_decided_round = snapshot.round;
        self.next_consensus_number = snapshot.next_consensus_number;
        self.timestamps = TimestampAssigner::new(
            Some(snapshot.consensus_timestamp),
            self.config.min_timestamp_increment_nanos,
        );
        self.judge_info = snapshot.minimum_judge_info_list.iter().copied().collect();
        self.window = self.window_after(snapshot.round);

        let judges: Vec<EventHash> = snapshot.judge_ids.iter().map(|j| j.hash).collect();
        self.pending_judges = (!judges.is_empty()).then(|| PendingJudges {
            missing: judges.iter().copied().collect(),
            judges,
        });
        self.latest_snapshot = Some(snapshot.clone());

        info!(
            "Loaded consensus snapshot of round {} ({} judges, next number {})",
            snapshot.round,
            snapshot.judge_ids.len(),
            snapshot.next_consensus_number
        );
        Ok(())
    }

    /// Add an event whose parents were added before it.
    ///
    /// Returns the rounds decided as a consequence, oldest first. Duplicate
    /// and ancient events are ignored. Any error other than a misuse of
    /// [`load_snapshot`](Self::load_snapshot) halts the engine.
    pub fn add_event(&mut self, event: Arc<Event>) -> Result<Vec<ConsensusRound>, ConsensusError> {
        if self.halted {
            return Err(ConsensusError::Halted);
        }
        match self.add_event_inner(event) {
            Err(e) if e.is_fatal() => {
                error!("Consensus halted: {}", e);
                self.halted = true;
                Err(e)
            }
            result => result,
        }
    }

    /// Declare that every event stored before the snapshot was replayed.
    ///
    /// A snapshot whose judges did not all arrive means the replayed stream
    /// belongs to a different history. The engine halts instead of holding
    /// every later event without a round.
    pub fn finish_replay(&mut self) -> Result<(), ConsensusError> {
        if self.halted {
            return Err(ConsensusError::Halted);
        }
        let Some(pending) = &self.pending_judges else {
            return Ok(());
        };
        let e = ConsensusError::ReplayDiverged {
            round: self.last_decided_round,
            missing: pending.missing.len(),
        };
        error!("Consensus halted: {}", e);
        self.halted = true;
        Err(e)
    }

    fn add_event_inner(&mut self, event: Arc<Event>) -> Result<Vec<ConsensusRound>, ConsensusError> {
        let hash = event.hash;
        if self.graph.contains(&hash) {
            trace!("Ignoring duplicate event {}", hash);
            return Ok(Vec::new());
        }
        if self.window.is_ancient(event.birth_round()) {
            debug!(
                "Ignoring ancient event {} born in round {}",
                hash,
                event.birth_round()
            );
            return Ok(Vec::new());
        }

        let creator = event.creator();
        let creator_index = self
            .roster
            .index_of(creator)
            .ok_or(ConsensusError::UnknownCreator { hash, creator })?;
        if event.parents().any(|p| p.hash == hash) {
            return Err(ConsensusError::SelfReference { hash });
        }
        let expected = expected_generation(event.self_parent(), event.other_parent());
        if expected != event.generation() {
            return Err(ConsensusError::GenerationMismatch {
                hash,
                expected,
                actual: event.generation(),
            });
        }
        if let Some(sp) = event.self_parent() {
            if sp.creator != creator {
                return Err(ConsensusError::SelfParentCreatorMismatch {
                    hash,
                    creator,
                    parent_creator: sp.creator,
                });
            }
        }

        let self_parent = self.resolve_parent(hash, event.self_parent())?;
        let other_parent = self.resolve_parent(hash, event.other_parent())?;

        let branch_point = event.self_parent().map_or(0, |sp| sp.generation);
        if self.graph.chain_extends_past(creator_index, branch_point) {
            return Err(ConsensusError::Branch {
                hash,
                creator,
                generation: branch_point,
            });
        }

        let mut last_seen = vec![None; self.roster.len()];
        for parent in [self_parent, other_parent].iter().flatten() {
            if let Some(meta) = self.graph.get(parent) {
                for (seen, theirs) in last_seen.iter_mut().zip(&meta.last_seen) {
                    *seen = (*seen).max(*theirs);
                }
            }
        }
        last_seen[creator_index] = Some(event.generation());

        self.graph.insert(EventMeta {
            event,
            creator_index,
            self_parent,
            other_parent,
            round: None,
            witness: false,
            last_seen,
            consensus: false,
        });

        match self.pending_judges.as_mut() {
            Some(pending) => {
                pending.missing.remove(&hash);
                if !pending.missing.is_empty() {
                    return Ok(Vec::new());
                }
                let judges = std::mem::take(&mut pending.judges);
                self.pending_judges = None;
                self.seed_judges(&judges);
            }
            None => self.assign_round(hash),
        }

        Ok(self.decide_rounds())
    }

    /// Hash of a parent that is present, None for an absent ancient parent
    fn resolve_parent(
        &self,
        child: EventHash,
        descriptor: Option<&EventDescriptor>,
    ) -> Result<Option<EventHash>, ConsensusError> {
        match descriptor {
            None => Ok(None),
            Some(d) if self.graph.contains(&d.hash) => Ok(Some(d.hash)),
            Some(d) if self.window.is_ancient(d.birth_round) => Ok(None),
            Some(d) => Err(ConsensusError::MissingParent {
                hash: child,
                parent: d.hash,
            }),
        }
    }

    // =========================================================================
    // ROUNDS & WITNESSES
    // =========================================================================

    fn assign_round(&mut self, hash: EventHash) {
        let threshold = self.config.super_majority;
        let total = self.roster.total_weight();
        let Some(meta) = self.graph.get(&hash) else {
            return;
        };

        let round = if meta.event.parents().next().is_none() {
            Some(ROUND_FIRST)
        } else {
            [meta.self_parent, meta.other_parent]
                .iter()
                .flatten()
                .filter_map(|p| self.graph.get(p))
                .filter_map(|p| p.round)
                .max()
                .map(|r| {
                    let seen = self.graph.strongly_seen_witnesses(meta, r, threshold);
                    if threshold.is_satisfied_by(self.graph.creator_weight(seen), total) {
                        r + 1
                    } else {
                        r
                    }
                })
        };
        let witness = round.map_or(false, |r| {
            meta.self_parent
                .and_then(|sp| self.graph.get(&sp))
                .map_or(true, |sp| sp.round != Some(r))
        });

        if let Some(meta) = self.graph.get_mut(&hash) {
            meta.round = round;
            meta.witness = witness;
        }
        let (Some(round), true) = (round, witness) else {
            return;
        };
        if round >= self.last_decided_round {
            self.graph.add_witness(round, hash);
        }
        if round <= self.last_decided_round {
            debug!("Witness {} arrived after round {} was decided", hash, round);
            self.elections.set_verdict(hash, false);
        }
    }

    /// Install the judges of a loaded snapshot once all of them are present.
    fn seed_judges(&mut self, judges: &[EventHash]) {
        let round = self.last_decided_round;
        for hash in judges {
            if let Some(meta) = self.graph.get_mut(hash) {
                meta.round = Some(round);
                meta.witness = true;
            }
            self.graph.add_witness(round, *hash);
            self.elections.set_verdict(*hash, true);
        }

        let ordered: Vec<EventHash> = {
            let metas: Vec<&EventMeta> = judges.iter().filter_map(|h| self.graph.get(h)).collect();
            self.graph
                .events()
                .filter(|m| metas.iter().all(|j| j.sees(m)))
                .map(EventMeta::hash)
                .collect()
        };
        for hash in &ordered {
            if let Some(meta) = self.graph.get_mut(hash) {
                meta.consensus = true;
            }
        }

        let mut rest: Vec<(u64, EventHash)> = self
            .graph
            .events()
            .filter(|m| !m.consensus && !judges.contains(&m.hash()))
            .map(|m| (m.generation(), m.hash()))
            .collect();
        rest.sort_unstable();
        for (_, hash) in rest {
            self.assign_round(hash);
        }

        info!(
            "All {} snapshot judges of round {} replayed, {} events already ordered",
            judges.len(),
            round,
            ordered.len()
        );
    }

    // =========================================================================
    // DECISIONS
    // =========================================================================

    fn decide_rounds(&mut self) -> Vec<ConsensusRound> {
        let mut decided = Vec::new();
        loop {
            let round = self.last_decided_round + 1;
            // voting needs witnesses at least two rounds later
            if self
                .graph
                .max_witness_round()
                .map_or(true, |max| max < round + 2)
            {
                break;
            }
            if !self
                .elections
                .decide_round(&self.graph, round, &self.config)
            {
                break;
            }
            decided.push(self.finish_round(round));
        }
        decided
    }

    fn finish_round(&mut self, round: u64) -> ConsensusRound {
        let judges: Vec<EventHash> = {
            let mut by_creator = BTreeMap::new();
            for hash in self.graph.witnesses_in(round) {
                if self.elections.fame(hash) != Fame::Famous {
                    continue;
                }
                if let Some(meta) = self.graph.get(hash) {
                    // witness lists are sorted, so the first is the lowest hash
                    by_creator.entry(meta.creator_index).or_insert(*hash);
                }
            }
            by_creator.into_values().collect()
        };

        let mut keys = Vec::new();
        {
            let judge_metas: Vec<&EventMeta> =
                judges.iter().filter_map(|h| self.graph.get(h)).collect();
            if !judge_metas.is_empty() {
                for meta in self.graph.events() {
                    if meta.consensus || self.window.is_ancient(meta.event.birth_round()) {
                        continue;
                    }
                    if !judge_metas.iter().all(|j| j.sees(meta)) {
                        continue;
                    }
                    let mut received: Vec<Timestamp> = judge_metas
                        .iter()
                        .filter_map(|j| self.graph.first_self_ancestor_seeing(j, meta))
                        .map(|first| first.event.time_created())
                        .collect();
                    keys.push(OrderingKey {
                        median_received: median(&mut received)
                            .unwrap_or_else(|| meta.event.time_created()),
                        generation: meta.generation(),
                        creator: meta.event.creator(),
                        hash: meta.hash(),
                    });
                }
            }
        }
        keys.sort_unstable();

        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(meta) = self.graph.get_mut(&key.hash) else {
                continue;
            };
            meta.consensus = true;
            let base = match self.config.timestamp_source {
                ConsensusTimestampSource::CreationTime => meta.event.time_created(),
                ConsensusTimestampSource::MedianReceivedTime => key.median_received,
            };
            let consensus_timestamp = self
                .timestamps
                .assign(base, meta.event.transactions().len());
            events.push(ConsensusEvent {
                event: Arc::clone(&meta.event),
                consensus_order: self.next_consensus_number,
                consensus_timestamp,
            });
            self.next_consensus_number += 1;
        }
        if events.is_empty() {
            let mut times: Vec<Timestamp> = judges
                .iter()
                .filter_map(|h| self.graph.get(h))
                .map(|m| m.event.time_created())
                .collect();
            self.timestamps.advance_empty_round(&mut times);
        }

        let judge_ids: Vec<JudgeId> = judges
            .iter()
            .filter_map(|h| self.graph.get(h))
            .map(|m| JudgeId {
                creator: m.event.creator(),
                hash: m.hash(),
            })
            .collect();
        let minimum_judge_birth_round = judges
            .iter()
            .filter_map(|h| self.graph.get(h))
            .map(|m| m.event.birth_round())
            .min()
            .or_else(|| self.judge_info.back().map(|i| i.minimum_judge_birth_round))
            .unwrap_or(ROUND_FIRST);
        self.judge_info.push_back(MinimumJudgeInfo {
            round,
            minimum_judge_birth_round,
        });
        while self.judge_info.len() as u64 > self.config.rounds_expired {
            self.judge_info.pop_front();
        }

        self.last_decided_round = round;
        self.window = self.window_after(round);

        let candidates = self.graph.witnesses_in(round).to_vec();
        self.elections.forget(&candidates);
        let removed = self.graph.expire(self.window.expired_threshold, round);
        if !removed.is_empty() {
            let graph = &self.graph;
            self.elections.retain_verdicts(|h| graph.contains(h));
            debug!(
                "Expired {} events born before round {}",
                removed.len(),
                self.window.expired_threshold
            );
        }

        let snapshot = ConsensusSnapshot {
            round,
            judge_ids: judge_ids.clone(),
            minimum_judge_info_list: self.judge_info.iter().copied().collect(),
            next_consensus_number: self.next_consensus_number,
            consensus_timestamp: self.timestamps.last().unwrap_or_default(),
        };
        self.latest_snapshot = Some(snapshot.clone());

        info!(
            "Round {} decided: {} judges, {} events reached consensus",
            round,
            judge_ids.len(),
            events.len()
        );

        ConsensusRound {
            round,
            events,
            judges: judge_ids,
            event_window: self.window,
            snapshot,
        }
    }

    /// Window in effect once `round` is the latest decided round
    fn window_after(&self, round: u64) -> EventWindow {
        let ancient_threshold = self
            .threshold_at_depth(round, self.config.rounds_non_ancient)
            .max(self.window.ancient_threshold);
        let expired_threshold = self
            .threshold_at_depth(round, self.config.rounds_expired)
            .max(self.window.expired_threshold)
            .min(ancient_threshold);
        EventWindow {
            pending_consensus_round: round + 1,
            event_birth_round_floor: round + 1,
            ancient_threshold,
            expired_threshold,
        }
    }

    /// Minimum judge birth round of the round `depth - 1` rounds before `latest`
    fn threshold_at_depth(&self, latest: u64, depth: u64) -> u64 {
        if latest < depth {
            return ROUND_FIRST;
        }
        let target = latest + 1 - depth;
        self.judge_info
            .iter()
            .find(|info| info.round == target)
            .map_or(ROUND_FIRST, |info| info.minimum_judge_birth_round)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn event_window(&self) -> EventWindow {
        self.window
    }

    /// Zero before the first decision
    pub fn last_decided_round(&self) -> u64 {
        self.last_decided_round
    }

    /// Highest round that has a witness
    pub fn max_round(&self) -> Option<u64> {
        self.graph.max_witness_round()
    }

    pub fn round_of(&self, hash: &EventHash) -> Option<u64> {
        self.graph.get(hash).and_then(|m| m.round)
    }

    pub fn is_witness(&self, hash: &EventHash) -> bool {
        self.graph.get(hash).map_or(false, |m| m.witness)
    }

    pub fn fame_of(&self, hash: &EventHash) -> Fame {
        self.elections.fame(hash)
    }

    pub fn witnesses_in_round(&self, round: u64) -> Vec<EventHash> {
        self.graph.witnesses_in(round).to_vec()
    }

    pub fn round_state(&self, round: u64) -> RoundState {
        if round <= self.last_decided_round {
            RoundState::Decided
        } else if self.graph.max_witness_round().map_or(false, |max| max > round) {
            RoundState::Deciding
        } else {
            RoundState::Undecided
        }
    }

    /// Whether a loaded snapshot still waits for some of its judges
    pub fn is_waiting_for_judges(&self) -> bool {
        self.pending_judges.is_some()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Events held in memory
    pub fn event_count(&self) -> usize {
        self.graph.len()
    }

    pub fn next_consensus_number(&self) -> u64 {
        self.next_consensus_number
    }

    /// Snapshot of the latest decided round, or the loaded one
    pub fn latest_snapshot(&self) -> Option<&ConsensusSnapshot> {
        self.latest_snapshot.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_graph::TestGraph;
    use hashgraph_core::types::{NodeId, UnsignedEvent};

    fn new_engine(graph: &TestGraph) -> ConsensusEngine {
        ConsensusEngine::new(graph.roster(), ConsensusConfig::default()).unwrap()
    }

    fn feed(engine: &mut ConsensusEngine, events: &[Arc<Event>]) -> Vec<ConsensusRound> {
        let mut rounds = Vec::new();
        for event in events {
            rounds.extend(engine.add_event(Arc::clone(event)).unwrap());
        }
        rounds
    }

    fn hashes(events: &[ConsensusEvent]) -> Vec<EventHash> {
        events.iter().map(|e| e.event.hash).collect()
    }

    #[test]
    fn test_ring_advances_one_round_per_cycle() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(12);
        let mut engine = new_engine(&graph);
        feed(&mut engine, &events);

        for (k, event) in events.iter().enumerate() {
            assert_eq!(engine.round_of(&event.hash), Some(k as u64 / 4 + 1));
            assert!(engine.is_witness(&event.hash));
        }
        assert_eq!(engine.max_round(), Some(3));
        assert_eq!(engine.witnesses_in_round(3).len(), 4);
    }

    #[test]
    fn test_four_nodes_decide_first_three_rounds() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(20);
        let mut engine = new_engine(&graph);
        let rounds = feed(&mut engine, &events);

        let decided: Vec<u64> = rounds.iter().map(|r| r.round).collect();
        assert_eq!(decided, vec![1, 2, 3]);
        assert_eq!(engine.last_decided_round(), 3);
        for round in 1..=3 {
            assert_eq!(engine.round_state(round), RoundState::Decided);
        }
        assert_eq!(engine.round_state(4), RoundState::Deciding);
        assert_eq!(engine.round_state(5), RoundState::Undecided);

        // every witness of the decided rounds is famous
        for event in &events[..12] {
            assert_eq!(engine.fame_of(&event.hash), Fame::Famous);
        }
        for round in &rounds {
            assert_eq!(round.judges.len(), 4);
            let creators: Vec<NodeId> = round.judges.iter().map(|j| j.creator).collect();
            assert_eq!(creators, vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)]);
        }
        assert_eq!(engine.fame_of(&events[16].hash), Fame::Undecided);
    }

    #[test]
    fn test_round_orders_common_ancestors_of_judges() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(20);
        let mut engine = new_engine(&graph);
        let rounds = feed(&mut engine, &events);

        let e = |k: usize| events[k].hash;
        assert_eq!(hashes(&rounds[0].events), vec![e(0)]);
        assert_eq!(hashes(&rounds[1].events), vec![e(1), e(2), e(3), e(4)]);
        assert_eq!(hashes(&rounds[2].events), vec![e(5), e(6), e(7), e(8)]);

        let orders: Vec<u64> = rounds
            .iter()
            .flat_map(|r| &r.events)
            .map(|c| c.consensus_order)
            .collect();
        assert_eq!(orders, (0..9).collect::<Vec<_>>());
        assert_eq!(rounds[2].snapshot.next_consensus_number, 9);
        assert_eq!(
            rounds[2].snapshot.consensus_timestamp,
            rounds[2].events[3].consensus_timestamp
        );
    }

    #[test]
    fn test_median_received_time_source() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(20);
        let config = ConsensusConfig {
            timestamp_source: ConsensusTimestampSource::MedianReceivedTime,
            ..Default::default()
        };
        let mut engine = ConsensusEngine::new(graph.roster(), config).unwrap();
        let rounds = feed(&mut engine, &events);

        // the judges first saw e0 in e0..e3; the upper median is e2's creation
        assert_eq!(
            rounds[0].events[0].consensus_timestamp,
            events[2].time_created()
        );
        // e1 was first seen by the round-2 judges at e1, e2, e3 and e4
        assert_eq!(
            rounds[1].events[0].consensus_timestamp,
            events[3].time_created()
        );
    }

    #[test]
    fn test_consensus_timestamps_strictly_increase() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(60);
        let mut engine = new_engine(&graph);
        let rounds = feed(&mut engine, &events);

        let ordered: Vec<&ConsensusEvent> = rounds.iter().flat_map(|r| &r.events).collect();
        assert!(ordered.len() > 20);
        for pair in ordered.windows(2) {
            assert!(pair[1].consensus_timestamp > pair[0].consensus_timestamp);
            assert_eq!(pair[1].consensus_order, pair[0].consensus_order + 1);
        }
        let last = rounds.last().unwrap();
        assert_eq!(last.snapshot.next_consensus_number, ordered.len() as u64);
        assert_eq!(engine.next_consensus_number(), ordered.len() as u64);
    }

    #[test]
    fn test_partition_without_super_majority_stalls_until_healed() {
        let mut graph = TestGraph::new(4);
        let mut engine = new_engine(&graph);
        let opening = graph.ring(8);
        let mut decided = feed(&mut engine, &opening);

        // {0, 1} and {2, 3} only gossip among themselves: half the weight each
        for _ in 0..12 {
            let mut batch = Vec::new();
            for (creator, other) in [(0, 1), (1, 0), (2, 3), (3, 2)] {
                batch.push(graph.create(creator, Some(other)));
            }
            decided.extend(feed(&mut engine, &batch));
        }
        assert!(decided.is_empty());
        assert_eq!(engine.max_round(), Some(2));
        assert_eq!(engine.last_decided_round(), 0);
        for event in &opening[..4] {
            assert_eq!(engine.fame_of(&event.hash), Fame::Undecided);
        }

        decided.extend(feed(&mut engine, &graph.ring(20)));
        assert!(!decided.is_empty());
        assert_eq!(decided[0].round, 1);
        for event in &opening {
            assert_ne!(engine.fame_of(&event.hash), Fame::Undecided);
        }
    }

    #[test]
    fn test_stalled_election_computes_each_vote_once() {
        let mut graph = TestGraph::new(4);
        let mut engine = new_engine(&graph);
        feed(&mut engine, &graph.ring(8));
        for _ in 0..12 {
            let mut batch = Vec::new();
            for (creator, other) in [(0, 1), (1, 0), (2, 3), (3, 2)] {
                batch.push(graph.create(creator, Some(other)));
            }
            assert!(feed(&mut engine, &batch).is_empty());
        }
        assert_eq!(engine.max_round(), Some(2));

        // Round 2 witnesses vote on round 1 without reaching a verdict
        let pairs = engine.witnesses_in_round(1).len() * engine.witnesses_in_round(2).len();
        let elections = &mut engine.elections;
        assert!(!elections.decide_round(&engine.graph, 1, &engine.config));
        assert_eq!(elections.votes_computed(), pairs as u64);

        // Asking again reuses every vote
        assert!(!elections.decide_round(&engine.graph, 1, &engine.config));
        assert_eq!(elections.votes_computed(), pairs as u64);
    }

    #[test]
    fn test_arrival_order_does_not_change_outcome() {
        let mut graph = TestGraph::new(4);
        let steps: Vec<Vec<Arc<Event>>> = (0..40)
            .map(|s| graph.step(move |c| (c + 1 + s % 3) % 4))
            .collect();

        let mut forward = new_engine(&graph);
        let mut shuffled = new_engine(&graph);
        let mut a = Vec::new();
        let mut b = Vec::new();
        for (s, step) in steps.iter().enumerate() {
            a.extend(feed(&mut forward, step));

            let mut reordered = step.clone();
            reordered.rotate_left(s % 4);
            if s % 2 == 1 {
                reordered.reverse();
            }
            b.extend(feed(&mut shuffled, &reordered));
        }

        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn test_weight_decides_without_light_nodes() {
        // nodes 0 and 1 hold 6 of 8 weight, a supermajority on their own
        let mut graph = TestGraph::with_weights(&[3, 3, 1, 1]);
        let mut engine = new_engine(&graph);
        let mut rounds = Vec::new();
        for _ in 0..12 {
            let a = graph.create(0, Some(1));
            let b = graph.create(1, Some(0));
            rounds.extend(feed(&mut engine, &[a, b]));
        }

        assert!(rounds.len() >= 5);
        for round in &rounds {
            assert!(round
                .judges
                .iter()
                .all(|j| j.creator == NodeId(0) || j.creator == NodeId(1)));
        }
    }

    #[test]
    fn test_restart_from_snapshot_continues_identically() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(40);
        let mut original = new_engine(&graph);
        let rounds = feed(&mut original, &events);
        assert!(rounds.len() > 4);
        let snapshot = rounds[2].snapshot.clone();

        let mut restarted = new_engine(&graph);
        restarted.load_snapshot(&snapshot).unwrap();
        assert!(restarted.is_waiting_for_judges());
        assert_eq!(restarted.last_decided_round(), 3);
        assert_eq!(restarted.event_window(), rounds[2].event_window);

        let resumed = feed(&mut restarted, &events);
        assert!(!restarted.is_waiting_for_judges());
        assert_eq!(resumed, rounds[3..].to_vec());
        restarted.finish_replay().unwrap();
        assert!(!restarted.is_halted());
    }

    #[test]
    fn test_replay_missing_snapshot_judges_halts() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(40);
        let rounds = feed(&mut new_engine(&graph), &events);
        let snapshot = rounds[2].snapshot.clone();

        // Only the oldest events were replayed, none of the judges
        let mut restarted = new_engine(&graph);
        restarted.load_snapshot(&snapshot).unwrap();
        assert!(feed(&mut restarted, &events[..8]).is_empty());
        assert!(restarted.is_waiting_for_judges());

        assert_eq!(
            restarted.finish_replay(),
            Err(ConsensusError::ReplayDiverged {
                round: 3,
                missing: snapshot.judge_ids.len(),
            })
        );
        assert!(restarted.is_halted());
        assert_eq!(
            restarted.add_event(Arc::clone(&events[8])),
            Err(ConsensusError::Halted)
        );
    }

    #[test]
    fn test_finish_replay_from_genesis() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(8);
        let mut engine = new_engine(&graph);
        engine.finish_replay().unwrap();
        feed(&mut engine, &events);
        assert!(!engine.is_halted());
    }

    #[test]
    fn test_snapshot_rejected_after_events() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(20);
        let snapshot = feed(&mut new_engine(&graph), &events)[0].snapshot.clone();

        let mut engine = new_engine(&graph);
        engine.add_event(Arc::clone(&events[0])).unwrap();
        assert_eq!(
            engine.load_snapshot(&snapshot),
            Err(ConsensusError::SnapshotAfterEvents)
        );
        assert!(!engine.is_halted());
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(5);
        let mut engine = new_engine(&graph);
        feed(&mut engine, &events);

        assert_eq!(engine.add_event(Arc::clone(&events[2])), Ok(Vec::new()));
        assert_eq!(engine.event_count(), 5);
    }

    #[test]
    fn test_ancient_events_are_ignored_and_memory_is_bounded() {
        let config = ConsensusConfig {
            rounds_non_ancient: 3,
            rounds_expired: 4,
            ..Default::default()
        };
        let mut graph = TestGraph::new(4);
        let mut engine = ConsensusEngine::new(graph.roster(), config).unwrap();
        let mut all = Vec::new();
        for _ in 0..80 {
            let event = graph.ring(1).remove(0);
            engine.add_event(Arc::clone(&event)).unwrap();
            graph.set_birth_round(engine.event_window().event_birth_round_floor);
            all.push(event);
        }

        let window = engine.event_window();
        assert!(window.ancient_threshold > ROUND_FIRST);
        assert!(window.expired_threshold <= window.ancient_threshold);
        assert!(engine.event_count() < all.len());

        let count = engine.event_count();
        assert_eq!(engine.add_event(Arc::clone(&all[0])), Ok(Vec::new()));
        assert_eq!(engine.event_count(), count);
        assert!(!engine.is_halted());
    }

    #[test]
    fn test_missing_parent_halts_engine() {
        let mut graph = TestGraph::new(4);
        let events = graph.ring(2);
        let mut engine = new_engine(&graph);

        assert_eq!(
            engine.add_event(Arc::clone(&events[1])),
            Err(ConsensusError::MissingParent {
                hash: events[1].hash,
                parent: events[0].hash,
            })
        );
        assert!(engine.is_halted());
        assert_eq!(
            engine.add_event(Arc::clone(&events[0])),
            Err(ConsensusError::Halted)
        );
    }

    #[test]
    fn test_branch_is_fatal() {
        let mut graph = TestGraph::new(4);
        let genesis = graph.create(0, None);
        let other = graph.create(1, Some(0));
        let first = graph.build(0, Some(&genesis), None);
        let second = graph.build(0, Some(&genesis), Some(&other));
        let mut engine = new_engine(&graph);
        feed(&mut engine, &[genesis, other, first]);

        assert!(matches!(
            engine.add_event(second),
            Err(ConsensusError::Branch { generation: 1, .. })
        ));
        assert!(engine.is_halted());
    }

    #[test]
    fn test_malformed_events_are_fatal() {
        let mut graph = TestGraph::new(4);
        let genesis = graph.create(0, None);

        let mut wrong_generation = UnsignedEvent::new(
            NodeId(0),
            Some(genesis.descriptor()),
            None,
            ROUND_FIRST,
            Timestamp(5),
            vec![],
        );
        wrong_generation.generation = 7;
        let wrong_generation = graph.sign(0, wrong_generation);
        let mut engine = new_engine(&graph);
        engine.add_event(Arc::clone(&genesis)).unwrap();
        assert!(matches!(
            engine.add_event(wrong_generation),
            Err(ConsensusError::GenerationMismatch {
                expected: 2,
                actual: 7,
                ..
            })
        ));

        let stranger = graph.sign(
            0,
            UnsignedEvent::new(NodeId(9), None, None, ROUND_FIRST, Timestamp(5), vec![]),
        );
        let mut engine = new_engine(&graph);
        assert!(matches!(
            engine.add_event(stranger),
            Err(ConsensusError::UnknownCreator {
                creator: NodeId(9),
                ..
            })
        ));

        let foreign_self_parent = graph.sign(
            1,
            UnsignedEvent::new(
                NodeId(1),
                Some(genesis.descriptor()),
                None,
                ROUND_FIRST,
                Timestamp(5),
                vec![],
            ),
        );
        let mut engine = new_engine(&graph);
        engine.add_event(Arc::clone(&genesis)).unwrap();
        assert!(matches!(
            engine.add_event(foreign_self_parent),
            Err(ConsensusError::SelfParentCreatorMismatch { .. })
        ));
    }
}
