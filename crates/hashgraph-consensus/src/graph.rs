//! Consensus side tables over the event DAG
//!
//! Events are referenced by hash. For every event the engine keeps the
//! highest generation it can see from each creator; because a creator's
//! events form a single chain ordered by generation, "x sees y" reduces to
//! a comparison against that vector and "x strongly sees y" to one lookup
//! per roster member.

use hashgraph_core::types::{Event, EventHash, Roster, Threshold};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Per-event consensus metadata
#[derive(Debug)]
pub(crate) struct EventMeta {
    pub event: Arc<Event>,
    /// Roster index of the creator
    pub creator_index: usize,
    pub self_parent: Option<EventHash>,
    pub other_parent: Option<EventHash>,
    /// None when the event is too old to take part in voting
    pub round: Option<u64>,
    pub witness: bool,
    /// Highest ancestor generation per roster index (self included)
    pub last_seen: Vec<Option<u64>>,
    /// Already placed in the total order
    pub consensus: bool,
}

impl EventMeta {
    pub fn hash(&self) -> EventHash {
        self.event.hash
    }

    pub fn generation(&self) -> u64 {
        self.event.generation()
    }

    /// Whether `other` is this event or one of its ancestors
    pub fn sees(&self, other: &EventMeta) -> bool {
        self.last_seen[other.creator_index].map_or(false, |g| g >= other.generation())
    }
}

/// Event metadata indexed by hash, creator chain and witness round
#[derive(Debug)]
pub(crate) struct Hashgraph {
    roster: Arc<Roster>,
    events: HashMap<EventHash, EventMeta>,
    /// Per roster index: generation -> hash
    chains: Vec<BTreeMap<u64, EventHash>>,
    /// Round -> witnesses of that round, sorted by hash
    witnesses: BTreeMap<u64, Vec<EventHash>>,
}

impl Hashgraph {
    pub fn new(roster: Arc<Roster>) -> Self {
        let chains = vec![BTreeMap::new(); roster.len()];
        Self {
            roster,
            events: HashMap::new(),
            chains,
            witnesses: BTreeMap::new(),
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, hash: &EventHash) -> bool {
        self.events.contains_key(hash)
    }

    pub fn get(&self, hash: &EventHash) -> Option<&EventMeta> {
        self.events.get(hash)
    }

    pub fn get_mut(&mut self, hash: &EventHash) -> Option<&mut EventMeta> {
        self.events.get_mut(hash)
    }

    pub fn events(&self) -> impl Iterator<Item = &EventMeta> {
        self.events.values()
    }

    /// Event of a creator at an exact generation
    pub fn at_generation(&self, creator_index: usize, generation: u64) -> Option<&EventMeta> {
        self.chains
            .get(creator_index)?
            .get(&generation)
            .and_then(|h| self.events.get(h))
    }

    /// Whether the creator already has an event above `generation`. Parents
    /// are added before children, so such an event is a sibling of anything
    /// whose self-parent sits at `generation`.
    pub fn chain_extends_past(&self, creator_index: usize, generation: u64) -> bool {
        self.chains
            .get(creator_index)
            .map_or(false, |c| c.range(generation + 1..).next().is_some())
    }

    /// Store metadata; the caller has already computed `last_seen`.
    pub fn insert(&mut self, meta: EventMeta) {
        self.chains[meta.creator_index].insert(meta.generation(), meta.hash());
        self.events.insert(meta.hash(), meta);
    }

    /// Mark an event as a witness of `round`
    pub fn add_witness(&mut self, round: u64, hash: EventHash) {
        let list = self.witnesses.entry(round).or_default();
        if let Err(pos) = list.binary_search(&hash) {
            list.insert(pos, hash);
        }
    }

    pub fn witnesses_in(&self, round: u64) -> &[EventHash] {
        self.witnesses.get(&round).map_or(&[], Vec::as_slice)
    }

    pub fn max_witness_round(&self) -> Option<u64> {
        self.witnesses.keys().next_back().copied()
    }

    /// Whether x strongly sees y: y is seen by events of creators holding a
    /// supermajority of weight, each of which x sees.
    pub fn strongly_sees(&self, x: &EventMeta, y: &EventMeta, threshold: Threshold) -> bool {
        if !x.sees(y) {
            return false;
        }
        let mut weight = 0u64;
        for (index, seen) in x.last_seen.iter().enumerate() {
            let Some(generation) = seen else { continue };
            if let Some(z) = self.at_generation(index, *generation) {
                if z.sees(y) {
                    weight += self.roster.weight_at(index);
                }
            }
        }
        threshold.is_satisfied_by(weight, self.roster.total_weight())
    }

    /// Round-r witnesses strongly seen by x
    pub fn strongly_seen_witnesses(
        &self,
        x: &EventMeta,
        round: u64,
        threshold: Threshold,
    ) -> Vec<&EventMeta> {
        self.witnesses_in(round)
            .iter()
            .filter_map(|h| self.events.get(h))
            .filter(|w| self.strongly_sees(x, w, threshold))
            .collect()
    }

    /// Combined roster weight of the distinct creators of `events`
    pub fn creator_weight<'a>(&self, events: impl IntoIterator<Item = &'a EventMeta>) -> u64 {
        let mut counted = vec![false; self.roster.len()];
        let mut weight = 0;
        for e in events {
            if !counted[e.creator_index] {
                counted[e.creator_index] = true;
                weight += self.roster.weight_at(e.creator_index);
            }
        }
        weight
    }

    /// Earliest event on the chain ending at `tip` (inclusive) that sees `target`.
    pub fn first_self_ancestor_seeing<'a>(
        &'a self,
        tip: &'a EventMeta,
        target: &EventMeta,
    ) -> Option<&'a EventMeta> {
        if !tip.sees(target) {
            return None;
        }
        let mut earliest = tip;
        for (_, hash) in self.chains[tip.creator_index]
            .range(..tip.generation())
            .rev()
        {
            match self.events.get(hash) {
                Some(e) if e.sees(target) => earliest = e,
                _ => break,
            }
        }
        Some(earliest)
    }

    /// Drop every event born before `expired_threshold` and the witness lists
    /// of rounds below `oldest_round`.
    pub fn expire(&mut self, expired_threshold: u64, oldest_round: u64) -> Vec<EventHash> {
        let removed: Vec<EventHash> = self
            .events
            .values()
            .filter(|m| m.event.birth_round() < expired_threshold)
            .map(EventMeta::hash)
            .collect();
        for hash in &removed {
            if let Some(meta) = self.events.remove(hash) {
                self.chains[meta.creator_index].remove(&meta.generation());
            }
        }
        self.witnesses = self.witnesses.split_off(&oldest_round);
        removed
    }
}
