//! Deterministic DAG builder for consensus tests

use hashgraph_core::types::{
    Event, NodeId, Roster, RosterEntry, Timestamp, UnsignedEvent, ROUND_FIRST,
};
use hashgraph_net::KeyPair;
use std::sync::Arc;

pub(crate) struct TestGraph {
    roster: Arc<Roster>,
    keys: Vec<KeyPair>,
    latest: Vec<Option<Arc<Event>>>,
    clock: u64,
    ring_position: usize,
    birth_round: u64,
}

impl TestGraph {
    /// Equal-weight roster of `size` nodes with ids 0..size
    pub fn new(size: usize) -> Self {
        Self::with_weights(&vec![1; size])
    }

    pub fn with_weights(weights: &[u64]) -> Self {
        let keys: Vec<KeyPair> = (0..weights.len())
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let entries = weights
            .iter()
            .zip(&keys)
            .enumerate()
            .map(|(i, (weight, key))| RosterEntry {
                node_id: NodeId(i as u64),
                weight: *weight,
                public_key: key.public_key(),
            })
            .collect();
        Self {
            roster: Arc::new(Roster::new(entries).unwrap()),
            keys,
            latest: vec![None; weights.len()],
            clock: 1_000_000_000,
            ring_position: 0,
            birth_round: ROUND_FIRST,
        }
    }

    pub fn roster(&self) -> Arc<Roster> {
        Arc::clone(&self.roster)
    }

    pub fn size(&self) -> usize {
        self.latest.len()
    }

    /// Birth round given to events created from now on
    pub fn set_birth_round(&mut self, round: u64) {
        self.birth_round = round;
    }

    /// Sign arbitrary content with a roster member's key
    pub fn sign(&self, signer: usize, unsigned: UnsignedEvent) -> Arc<Event> {
        Arc::new(self.keys[signer].sign_event(unsigned).unwrap())
    }

    /// Event with explicit parents; does not move the creator's tip
    pub fn build(
        &mut self,
        creator: usize,
        self_parent: Option<&Event>,
        other_parent: Option<&Event>,
    ) -> Arc<Event> {
        self.clock += 1_000_000;
        let unsigned = UnsignedEvent::new(
            NodeId(creator as u64),
            self_parent.map(Event::descriptor),
            other_parent.map(Event::descriptor),
            self.birth_round,
            Timestamp(self.clock),
            vec![vec![creator as u8; 4]],
        );
        self.sign(creator, unsigned)
    }

    /// Next event of `creator` on its own tip, with the tip of `other` as
    /// other-parent
    pub fn create(&mut self, creator: usize, other: Option<usize>) -> Arc<Event> {
        let self_parent = self.latest[creator].clone();
        let other_parent = other.and_then(|o| self.latest[o].clone());
        let event = self.build(creator, self_parent.as_deref(), other_parent.as_deref());
        self.latest[creator] = Some(Arc::clone(&event));
        event
    }

    /// Events in which each creator in turn builds on the previous creator
    pub fn ring(&mut self, count: usize) -> Vec<Arc<Event>> {
        let size = self.size();
        (0..count)
            .map(|_| {
                let creator = self.ring_position % size;
                self.ring_position += 1;
                self.create(creator, Some((creator + size - 1) % size))
            })
            .collect()
    }

    /// One event per creator, built only on tips from before this step, so
    /// the events of a step may be delivered in any order.
    pub fn step(&mut self, other_of: impl Fn(usize) -> usize) -> Vec<Arc<Event>> {
        let previous = self.latest.clone();
        let events: Vec<Arc<Event>> = (0..self.size())
            .map(|creator| {
                let self_parent = previous[creator].clone();
                let other_parent = previous[other_of(creator)].clone();
                self.build(creator, self_parent.as_deref(), other_parent.as_deref())
            })
            .collect();
        for (creator, event) in events.iter().enumerate() {
            self.latest[creator] = Some(Arc::clone(event));
        }
        events
    }
}
