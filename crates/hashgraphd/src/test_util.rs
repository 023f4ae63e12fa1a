//! Signed-event fixtures shared by the daemon's unit tests

use hashgraph_core::types::{Event, NodeId, Roster, RosterEntry, Timestamp, UnsignedEvent};
use hashgraph_net::KeyPair;
use std::sync::Arc;

pub(crate) struct TestNetwork {
    pub roster: Arc<Roster>,
    pub keys: Vec<KeyPair>,
    clock: u64,
}

impl TestNetwork {
    /// Equal-weight roster of `size` nodes with ids 0..size
    pub fn new(size: usize) -> Self {
        let keys: Vec<KeyPair> = (0..size)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let entries = keys
            .iter()
            .enumerate()
            .map(|(i, key)| RosterEntry {
                node_id: NodeId(i as u64),
                weight: 1,
                public_key: key.public_key(),
            })
            .collect();
        Self {
            roster: Arc::new(Roster::new(entries).unwrap()),
            keys,
            clock: 1_000_000_000,
        }
    }

    pub fn key(&self, creator: usize) -> &KeyPair {
        &self.keys[creator]
    }

    /// Unsigned event content with a fresh creation time
    pub fn unsigned(
        &mut self,
        creator: usize,
        self_parent: Option<&Event>,
        other_parent: Option<&Event>,
        birth_round: u64,
    ) -> UnsignedEvent {
        self.clock += 1_000_000;
        UnsignedEvent::new(
            NodeId(creator as u64),
            self_parent.map(Event::descriptor),
            other_parent.map(Event::descriptor),
            birth_round,
            Timestamp(self.clock),
            vec![vec![creator as u8; 8]],
        )
    }

    pub fn sign(&self, creator: usize, unsigned: UnsignedEvent) -> Arc<Event> {
        Arc::new(self.keys[creator].sign_event(unsigned).unwrap())
    }

    pub fn event(
        &mut self,
        creator: usize,
        self_parent: Option<&Event>,
        other_parent: Option<&Event>,
    ) -> Arc<Event> {
        self.event_in_round(creator, self_parent, other_parent, 1)
    }

    pub fn event_in_round(
        &mut self,
        creator: usize,
        self_parent: Option<&Event>,
        other_parent: Option<&Event>,
        birth_round: u64,
    ) -> Arc<Event> {
        let unsigned = self.unsigned(creator, self_parent, other_parent, birth_round);
        self.sign(creator, unsigned)
    }

    /// Each creator in turn builds on its own tip and the previous creator's
    pub fn ring(&mut self, count: usize) -> Vec<Arc<Event>> {
        let size = self.keys.len();
        let mut latest: Vec<Option<Arc<Event>>> = vec![None; size];
        (0..count)
            .map(|i| {
                let creator = i % size;
                let other = (creator + size - 1) % size;
                let event = self.event(
                    creator,
                    latest[creator].as_deref(),
                    latest[other].as_deref(),
                );
                latest[creator] = Some(Arc::clone(&event));
                event
            })
            .collect()
    }
}
