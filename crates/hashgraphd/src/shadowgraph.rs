//! In-memory index of linked events
//!
//! Events are stored once, keyed by hash; parent links are hashes into the
//! same map. Intake inserts and the consensus loop expires under the write
//! lock, gossip traverses under the read lock.

use hashgraph_core::types::{Event, EventHash, EventWindow, NodeId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Linking errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShadowgraphError {
    #[error("event {0} is already linked")]
    Duplicate(EventHash),
    #[error("event {hash} is ancient: birth round {birth_round} is below {ancient_threshold}")]
    Ancient {
        hash: EventHash,
        birth_round: u64,
        ancient_threshold: u64,
    },
    #[error("event {hash} references parent {parent} that is not linked")]
    MissingParent { hash: EventHash, parent: EventHash },
    #[error("event {hash} branches the chain of {creator}")]
    Branch { hash: EventHash, creator: NodeId },
}

/// A linked event with its parents resolved.
///
/// A parent link is `None` when the event has no such parent or when the
/// parent is ancient and no longer held.
#[derive(Clone, Debug)]
pub struct ShadowEvent {
    pub event: Arc<Event>,
    pub self_parent: Option<EventHash>,
    pub other_parent: Option<EventHash>,
}

impl ShadowEvent {
    pub fn hash(&self) -> EventHash {
        self.event.hash
    }

    fn parents(&self) -> impl Iterator<Item = &EventHash> {
        self.self_parent.iter().chain(self.other_parent.iter())
    }
}

#[derive(Default)]
struct Inner {
    events: HashMap<EventHash, ShadowEvent>,
    /// Events without linked children
    tips: BTreeSet<EventHash>,
    /// Newest linked event per creator
    latest: HashMap<NodeId, EventHash>,
    window: EventWindow,
}

impl Inner {
    /// Hashes of `roots` and all their linked ancestors
    fn ancestors_of<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a EventHash>,
    ) -> HashSet<EventHash> {
        let mut seen = HashSet::new();
        let mut stack: Vec<EventHash> = roots
            .into_iter()
            .filter(|h| self.events.contains_key(h))
            .copied()
            .collect();
        while let Some(hash) = stack.pop() {
            if !seen.insert(hash) {
                continue;
            }
            if let Some(shadow) = self.events.get(&hash) {
                stack.extend(shadow.parents().filter(|p| !seen.contains(p)));
            }
        }
        seen
    }
}

/// Shared DAG of every non-expired event this node has linked
#[derive(Default)]
pub struct Shadowgraph {
    inner: RwLock<Inner>,
}

impl Shadowgraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link an event whose parents are linked or ancient.
    pub fn link(&self, event: Arc<Event>) -> Result<ShadowEvent, ShadowgraphError> {
        let mut inner = self.inner.write();
        let hash = event.hash;

        if inner.events.contains_key(&hash) {
            return Err(ShadowgraphError::Duplicate(hash));
        }
        if inner.window.is_ancient(event.birth_round()) {
            return Err(ShadowgraphError::Ancient {
                hash,
                birth_round: event.birth_round(),
                ancient_threshold: inner.window.ancient_threshold,
            });
        }

        let mut resolved = [None, None];
        for (slot, parent) in [event.self_parent(), event.other_parent()]
            .into_iter()
            .enumerate()
        {
            let Some(parent) = parent else { continue };
            if inner.events.contains_key(&parent.hash) {
                resolved[slot] = Some(parent.hash);
            } else if !inner.window.is_ancient(parent.birth_round) {
                return Err(ShadowgraphError::MissingParent {
                    hash,
                    parent: parent.hash,
                });
            }
        }

        let creator = event.creator();
        if let Some(latest) = inner.latest.get(&creator).and_then(|h| inner.events.get(h)) {
            let extends_latest = event
                .self_parent()
                .is_some_and(|sp| sp.hash == latest.event.hash);
            if !extends_latest {
                return Err(ShadowgraphError::Branch { hash, creator });
            }
        }

        let shadow = ShadowEvent {
            event,
            self_parent: resolved[0],
            other_parent: resolved[1],
        };
        for parent in shadow.parents() {
            inner.tips.remove(parent);
        }
        inner.tips.insert(hash);
        inner.latest.insert(creator, hash);
        inner.events.insert(hash, shadow.clone());
        Ok(shadow)
    }

    pub fn contains(&self, hash: &EventHash) -> bool {
        self.inner.read().events.contains_key(hash)
    }

    pub fn get(&self, hash: &EventHash) -> Option<ShadowEvent> {
        self.inner.read().events.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().events.is_empty()
    }

    /// Linked ancestors of an event, excluding the event itself
    pub fn ancestors(&self, hash: &EventHash) -> impl Iterator<Item = Arc<Event>> {
        let inner = self.inner.read();
        let mut found: Vec<Arc<Event>> = inner
            .ancestors_of([hash])
            .into_iter()
            .filter(|h| h != hash)
            .filter_map(|h| inner.events.get(&h).map(|s| Arc::clone(&s.event)))
            .collect();
        found.sort_by_key(|e| (e.generation(), e.hash));
        found.into_iter()
    }

    /// Events without linked children, in hash order
    pub fn tips(&self) -> Vec<EventHash> {
        self.inner.read().tips.iter().copied().collect()
    }

    /// Newest linked event of a creator
    pub fn latest(&self, creator: NodeId) -> Option<Arc<Event>> {
        let inner = self.inner.read();
        let hash = inner.latest.get(&creator)?;
        inner.events.get(hash).map(|s| Arc::clone(&s.event))
    }

    /// Newest linked event of every creator
    pub fn latest_events(&self) -> Vec<Arc<Event>> {
        let inner = self.inner.read();
        let mut events: Vec<Arc<Event>> = inner
            .latest
            .values()
            .filter_map(|h| inner.events.get(h).map(|s| Arc::clone(&s.event)))
            .collect();
        events.sort_by_key(|e| e.creator());
        events
    }

    pub fn window(&self) -> EventWindow {
        self.inner.read().window
    }

    /// Adopt a new window and drop every event that expired under it.
    /// Returns the number of events removed.
    pub fn expire(&self, window: EventWindow) -> usize {
        let mut inner = self.inner.write();
        inner.window = window;

        let expired: HashSet<EventHash> = inner
            .events
            .values()
            .filter(|s| window.is_expired(s.event.birth_round()))
            .map(ShadowEvent::hash)
            .collect();
        if expired.is_empty() {
            return 0;
        }
        for hash in &expired {
            inner.events.remove(hash);
            inner.tips.remove(hash);
        }
        let Inner { events, latest, .. } = &mut *inner;
        latest.retain(|_, h| events.contains_key(h));
        for shadow in events.values_mut() {
            if shadow.self_parent.is_some_and(|p| expired.contains(&p)) {
                shadow.self_parent = None;
            }
            if shadow.other_parent.is_some_and(|p| expired.contains(&p)) {
                shadow.other_parent = None;
            }
        }
        debug!(
            "Expired {} events below birth round {}",
            expired.len(),
            window.expired_threshold
        );
        expired.len()
    }

    /// Events a peer is missing given the tips it already has.
    ///
    /// Excludes ancestors of `known_tips` and events that are ancient for
    /// the peer. The result is sorted by generation, so parents precede
    /// children.
    pub fn find_send_list(
        &self,
        known_tips: &[EventHash],
        peer_window: &EventWindow,
    ) -> Vec<Arc<Event>> {
        let inner = self.inner.read();
        let known = inner.ancestors_of(known_tips);
        let mut send: Vec<Arc<Event>> = inner
            .events
            .values()
            .filter(|s| !known.contains(&s.hash()))
            .filter(|s| !peer_window.is_ancient(s.event.birth_round()))
            .map(|s| Arc::clone(&s.event))
            .collect();
        send.sort_by_key(|e| (e.generation(), e.hash));
        send
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestNetwork;

    fn window(ancient: u64, expired: u64) -> EventWindow {
        EventWindow {
            pending_consensus_round: ancient + 1,
            event_birth_round_floor: ancient + 1,
            ancient_threshold: ancient,
            expired_threshold: expired,
        }
    }

    #[test]
    fn test_link_and_tips() {
        let mut net = TestNetwork::new(2);
        let graph = Shadowgraph::new();
        let a = net.event(0, None, None);
        let b = net.event(1, None, None);
        let c = net.event(0, Some(&a), Some(&b));

        graph.link(a.clone()).unwrap();
        graph.link(b.clone()).unwrap();
        let mut tips = vec![a.hash, b.hash];
        tips.sort();
        assert_eq!(graph.tips(), tips);

        let shadow = graph.link(c.clone()).unwrap();
        assert_eq!(shadow.self_parent, Some(a.hash));
        assert_eq!(shadow.other_parent, Some(b.hash));
        assert_eq!(graph.tips(), vec![c.hash]);
        assert_eq!(graph.latest(NodeId(0)).unwrap().hash, c.hash);

        let ancestors: HashSet<EventHash> = graph.ancestors(&c.hash).map(|e| e.hash).collect();
        assert_eq!(ancestors, HashSet::from([a.hash, b.hash]));
    }

    #[test]
    fn test_missing_parent_and_duplicate() {
        let mut net = TestNetwork::new(2);
        let graph = Shadowgraph::new();
        let a = net.event(0, None, None);
        let b = net.event(0, Some(&a), None);

        assert_eq!(
            graph.link(b.clone()).unwrap_err(),
            ShadowgraphError::MissingParent {
                hash: b.hash,
                parent: a.hash
            }
        );
        graph.link(a.clone()).unwrap();
        assert_eq!(
            graph.link(a.clone()).unwrap_err(),
            ShadowgraphError::Duplicate(a.hash)
        );
        graph.link(b).unwrap();
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_branch_rejected() {
        let mut net = TestNetwork::new(1);
        let graph = Shadowgraph::new();
        let a = net.event(0, None, None);
        let b = net.event(0, Some(&a), None);
        let fork = net.event(0, Some(&a), None);
        let second_genesis = net.event(0, None, None);

        graph.link(a).unwrap();
        graph.link(b).unwrap();
        assert!(matches!(
            graph.link(fork),
            Err(ShadowgraphError::Branch { .. })
        ));
        assert!(matches!(
            graph.link(second_genesis),
            Err(ShadowgraphError::Branch { .. })
        ));
    }

    #[test]
    fn test_ancient_rejected_and_ancient_parent_tolerated() {
        let mut net = TestNetwork::new(2);
        let graph = Shadowgraph::new();
        let old = net.event_in_round(0, None, None, 1);
        let peer_old = net.event_in_round(1, None, None, 1);
        graph.link(old.clone()).unwrap();

        graph.expire(window(3, 1));
        assert!(graph.contains(&old.hash));
        assert!(matches!(
            graph.link(peer_old.clone()),
            Err(ShadowgraphError::Ancient { .. })
        ));

        // peer_old was never linked but is ancient, so it is not required
        let fresh = net.event_in_round(0, Some(&old), Some(&peer_old), 3);
        let shadow = graph.link(fresh).unwrap();
        assert_eq!(shadow.self_parent, Some(old.hash));
        assert_eq!(shadow.other_parent, None);
    }

    #[test]
    fn test_expire_drops_links() {
        let mut net = TestNetwork::new(1);
        let graph = Shadowgraph::new();
        let a = net.event_in_round(0, None, None, 1);
        let b = net.event_in_round(0, Some(&a), None, 2);
        graph.link(a.clone()).unwrap();
        graph.link(b.clone()).unwrap();

        assert_eq!(graph.expire(window(2, 2)), 1);
        assert!(!graph.contains(&a.hash));
        assert_eq!(graph.get(&b.hash).unwrap().self_parent, None);
        assert_eq!(graph.tips(), vec![b.hash]);
        assert_eq!(graph.latest(NodeId(0)).unwrap().hash, b.hash);
    }

    #[test]
    fn test_send_list_skips_known_and_ancient() {
        let mut net = TestNetwork::new(3);
        let graph = Shadowgraph::new();
        let events = net.ring(9);
        for event in &events {
            graph.link(event.clone()).unwrap();
        }

        let everything = graph.find_send_list(&[], &EventWindow::genesis());
        assert_eq!(everything.len(), 9);
        assert!(everything
            .windows(2)
            .all(|w| w[0].generation() <= w[1].generation()));

        // The peer holds events[4] and therefore everything below it
        let missing = graph.find_send_list(&[events[4].hash], &EventWindow::genesis());
        let hashes: Vec<EventHash> = missing.iter().map(|e| e.hash).collect();
        assert_eq!(
            hashes,
            events[5..].iter().map(|e| e.hash).collect::<Vec<_>>()
        );

        assert!(graph.find_send_list(&[], &window(2, 1)).is_empty());
    }
}
