//! Local event creation
//!
//! The creator keeps a tipset for every event it has been shown: for each
//! roster member, the highest generation of that member's events among the
//! event's ancestors. A candidate other-parent is worth building on when its
//! tipset advances ours, i.e. it would make this node aware of newer events.
//! Among the advancing candidates the one advancing the most weight wins,
//! minus a penalty for choosing the same peer over and over.

use crate::config::CreatorConfig;
use hashgraph_core::types::{
    Event, EventHash, EventWindow, NodeId, Roster, Timestamp, UnsignedEvent,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

// =============================================================================
// TIPSETS
// =============================================================================

/// Highest known generation per roster index, zero for none
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tipset(Vec<u64>);

impl Tipset {
    fn empty(size: usize) -> Self {
        Self(vec![0; size])
    }

    fn merge(&mut self, other: &Tipset) {
        for (mine, theirs) in self.0.iter_mut().zip(&other.0) {
            *mine = (*mine).max(*theirs);
        }
    }

    pub fn generation_of(&self, index: usize) -> u64 {
        self.0.get(index).copied().unwrap_or(0)
    }

    /// Weight of the members, other than `skip`, whose entry in `other` is
    /// newer than in `self`
    fn advancement_weight(&self, other: &Tipset, roster: &Roster, skip: usize) -> u64 {
        (0..self.0.len())
            .filter(|&i| i != skip && other.generation_of(i) > self.generation_of(i))
            .map(|i| roster.weight_at(i))
            .sum()
    }
}

/// Tipsets of recent events
pub struct TipsetTracker {
    roster: Arc<Roster>,
    tipsets: HashMap<EventHash, (u64, Tipset)>,
}

impl TipsetTracker {
    pub fn new(roster: Arc<Roster>) -> Self {
        Self {
            roster,
            tipsets: HashMap::new(),
        }
    }

    /// Compute and remember the tipset of an event. Parents that were never
    /// added contribute nothing.
    pub fn add_event(&mut self, event: &Event) -> Option<Tipset> {
        let index = self.roster.index_of(event.creator())?;
        let mut tipset = Tipset::empty(self.roster.len());
        for parent in event.parents() {
            if let Some((_, parent_tipset)) = self.tipsets.get(&parent.hash) {
                tipset.merge(parent_tipset);
            }
        }
        tipset.0[index] = tipset.0[index].max(event.generation());
        self.tipsets
            .insert(event.hash, (event.birth_round(), tipset.clone()));
        Some(tipset)
    }

    pub fn get(&self, hash: &EventHash) -> Option<&Tipset> {
        self.tipsets.get(hash).map(|(_, t)| t)
    }

    pub fn contains(&self, hash: &EventHash) -> bool {
        self.tipsets.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.tipsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tipsets.is_empty()
    }

    /// Forget events born before `birth_round`
    pub fn expire(&mut self, birth_round: u64) {
        self.tipsets.retain(|_, (round, _)| *round >= birth_round);
    }
}

// =============================================================================
// TRANSACTION POOL
// =============================================================================

/// Application transactions waiting to be packed into an event
pub struct TransactionPool {
    queue: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl TransactionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Queue a transaction. Returns false when the pool is full.
    pub fn submit(&self, transaction: Vec<u8>) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(transaction);
        true
    }

    /// Remove up to `max` transactions in submission order
    pub fn take(&self, max: usize) -> Vec<Vec<u8>> {
        let mut queue = self.queue.lock();
        let count = max.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

// =============================================================================
// EVENT CREATOR
// =============================================================================

/// Decides when this node creates an event and which parents it gets
pub struct EventCreator {
    self_index: usize,
    self_id: NodeId,
    roster: Arc<Roster>,
    config: CreatorConfig,
    tracker: TipsetTracker,
    /// Newest registered event per roster index
    latest: Vec<Option<Arc<Event>>>,
    window: EventWindow,
    /// Roster index of the last other-parent creator and how many events in
    /// a row used it
    streak: Option<(usize, u64)>,
    /// Distinct other-parent creators used at the current birth round floor
    round_parents: HashSet<usize>,
    last_created: Option<Timestamp>,
}

impl EventCreator {
    /// Returns `None` if `self_id` is not in the roster
    pub fn new(self_id: NodeId, roster: Arc<Roster>, config: CreatorConfig) -> Option<Self> {
        let self_index = roster.index_of(self_id)?;
        Some(Self {
            self_index,
            self_id,
            latest: vec![None; roster.len()],
            tracker: TipsetTracker::new(Arc::clone(&roster)),
            roster,
            config,
            window: EventWindow::genesis(),
            streak: None,
            round_parents: HashSet::new(),
            last_created: None,
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn config(&self) -> &CreatorConfig {
        &self.config
    }

    /// Make a linked event available as a parent. Registering an event
    /// twice has no effect.
    pub fn register_event(&mut self, event: &Arc<Event>) {
        if self.tracker.contains(&event.hash) {
            return;
        }
        let Some(index) = self.roster.index_of(event.creator()) else {
            return;
        };
        if self.tracker.add_event(event).is_none() {
            return;
        }
        let newer = self.latest[index]
            .as_ref()
            .map_or(true, |current| event.generation() > current.generation());
        if newer {
            self.latest[index] = Some(Arc::clone(event));
        }
    }

    /// Adopt the window of the latest decided round
    pub fn set_event_window(&mut self, window: EventWindow) {
        if window.event_birth_round_floor != self.window.event_birth_round_floor {
            self.round_parents.clear();
        }
        self.window = window;
        self.tracker.expire(window.expired_threshold);
    }

    pub fn event_window(&self) -> EventWindow {
        self.window
    }

    /// Newest event of this node known to the creator
    pub fn latest_self_event(&self) -> Option<&Arc<Event>> {
        self.latest[self.self_index].as_ref()
    }

    /// Content for the next event of this node, if one should be created
    /// at `now`. Transactions are taken from `pool` only when an event is
    /// returned.
    pub fn try_create_event(
        &mut self,
        now: Timestamp,
        pool: &TransactionPool,
    ) -> Option<UnsignedEvent> {
        let interval = self.config.min_creation_interval().as_nanos() as u64;
        if let Some(last) = self.last_created {
            if now.nanos_since(last) < interval {
                return None;
            }
        }

        let self_parent = self.latest[self.self_index].clone();
        let other_parent = self.choose_other_parent(self_parent.as_deref());
        if self_parent.is_some() && other_parent.is_none() && self.roster.len() > 1 {
            trace!("No other-parent advances the tipset of {}", self.self_id);
            return None;
        }

        if let Some(chosen) = &other_parent {
            if let Some(index) = self.roster.index_of(chosen.creator()) {
                self.streak = match self.streak {
                    Some((last, count)) if last == index => Some((index, count + 1)),
                    _ => Some((index, 1)),
                };
                self.round_parents.insert(index);
            }
        }
        self.last_created = Some(now);

        let birth_round = self_parent
            .iter()
            .chain(other_parent.iter())
            .map(|p| p.birth_round())
            .fold(self.window.event_birth_round_floor, u64::max);
        let time_created = match &self_parent {
            Some(parent) if parent.time_created() >= now => parent.time_created().plus_nanos(1),
            _ => now,
        };
        let transactions = pool.take(self.config.max_transactions_per_event);

        debug!(
            "Creating event of {} in birth round {} with {} transactions",
            self.self_id,
            birth_round,
            transactions.len()
        );
        Some(UnsignedEvent::new(
            self.self_id,
            self_parent.as_deref().map(Event::descriptor),
            other_parent.as_deref().map(Event::descriptor),
            birth_round,
            time_created,
            transactions,
        ))
    }

    /// Best advancing candidate among the peers' newest events
    fn choose_other_parent(&self, self_parent: Option<&Event>) -> Option<Arc<Event>> {
        let empty = Tipset::empty(self.roster.len());
        let own = self_parent
            .and_then(|p| self.tracker.get(&p.hash))
            .unwrap_or(&empty);
        let cap_reached = self.round_parents.len() >= self.config.max_other_parents_per_round;

        let mut best: Option<(i64, &Arc<Event>)> = None;
        for (index, candidate) in self.latest.iter().enumerate() {
            let Some(candidate) = candidate else { continue };
            if index == self.self_index || self.window.is_ancient(candidate.birth_round()) {
                continue;
            }
            if cap_reached && !self.round_parents.contains(&index) {
                continue;
            }
            let Some(tipset) = self.tracker.get(&candidate.hash) else {
                continue;
            };
            let advancement = own.advancement_weight(tipset, &self.roster, self.self_index);
            if advancement == 0 {
                continue;
            }
            let repeats = match self.streak {
                Some((last, count)) if last == index => count,
                _ => 0,
            };
            let score = advancement as i64
                - (self.config.anti_selfishness_factor as i64).saturating_mul(repeats as i64);
            // Ties go to the lowest roster index
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, candidate));
            }
        }
        best.map(|(_, event)| Arc::clone(event))
    }
}
