//! Core types for the hashgraph platform
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte fixed-size array used for hashes and keys.
pub type Bytes32 = [u8; 32];

/// The first round of a hashgraph. Genesis events are born in this round.
pub const ROUND_FIRST: u64 = 1;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Roster member identifier
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Event hash: BLAKE3("hashgraph-event" || canonical_bytes(UnsignedEvent))
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHash(pub Bytes32);

impl EventHash {
    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventHash({})", self)
    }
}

/// Wall-clock instant in nanoseconds since the unix epoch
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// This instant moved forward by `nanos`, saturating at the maximum
    pub fn plus_nanos(&self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Nanoseconds elapsed since `earlier` (zero if `earlier` is later)
    pub fn nanos_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Reference to a parent event as it is carried inside a child
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventDescriptor {
    pub hash: EventHash,
    pub creator: NodeId,
    pub generation: u64,
    pub birth_round: u64,
}

/// Event content covered by the hash (everything except the signature)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub creator: NodeId,
    /// Creator's previous event, absent only for the creator's first event
    pub self_parent: Option<EventDescriptor>,
    /// Event received from another creator
    pub other_parent: Option<EventDescriptor>,
    /// max(parent generations) + 1, or 1 without parents
    pub generation: u64,
    pub birth_round: u64,
    pub time_created: Timestamp,
    /// Opaque application payloads, in creator order
    pub transactions: Vec<Vec<u8>>,
}

impl UnsignedEvent {
    /// Build event content, deriving the generation from the parents.
    pub fn new(
        creator: NodeId,
        self_parent: Option<EventDescriptor>,
        other_parent: Option<EventDescriptor>,
        birth_round: u64,
        time_created: Timestamp,
        transactions: Vec<Vec<u8>>,
    ) -> Self {
        let generation = expected_generation(self_parent.as_ref(), other_parent.as_ref());
        Self {
            creator,
            self_parent,
            other_parent,
            generation,
            birth_round,
            time_created,
            transactions,
        }
    }

    /// Iterate the present parents, self-parent first
    pub fn parents(&self) -> impl Iterator<Item = &EventDescriptor> {
        self.self_parent.iter().chain(self.other_parent.iter())
    }

    /// Sum of all transaction payload sizes
    pub fn transaction_bytes(&self) -> usize {
        self.transactions.iter().map(Vec::len).sum()
    }
}

/// Generation implied by a pair of parents.
pub fn expected_generation(
    self_parent: Option<&EventDescriptor>,
    other_parent: Option<&EventDescriptor>,
) -> u64 {
    self_parent
        .iter()
        .chain(other_parent.iter())
        .map(|p| p.generation)
        .max()
        .map_or(1, |g| g + 1)
}

/// Signed, immutable hashgraph event
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub hash: EventHash,
    pub unsigned: UnsignedEvent,
    /// Ed25519 signature over the hash (64 bytes)
    pub signature: Vec<u8>,
}

impl Event {
    pub fn creator(&self) -> NodeId {
        self.unsigned.creator
    }

    pub fn generation(&self) -> u64 {
        self.unsigned.generation
    }

    pub fn birth_round(&self) -> u64 {
        self.unsigned.birth_round
    }

    pub fn time_created(&self) -> Timestamp {
        self.unsigned.time_created
    }

    pub fn self_parent(&self) -> Option<&EventDescriptor> {
        self.unsigned.self_parent.as_ref()
    }

    pub fn other_parent(&self) -> Option<&EventDescriptor> {
        self.unsigned.other_parent.as_ref()
    }

    pub fn parents(&self) -> impl Iterator<Item = &EventDescriptor> {
        self.unsigned.parents()
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.unsigned.transactions
    }

    /// Descriptor used by children to reference this event
    pub fn descriptor(&self) -> EventDescriptor {
        EventDescriptor {
            hash: self.hash,
            creator: self.unsigned.creator,
            generation: self.unsigned.generation,
            birth_round: self.unsigned.birth_round,
        }
    }
}

// =============================================================================
// ROSTER
// =============================================================================

/// A single voting member
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub node_id: NodeId,
    pub weight: u64,
    /// Ed25519 verifying key
    pub public_key: Bytes32,
}

/// Ordered membership with consensus weights.
///
/// Entries are sorted by node id so that every node iterates the roster in the
/// same order; the position of an entry is its roster index.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    /// Create a roster, sorting entries by node id.
    pub fn new(mut entries: Vec<RosterEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::InvalidRoster("roster has no entries".into()));
        }
        entries.sort_by_key(|e| e.node_id);
        for pair in entries.windows(2) {
            if pair[0].node_id == pair[1].node_id {
                return Err(Error::InvalidRoster(format!(
                    "duplicate node id {}",
                    pair[0].node_id
                )));
            }
        }
        let total = entries
            .iter()
            .try_fold(0u64, |acc, e| acc.checked_add(e.weight))
            .ok_or_else(|| Error::InvalidRoster("total weight overflows".into()))?;
        if total == 0 {
            return Err(Error::InvalidRoster("total weight is zero".into()));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    /// Position of a node in the roster
    pub fn index_of(&self, node_id: NodeId) -> Option<usize> {
        self.entries
            .binary_search_by_key(&node_id, |e| e.node_id)
            .ok()
    }

    pub fn entry(&self, node_id: NodeId) -> Option<&RosterEntry> {
        self.index_of(node_id).map(|i| &self.entries[i])
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.index_of(node_id).is_some()
    }

    /// Weight of a node, zero for non-members
    pub fn weight_of(&self, node_id: NodeId) -> u64 {
        self.entry(node_id).map_or(0, |e| e.weight)
    }

    pub fn weight_at(&self, index: usize) -> u64 {
        self.entries.get(index).map_or(0, |e| e.weight)
    }

    pub fn node_at(&self, index: usize) -> Option<NodeId> {
        self.entries.get(index).map(|e| e.node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|e| e.node_id)
    }
}

// =============================================================================
// THRESHOLDS
// =============================================================================

/// Strict weight threshold `part / whole > numerator / denominator`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Threshold {
    pub numerator: u64,
    pub denominator: u64,
}

impl Threshold {
    /// More than two thirds
    pub const SUPER_MAJORITY: Threshold = Threshold {
        numerator: 2,
        denominator: 3,
    };
    /// More than one half
    pub const MAJORITY: Threshold = Threshold {
        numerator: 1,
        denominator: 2,
    };

    pub fn new(numerator: u64, denominator: u64) -> Result<Self> {
        if denominator == 0 || numerator == 0 || numerator >= denominator {
            return Err(Error::InvalidThreshold(format!(
                "{}/{} is not a fraction in (0, 1)",
                numerator, denominator
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Whether `part` of `whole` exceeds this fraction.
    pub fn is_satisfied_by(&self, part: u64, whole: u64) -> bool {
        part as u128 * self.denominator as u128 > whole as u128 * self.numerator as u128
    }

    /// Whether this threshold is at least as strict as a supermajority
    pub fn is_at_least_super_majority(&self) -> bool {
        self.numerator as u128 * 3 >= self.denominator as u128 * 2
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::SUPER_MAJORITY
    }
}

// =============================================================================
// EVENT WINDOW
// =============================================================================

/// Boundary between live, ancient and expired events.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventWindow {
    /// The lowest round not yet decided
    pub pending_consensus_round: u64,
    /// Birth round assigned to newly created events
    pub event_birth_round_floor: u64,
    /// Events born before this round are ancient
    pub ancient_threshold: u64,
    /// Events born before this round may be dropped from memory
    pub expired_threshold: u64,
}

impl EventWindow {
    /// Window before any round has been decided
    pub fn genesis() -> Self {
        Self {
            pending_consensus_round: ROUND_FIRST,
            event_birth_round_floor: ROUND_FIRST,
            ancient_threshold: ROUND_FIRST,
            expired_threshold: ROUND_FIRST,
        }
    }

    /// The most recently decided round, zero before the first decision
    pub fn latest_consensus_round(&self) -> u64 {
        self.pending_consensus_round.saturating_sub(1)
    }

    pub fn is_ancient(&self, birth_round: u64) -> bool {
        birth_round < self.ancient_threshold
    }

    pub fn is_expired(&self, birth_round: u64) -> bool {
        birth_round < self.expired_threshold
    }
}

impl Default for EventWindow {
    fn default() -> Self {
        Self::genesis()
    }
}

// =============================================================================
// CONSENSUS OUTPUT
// =============================================================================

/// Identity of a judge in a decided round
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JudgeId {
    pub creator: NodeId,
    pub hash: EventHash,
}

/// Minimum birth round among the judges of a decided round
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinimumJudgeInfo {
    pub round: u64,
    pub minimum_judge_birth_round: u64,
}

/// State needed to resume consensus after a restart
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusSnapshot {
    /// Last decided round
    pub round: u64,
    pub judge_ids: Vec<JudgeId>,
    /// Oldest round first
    pub minimum_judge_info_list: Vec<MinimumJudgeInfo>,
    pub next_consensus_number: u64,
    /// Consensus time of the last transaction ordered so far
    pub consensus_timestamp: Timestamp,
}

/// An event with its place in the total order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusEvent {
    pub event: Arc<Event>,
    /// Position in the total order, counted from zero across all rounds
    pub consensus_order: u64,
    pub consensus_timestamp: Timestamp,
}

impl ConsensusEvent {
    /// Consensus time of the transaction at `index` within this event
    pub fn transaction_timestamp(&self, index: usize, increment_nanos: u64) -> Timestamp {
        self.consensus_timestamp
            .plus_nanos((index as u64).saturating_mul(increment_nanos))
    }
}

/// Output of the consensus engine for one decided round
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusRound {
    pub round: u64,
    /// Events in consensus order
    pub events: Vec<ConsensusEvent>,
    pub judges: Vec<JudgeId>,
    /// Window in effect once this round is decided
    pub event_window: EventWindow,
    pub snapshot: ConsensusSnapshot,
}

impl ConsensusRound {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Consensus time of the round (time of its last transaction)
    pub fn consensus_timestamp(&self) -> Timestamp {
        self.snapshot.consensus_timestamp
    }
}

// =============================================================================
// PLATFORM STATUS
// =============================================================================

/// Notifications for the external platform status state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformStatusAction {
    /// Preconsensus events are being replayed
    ReplayStarted,
    /// Replay finished, gossip may resume
    ReplayDone,
    /// Enough peers report this node behind; a reconnect is needed
    FallenBehindStarted,
    /// The node caught up without a reconnect
    FallenBehindEnded,
    /// An event created by this node reached consensus
    SelfEventReachedConsensus { round: u64 },
    /// Unrecoverable failure; processing has stopped
    CatastrophicFailure { reason: String },
}
