//! Consensus engine errors

use hashgraph_core::types::{EventHash, NodeId};
use thiserror::Error;

/// Consensus errors.
///
/// Everything except configuration mistakes is fatal: the engine halts and
/// refuses further input, since continuing could produce an order that
/// differs from the rest of the network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("invalid consensus configuration: {0}")]
    InvalidConfig(String),

    #[error("a snapshot can only be loaded before any event is added")]
    SnapshotAfterEvents,

    #[error("consensus halted after a previous fatal error")]
    Halted,

    #[error("replay ended with {missing} judges of snapshot round {round} never added")]
    ReplayDiverged { round: u64, missing: usize },

    #[error("event {hash} was created by {creator}, who is not in the roster")]
    UnknownCreator { hash: EventHash, creator: NodeId },

    #[error("event {hash} references itself as a parent")]
    SelfReference { hash: EventHash },

    #[error("event {hash} references non-ancient parent {parent} that was never added")]
    MissingParent { hash: EventHash, parent: EventHash },

    #[error("event {hash} has generation {actual}, parents imply {expected}")]
    GenerationMismatch {
        hash: EventHash,
        expected: u64,
        actual: u64,
    },

    #[error("event {hash} by {creator} has a self-parent created by {parent_creator}")]
    SelfParentCreatorMismatch {
        hash: EventHash,
        creator: NodeId,
        parent_creator: NodeId,
    },

    #[error("event {hash} branches the chain of {creator} after generation {generation}")]
    Branch {
        hash: EventHash,
        creator: NodeId,
        generation: u64,
    },
}

impl ConsensusError {
    /// Whether this error halts the engine
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConsensusError::InvalidConfig(_) | ConsensusError::SnapshotAfterEvents
        )
    }
}
