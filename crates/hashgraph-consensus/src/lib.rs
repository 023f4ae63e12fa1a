//! Virtual-voting consensus for the hashgraph platform
//!
//! The engine assigns rounds to linked events, elects famous witnesses
//! without exchanging vote messages, and emits every decided round as a
//! totally ordered, timestamped [`ConsensusRound`](hashgraph_core::ConsensusRound).
//!
//! # Modules
//!
//! - [`engine`]: The consensus state machine
//! - [`config`]: Algorithm tunables
//! - [`error`]: Error types

pub mod config;
mod election;
pub mod engine;
pub mod error;
mod graph;
mod ordering;

#[cfg(test)]
mod test_graph;

pub use config::{ConsensusConfig, ConsensusTimestampSource};
pub use election::{Fame, RoundState};
pub use engine::ConsensusEngine;
pub use error::ConsensusError;
