//! Hashgraph Core Library
//!
//! This crate provides the event model, canonical encoding, and cryptographic
//! primitives shared by every component of the hashgraph platform.
//!
//! # Modules
//!
//! - [`types`]: Core types (Event, Roster, EventWindow, ConsensusRound, etc.)
//! - [`canonical`]: Deterministic serialization for hashing and the wire
//! - [`crypto`]: Hash derivations and signature utilities
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;
