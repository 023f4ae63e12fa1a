//! Canonical encoding for hashgraph events
//!
//! All hashed, signed, gossiped and persisted objects use postcard
//! serialization with strict constraints:
//! - No maps/hashmaps
//! - Field order is Rust struct field order
//! - Transactions keep creator order

use crate::error::{Error, Result};
use crate::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
/// Every node of the same protocol version MUST produce identical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Parse a value previously produced by [`canonical_bytes`].
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Serialize a signed event for the wire or the preconsensus stream.
pub fn serialize_event(event: &Event) -> Result<Vec<u8>> {
    canonical_bytes(event)
}

/// Parse a signed event. The hash is not re-verified here.
pub fn parse_event(bytes: &[u8]) -> Result<Event> {
    from_canonical_bytes(bytes)
}
