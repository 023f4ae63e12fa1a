//! Cryptographic hash derivations for hashgraph events
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.
//! Signatures are Ed25519 over a domain-separated event hash.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for event hash derivation
pub const DOMAIN_EVENT: &[u8] = b"hashgraph-event";
/// Domain prefix for event signatures
pub const DOMAIN_EVENT_SIG: &[u8] = b"hashgraph-event-sig";
/// Domain prefix for roster digests
pub const DOMAIN_ROSTER: &[u8] = b"hashgraph-roster";
/// Domain prefix for coin-round bits
pub const DOMAIN_COIN: &[u8] = b"hashgraph-coin";

// =============================================================================
// EVENT HASH
// =============================================================================

/// Derive the hash of an event.
///
/// `EventHash = BLAKE3("hashgraph-event" || canonical_bytes(UnsignedEvent))`
pub fn compute_event_hash(unsigned: &UnsignedEvent) -> Result<EventHash> {
    let bytes = canonical_bytes(unsigned)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_EVENT);
    hasher.update(&bytes);

    Ok(EventHash(*hasher.finalize().as_bytes()))
}

/// Verify that an event's hash matches its content.
pub fn verify_event_hash(event: &Event) -> Result<()> {
    let computed = compute_event_hash(&event.unsigned)?;
    if computed != event.hash {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed.0),
            transmitted: hex::encode(event.hash.0),
        });
    }
    Ok(())
}

// =============================================================================
// SIGNATURES
// =============================================================================

/// Compute the bytes to sign for an event.
///
/// `sign_bytes = "hashgraph-event-sig" || event_hash`
pub fn event_sign_bytes(hash: &EventHash) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_EVENT_SIG.len() + 32);
    bytes.extend_from_slice(DOMAIN_EVENT_SIG);
    bytes.extend_from_slice(&hash.0);
    bytes
}

/// Verify an event's signature against the creator's public key.
pub fn verify_event_signature(public_key: &Bytes32, event: &Event) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let signature: [u8; 64] = event
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify(&event_sign_bytes(&event.hash), &Signature::from_bytes(&signature))
        .map_err(|_| Error::InvalidSignature)
}

// =============================================================================
// ROSTER & VOTING
// =============================================================================

/// Digest identifying a roster; peers must agree on it to gossip.
///
/// `RosterDigest = BLAKE3("hashgraph-roster" || canonical_bytes(Roster))`
pub fn roster_digest(roster: &Roster) -> Result<Bytes32> {
    let bytes = canonical_bytes(roster)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_ROSTER);
    hasher.update(&bytes);

    Ok(*hasher.finalize().as_bytes())
}

/// Pseudo-random vote used in coin rounds, derived from a witness signature.
pub fn coin_bit(signature: &[u8]) -> bool {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_COIN);
    hasher.update(signature);
    hasher.finalize().as_bytes()[0] & 1 == 1
}
