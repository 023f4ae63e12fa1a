//! Node signing keys
//!
//! Provides key generation and event signing.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hashgraph_core::crypto::{compute_event_hash, event_sign_bytes};
use hashgraph_core::types::{Event, UnsignedEvent};
use rand::rngs::OsRng;
use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Event encoding failed: {0}")]
    Encoding(#[from] hashgraph_core::Error),
}

/// Ed25519 keypair for signing events and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing and recovery)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes this keypair was derived from
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Hash and sign event content.
    pub fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, CryptoError> {
        let hash = compute_event_hash(&unsigned)?;
        let signature = self.sign(&event_sign_bytes(&hash)).to_vec();
        Ok(Event {
            hash,
            unsigned,
            signature,
        })
    }

    /// Verify a signature
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let sig = Signature::from_bytes(signature);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", hex::encode(&self.public_key()[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashgraph_core::crypto::verify_event_signature;
    use hashgraph_core::types::{NodeId, Timestamp};

    #[test]
    fn test_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"test message";
        let sig = kp.sign(msg);

        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
        assert!(KeyPair::verify(&kp.public_key(), b"wrong message", &sig).is_err());
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = KeyPair::from_seed(&[5; 32]);
        let b = KeyPair::from_seed(&a.seed());
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_sign_event_verifies_with_core() {
        let kp = KeyPair::from_seed(&[9; 32]);
        let unsigned = UnsignedEvent::new(NodeId(1), None, None, 1, Timestamp(10), vec![]);
        let event = kp.sign_event(unsigned).unwrap();

        assert_eq!(event.signature.len(), 64);
        assert!(verify_event_signature(&kp.public_key(), &event).is_ok());
    }
}
