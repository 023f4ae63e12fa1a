//! Networking primitives for hashgraph gossip
//!
//! This crate provides:
//! - Node signing keys
//! - Length-prefixed message framing
//! - Gossip wire messages
//! - Framed peer connections over mutually authenticated TLS

pub mod crypto;
pub mod framing;
pub mod messages;
pub mod peer;
pub mod tls;
pub mod transport;

pub use crypto::KeyPair;
pub use framing::{Frame, FrameCodec};
pub use messages::Message;
pub use peer::PeerInfo;
pub use tls::{TlsContext, TlsError, TlsIdentity};
pub use transport::{Connection, PeerConnection, Transport, TransportError};
