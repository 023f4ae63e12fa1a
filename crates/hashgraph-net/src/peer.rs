//! Peer identity and information

use hashgraph_core::types::{Bytes32, NodeId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Information about a roster peer we gossip with
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    /// Roster node id
    pub node_id: NodeId,
    /// Gossip address
    pub addr: SocketAddr,
    /// Ed25519 public key from the roster
    pub public_key: Bytes32,
    /// DER certificate the peer presents on TLS links
    pub tls_certificate: Vec<u8>,
}

impl PeerInfo {
    /// Create new peer info
    pub fn new(
        node_id: NodeId,
        addr: SocketAddr,
        public_key: Bytes32,
        tls_certificate: Vec<u8>,
    ) -> Self {
        Self {
            node_id,
            addr,
            public_key,
            tls_certificate,
        }
    }

    /// Whether this node is expected to dial `other`.
    ///
    /// Exactly one side of every pair dials: the one with the smaller id.
    pub fn dials(local: NodeId, other: NodeId) -> bool {
        local < other
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.node_id, self.addr)
    }
}
