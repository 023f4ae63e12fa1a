//! Node-local persistent state using sled
//!
//! Holds what a node needs to resume after a restart that the preconsensus
//! event files do not: its identity and the consensus snapshots produced for
//! decided rounds.

use crate::config::NodeState;
use hashgraph_core::types::ConsensusSnapshot;
use sled::Db;
use std::path::Path;
use thiserror::Error;

const NODE_STATE_KEY: &str = "node_state";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Storage backend for hashgraphd
pub struct Storage {
    db: Db,
    /// Snapshot tree: round (big endian) -> ConsensusSnapshot
    snapshots: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let snapshots = db.open_tree("snapshots")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            snapshots,
            metadata,
        })
    }

    /// Store the snapshot of a decided round
    pub fn put_snapshot(&self, snapshot: &ConsensusSnapshot) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(snapshot)?;
        self.snapshots.insert(snapshot.round.to_be_bytes(), value)?;
        Ok(())
    }

    /// Snapshot of the highest stored round
    pub fn latest_snapshot(&self) -> Result<Option<ConsensusSnapshot>, StorageError> {
        match self.snapshots.last()? {
            Some((_, bytes)) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop snapshots of rounds below `round`
    pub fn prune_snapshots(&self, round: u64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.snapshots.range(..round.to_be_bytes()).keys() {
            self.snapshots.remove(key?)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn put_node_state(&self, state: &NodeState) -> Result<(), StorageError> {
        self.put_metadata(NODE_STATE_KEY, &postcard::to_allocvec(state)?)
    }

    pub fn node_state(&self) -> Result<Option<NodeState>, StorageError> {
        match self.get_metadata(NODE_STATE_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
