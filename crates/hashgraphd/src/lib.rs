//! hashgraphd - hashgraph consensus node
//!
//! Events arrive from gossip or from the local creator, pass intake
//! validation, are linked into the shadowgraph and written to the
//! preconsensus event stream before consensus orders them.

pub mod config;
pub mod creator;
pub mod gossip;
pub mod intake;
pub mod node;
pub mod pces;
pub mod shadowgraph;
pub mod storage;

#[cfg(test)]
mod test_util;

pub use node::{Node, NodeError, NodeOptions};
