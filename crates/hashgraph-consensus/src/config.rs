//! Consensus engine configuration

use crate::error::ConsensusError;
use hashgraph_core::types::Threshold;
use serde::{Deserialize, Serialize};

/// What an event's consensus timestamp is derived from before it is pushed
/// forward to keep timestamps strictly increasing.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusTimestampSource {
    /// The event's own creation time
    #[default]
    CreationTime,
    /// Median of the times the round's judges first received the event
    MedianReceivedTime,
}

/// Tunables of the virtual-voting algorithm.
///
/// Every node of a network must run with identical values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Every n-th voting round is a coin round
    pub coin_frequency: u64,
    /// Number of decided rounds whose events stay non-ancient
    pub rounds_non_ancient: u64,
    /// Number of decided rounds whose events stay in memory
    pub rounds_expired: u64,
    /// Minimum gap between consecutive consensus timestamps
    pub min_timestamp_increment_nanos: u64,
    /// Fraction of roster weight that makes a supermajority
    pub super_majority: Threshold,
    pub timestamp_source: ConsensusTimestampSource,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            coin_frequency: 12,
            rounds_non_ancient: 26,
            rounds_expired: 500,
            min_timestamp_increment_nanos: 1_000,
            super_majority: Threshold::SUPER_MAJORITY,
            timestamp_source: ConsensusTimestampSource::CreationTime,
        }
    }
}

impl ConsensusConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.coin_frequency < 3 {
            return Err(ConsensusError::InvalidConfig(format!(
                "coin_frequency must be at least 3, got {}",
                self.coin_frequency
            )));
        }
        if self.rounds_non_ancient == 0 {
            return Err(ConsensusError::InvalidConfig(
                "rounds_non_ancient must be positive".into(),
            ));
        }
        if self.rounds_expired < self.rounds_non_ancient {
            return Err(ConsensusError::InvalidConfig(format!(
                "rounds_expired ({}) is below rounds_non_ancient ({})",
                self.rounds_expired, self.rounds_non_ancient
            )));
        }
        if self.min_timestamp_increment_nanos == 0 {
            return Err(ConsensusError::InvalidConfig(
                "min_timestamp_increment_nanos must be positive".into(),
            ));
        }
        let t = self.super_majority;
        if t.denominator == 0 || t.numerator >= t.denominator || !t.is_at_least_super_majority()
        {
            return Err(ConsensusError::InvalidConfig(format!(
                "super_majority {}/{} must be at least 2/3 and below 1",
                t.numerator, t.denominator
            )));
        }
        Ok(())
    }
}
