//! Ordering and timestamping of events within a decided round

use hashgraph_core::types::{EventHash, NodeId, Timestamp};

/// Sort key of an event reaching consensus; field order is precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct OrderingKey {
    pub median_received: Timestamp,
    pub generation: u64,
    pub creator: NodeId,
    pub hash: EventHash,
}

/// Median of a set of times; the upper median for even counts.
pub(crate) fn median(times: &mut [Timestamp]) -> Option<Timestamp> {
    times.sort_unstable();
    times.get(times.len() / 2).copied()
}

/// Hands out strictly increasing consensus timestamps.
#[derive(Clone, Debug)]
pub(crate) struct TimestampAssigner {
    /// Consensus time of the last transaction ordered so far
    last: Option<Timestamp>,
    increment_nanos: u64,
}

impl TimestampAssigner {
    pub fn new(last: Option<Timestamp>, increment_nanos: u64) -> Self {
        Self {
            last,
            increment_nanos,
        }
    }

    pub fn last(&self) -> Option<Timestamp> {
        self.last
    }

    /// Timestamp for the next event, at or after `base`. Each transaction of
    /// the event occupies one increment.
    pub fn assign(&mut self, base: Timestamp, transaction_count: usize) -> Timestamp {
        let timestamp = match self.last {
            Some(last) => base.max(last.plus_nanos(self.increment_nanos)),
            None => base,
        };
        let span = (transaction_count.saturating_sub(1) as u64).saturating_mul(self.increment_nanos);
        self.last = Some(timestamp.plus_nanos(span));
        timestamp
    }

    /// Advance the clock for a round in which no event reached consensus.
    pub fn advance_empty_round(&mut self, judge_times: &mut [Timestamp]) -> Timestamp {
        let next = match self.last {
            Some(last) => last.plus_nanos(self.increment_nanos),
            None => median(judge_times).unwrap_or_default(),
        };
        self.last = Some(next);
        next
    }
}
