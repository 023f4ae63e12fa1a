//! Fallen-behind detection
//!
//! During a sync each peer compares event windows. A peer whose ancient
//! threshold is past our pending round holds nothing we could still use, so
//! it reports us behind. Once enough peer weight agrees, the node needs a
//! state transfer instead of more gossip.

use hashgraph_core::types::{NodeId, PlatformStatusAction, Roster, Threshold};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

pub struct FallenBehindMonitor {
    roster: Arc<Roster>,
    threshold: Threshold,
    /// Roster weight of every member except this node
    peer_weight: u64,
    reports: Mutex<HashSet<NodeId>>,
    behind: watch::Sender<bool>,
    status: broadcast::Sender<PlatformStatusAction>,
}

impl FallenBehindMonitor {
    pub fn new(
        self_id: NodeId,
        roster: Arc<Roster>,
        threshold: Threshold,
        status: broadcast::Sender<PlatformStatusAction>,
    ) -> Self {
        let peer_weight = roster.total_weight() - roster.weight_of(self_id);
        let (behind, _) = watch::channel(false);
        Self {
            roster,
            threshold,
            peer_weight,
            reports: Mutex::new(HashSet::new()),
            behind,
            status,
        }
    }

    /// A sync with `peer` found this node behind
    pub fn report(&self, peer: NodeId) {
        let mut reports = self.reports.lock();
        if reports.insert(peer) {
            self.update(&reports);
        }
    }

    /// A sync with `peer` found this node current
    pub fn clear(&self, peer: NodeId) {
        let mut reports = self.reports.lock();
        if reports.remove(&peer) {
            self.update(&reports);
        }
    }

    /// Forget every report, e.g. after a state transfer
    pub fn reset(&self) {
        let mut reports = self.reports.lock();
        reports.clear();
        self.update(&reports);
    }

    fn update(&self, reports: &HashSet<NodeId>) {
        let weight = self.weight_of(reports);
        let behind = self.peer_weight > 0 && self.threshold.is_satisfied_by(weight, self.peer_weight);
        let was_behind = *self.behind.borrow();
        if behind == was_behind {
            return;
        }
        self.behind.send_replace(behind);
        let action = if behind {
            warn!(
                "Fallen behind: peers with weight {} of {} report it",
                weight, self.peer_weight
            );
            PlatformStatusAction::FallenBehindStarted
        } else {
            info!("No longer fallen behind");
            PlatformStatusAction::FallenBehindEnded
        };
        let _ = self.status.send(action);
    }

    fn weight_of(&self, reports: &HashSet<NodeId>) -> u64 {
        reports.iter().map(|id| self.roster.weight_of(*id)).sum()
    }

    pub fn has_fallen_behind(&self) -> bool {
        *self.behind.borrow()
    }

    /// Weight of the peers currently reporting this node behind
    pub fn reported_weight(&self) -> u64 {
        self.weight_of(&self.reports.lock())
    }

    /// Wait until this node has fallen behind
    pub async fn wait_until_behind(&self) {
        let mut rx = self.behind.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|behind| *behind).await;
    }
}
