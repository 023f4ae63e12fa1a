//! Virtual voting on witness fame
//!
//! Witnesses of later rounds vote on each witness of an undecided round.
//! First-round voters vote on whether they see the candidate; later voters
//! take the weighted majority of the witnesses they strongly see in the
//! previous round and decide once that majority is a supermajority. Every
//! `coin_frequency`-th voting round is a coin round that breaks stalemates.
//!
//! A vote depends only on the voter's ancestry, so each (voter, candidate)
//! vote is computed once and kept until the candidate's round is forgotten.

use crate::config::ConsensusConfig;
use crate::graph::Hashgraph;
use hashgraph_core::crypto::coin_bit;
use hashgraph_core::types::EventHash;
use std::collections::HashMap;
use tracing::trace;

/// Fame verdict of a witness
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fame {
    Undecided,
    Famous,
    NotFamous,
}

/// Lifecycle of a round's election
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundState {
    /// No witness of the next round has voted yet
    Undecided,
    /// Votes are being collected
    Deciding,
    /// Every witness has a verdict
    Decided,
}

#[derive(Debug, Default)]
pub(crate) struct Elections {
    verdicts: HashMap<EventHash, bool>,
    /// (voter, candidate) -> vote
    votes: HashMap<(EventHash, EventHash), bool>,
    /// Votes computed so far, cache hits excluded
    computed: u64,
}

impl Elections {
    pub fn fame(&self, hash: &EventHash) -> Fame {
        match self.verdicts.get(hash) {
            Some(true) => Fame::Famous,
            Some(false) => Fame::NotFamous,
            None => Fame::Undecided,
        }
    }

    pub fn set_verdict(&mut self, hash: EventHash, famous: bool) {
        self.verdicts.insert(hash, famous);
    }

    /// Try to decide every witness of `round`. Returns true once all of them
    /// have a verdict.
    pub fn decide_round(
        &mut self,
        graph: &Hashgraph,
        round: u64,
        config: &ConsensusConfig,
    ) -> bool {
        let witnesses = graph.witnesses_in(round);
        if witnesses.is_empty() {
            return false;
        }
        for candidate in witnesses {
            if !self.verdicts.contains_key(candidate) {
                self.decide_witness(graph, round, *candidate, config);
            }
        }
        witnesses.iter().all(|w| self.verdicts.contains_key(w))
    }

    fn decide_witness(
        &mut self,
        graph: &Hashgraph,
        round: u64,
        candidate: EventHash,
        config: &ConsensusConfig,
    ) {
        let (Some(y), Some(max_round)) = (graph.get(&candidate), graph.max_witness_round())
        else {
            return;
        };
        let threshold = config.super_majority;
        let total = graph.roster().total_weight();

        for voting_round in round + 1..=max_round {
            let diff = voting_round - round;
            for voter_hash in graph.witnesses_in(voting_round) {
                if self.votes.contains_key(&(*voter_hash, candidate)) {
                    continue;
                }
                let Some(x) = graph.get(voter_hash) else {
                    continue;
                };

                let vote = if diff == 1 {
                    x.sees(y)
                } else {
                    let mut yes = Vec::new();
                    let mut no = Vec::new();
                    for s in graph.strongly_seen_witnesses(x, voting_round - 1, threshold) {
                        match self.votes.get(&(s.hash(), candidate)) {
                            Some(true) => yes.push(s),
                            Some(false) => no.push(s),
                            None => {}
                        }
                    }
                    let yes_weight = graph.creator_weight(yes);
                    let no_weight = graph.creator_weight(no);
                    let super_yes = threshold.is_satisfied_by(yes_weight, total);
                    let super_no = threshold.is_satisfied_by(no_weight, total);

                    if diff % config.coin_frequency != 0 {
                        if super_yes || super_no {
                            trace!(
                                "Witness {} of round {} decided {} by {}",
                                candidate,
                                round,
                                if super_yes { "famous" } else { "not famous" },
                                voter_hash
                            );
                            self.verdicts.insert(candidate, super_yes);
                            return;
                        }
                        yes_weight >= no_weight
                    } else if super_yes {
                        true
                    } else if super_no {
                        false
                    } else {
                        coin_bit(&x.event.signature)
                    }
                };
                self.votes.insert((*voter_hash, candidate), vote);
                self.computed += 1;
            }
        }
    }

    #[cfg(test)]
    pub fn votes_computed(&self) -> u64 {
        self.computed
    }

    /// Drop votes about the given candidates
    pub fn forget(&mut self, candidates: &[EventHash]) {
        if candidates.is_empty() {
            return;
        }
        self.votes.retain(|(_, c), _| !candidates.contains(c));
    }

    /// Drop verdicts of events that no longer exist
    pub fn retain_verdicts(&mut self, keep: impl Fn(&EventHash) -> bool) {
        self.verdicts.retain(|h, _| keep(h));
    }
}
