//! One sync exchange between two connected peers
//!
//! ```text
//!   initiator                         responder
//!   Hello            <------------->  Hello
//!   SyncData         -------------->
//!                    <--------------  SyncData
//!   TipKnowledge     <------------->  TipKnowledge
//!   Events* EndOfEvents <---------->  Events* EndOfEvents
//! ```
//!
//! After the tip exchange both sides stream concurrently, so neither can
//! stall the other by filling the connection buffer.

use super::fallen_behind::FallenBehindMonitor;
use crate::intake::{EventIntake, IntakeError, IntakeSummary};
use hashgraph_core::types::{Bytes32, Event, EventHash, NodeId};
use hashgraph_net::messages::{EventBatch, Hello, SyncData, TipKnowledge, PROTOCOL_VERSION};
use hashgraph_net::{Connection, Message, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Peer speaks protocol version {theirs}, this node {ours}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("Peer {0} uses a different roster")]
    RosterMismatch(NodeId),
    #[error("Peer {0} is not allowed on this connection")]
    UnexpectedPeer(NodeId),
    #[error("Expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    #[error("Peer answered {got} tip flags for {expected} tips")]
    TipCountMismatch { expected: usize, got: usize },
    #[error("Sync timeout")]
    Timeout,
    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),
}

/// What a sync needs from the local node
pub struct SyncContext {
    pub self_id: NodeId,
    pub roster_digest: Bytes32,
    pub intake: Arc<EventIntake>,
    pub fallen_behind: Arc<FallenBehindMonitor>,
    pub max_events_per_message: usize,
}

/// Result of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Events flowed both ways
    Completed {
        sent: usize,
        received: IntakeSummary,
    },
    /// The peer is too far ahead of this node
    SelfFallenBehind,
    /// This node is too far ahead of the peer
    PeerFallenBehind,
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Exchange `Hello`s and return the peer's node id
pub async fn handshake<S>(conn: &mut Connection<S>, ctx: &SyncContext) -> Result<NodeId, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&Message::Hello(Hello {
        protocol_version: PROTOCOL_VERSION,
        roster_digest: ctx.roster_digest,
        node_id: ctx.self_id,
    }))
    .await?;

    let hello = match conn.recv().await? {
        Message::Hello(hello) => hello,
        other => {
            return Err(SyncError::UnexpectedMessage {
                expected: "hello",
                got: other.name(),
            })
        }
    };
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(SyncError::VersionMismatch {
            ours: PROTOCOL_VERSION,
            theirs: hello.protocol_version,
        });
    }
    if hello.roster_digest != ctx.roster_digest {
        return Err(SyncError::RosterMismatch(hello.node_id));
    }
    if hello.node_id == ctx.self_id {
        return Err(SyncError::UnexpectedPeer(hello.node_id));
    }
    // The claimed id must be the one the TLS certificate proved
    if conn
        .authenticated_peer()
        .is_some_and(|peer| peer != hello.node_id)
    {
        return Err(SyncError::UnexpectedPeer(hello.node_id));
    }
    Ok(hello.node_id)
}

// =============================================================================
// EXCHANGE
// =============================================================================

fn local_sync_data(ctx: &SyncContext) -> SyncData {
    let shadowgraph = ctx.intake.shadowgraph();
    SyncData {
        event_window: shadowgraph.window(),
        tip_hashes: shadowgraph.tips(),
    }
}

/// Open a sync with a connected peer
pub async fn initiate<S>(
    conn: &mut Connection<S>,
    ctx: &SyncContext,
    peer: NodeId,
) -> Result<SyncOutcome, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mine = local_sync_data(ctx);
    conn.send(&Message::SyncData(mine.clone())).await?;
    let theirs = match conn.recv().await? {
        Message::SyncData(data) => data,
        other => {
            return Err(SyncError::UnexpectedMessage {
                expected: "sync-data",
                got: other.name(),
            })
        }
    };
    exchange(conn, ctx, peer, mine, theirs).await
}

/// Answer a sync opened by a peer with `theirs`
pub async fn respond<S>(
    conn: &mut Connection<S>,
    ctx: &SyncContext,
    peer: NodeId,
    theirs: SyncData,
) -> Result<SyncOutcome, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mine = local_sync_data(ctx);
    conn.send(&Message::SyncData(mine.clone())).await?;
    exchange(conn, ctx, peer, mine, theirs).await
}

async fn exchange<S>(
    conn: &mut Connection<S>,
    ctx: &SyncContext,
    peer: NodeId,
    mine: SyncData,
    theirs: SyncData,
) -> Result<SyncOutcome, SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Both sides see the same two windows and reach the same verdict
    if theirs.event_window.ancient_threshold > mine.event_window.pending_consensus_round {
        debug!("{} is ahead of this node", peer);
        ctx.fallen_behind.report(peer);
        return Ok(SyncOutcome::SelfFallenBehind);
    }
    ctx.fallen_behind.clear(peer);
    if mine.event_window.ancient_threshold > theirs.event_window.pending_consensus_round {
        debug!("{} has fallen behind this node", peer);
        return Ok(SyncOutcome::PeerFallenBehind);
    }

    let shadowgraph = ctx.intake.shadowgraph();
    let flags: Vec<bool> = theirs
        .tip_hashes
        .iter()
        .map(|h| shadowgraph.contains(h))
        .collect();
    conn.send(&Message::TipKnowledge(TipKnowledge {
        known: flags.clone(),
    }))
    .await?;
    let their_flags = match conn.recv().await? {
        Message::TipKnowledge(knowledge) => knowledge.known,
        other => {
            return Err(SyncError::UnexpectedMessage {
                expected: "tip-knowledge",
                got: other.name(),
            })
        }
    };
    if their_flags.len() != mine.tip_hashes.len() {
        return Err(SyncError::TipCountMismatch {
            expected: mine.tip_hashes.len(),
            got: their_flags.len(),
        });
    }

    let known_tips: Vec<EventHash> = mine
        .tip_hashes
        .iter()
        .zip(&their_flags)
        .filter(|(_, known)| **known)
        .map(|(hash, _)| *hash)
        .chain(
            theirs
                .tip_hashes
                .iter()
                .zip(&flags)
                .filter(|(_, known)| **known)
                .map(|(hash, _)| *hash),
        )
        .collect();
    let send_list = shadowgraph.find_send_list(&known_tips, &theirs.event_window);
    let sent = send_list.len();
    trace!("Sending {} events to {}", sent, peer);

    let messages: Vec<Message> = send_list
        .chunks(ctx.max_events_per_message.max(1))
        .map(|chunk| {
            Message::Events(EventBatch {
                events: chunk.iter().map(|e| Event::clone(e)).collect(),
            })
        })
        .chain(std::iter::once(Message::EndOfEvents))
        .collect();

    let (reader, writer) = conn.split_mut();
    let send = writer.send_all(&messages);
    let receive = async {
        let mut received = IntakeSummary::default();
        loop {
            match reader.recv().await? {
                Message::Events(batch) => {
                    let summary = ctx.intake.ingest_batch(batch.events).await?;
                    received.accepted += summary.accepted;
                    received.duplicates += summary.duplicates;
                    received.rejected += summary.rejected;
                }
                Message::EndOfEvents => return Ok::<_, SyncError>(received),
                other => {
                    return Err(SyncError::UnexpectedMessage {
                        expected: "events",
                        got: other.name(),
                    })
                }
            }
        }
    };
    let (sent_result, received) = tokio::join!(send, receive);
    sent_result?;
    let received = received?;

    debug!(
        "Synced with {}: sent {}, accepted {}, duplicates {}",
        peer, sent, received.accepted, received.duplicates
    );
    Ok(SyncOutcome::Completed { sent, received })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntakeConfig;
    use crate::shadowgraph::Shadowgraph;
    use crate::test_util::TestNetwork;
    use hashgraph_core::crypto::roster_digest;
    use hashgraph_core::types::{EventWindow, Roster, Threshold};
    use tokio::io::DuplexStream;
    use tokio::sync::{broadcast, mpsc};

    struct Side {
        ctx: SyncContext,
        _consensus_rx: mpsc::UnboundedReceiver<Arc<Event>>,
    }

    fn side(roster: &Arc<Roster>, id: u64) -> Side {
        let (consensus_tx, consensus_rx) = mpsc::unbounded_channel();
        let intake = EventIntake::new(
            Arc::clone(roster),
            IntakeConfig::default(),
            Arc::new(Shadowgraph::new()),
            None,
            consensus_tx,
            None,
        );
        let (status_tx, _) = broadcast::channel(16);
        Side {
            ctx: SyncContext {
                self_id: NodeId(id),
                roster_digest: roster_digest(roster).unwrap(),
                intake: Arc::new(intake),
                fallen_behind: Arc::new(FallenBehindMonitor::new(
                    NodeId(id),
                    Arc::clone(roster),
                    Threshold::MAJORITY,
                    status_tx,
                )),
                max_events_per_message: 2,
            },
            _consensus_rx: consensus_rx,
        }
    }

    fn pipe() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Connection::new(a), Connection::new(b))
    }

    async fn sync_pair(a: &SyncContext, b: &SyncContext) -> (SyncOutcome, SyncOutcome) {
        let (mut left, mut right) = pipe();
        let initiator = async {
            let peer = handshake(&mut left, a).await?;
            initiate(&mut left, a, peer).await
        };
        let responder = async {
            let peer = handshake(&mut right, b).await?;
            match right.recv().await? {
                Message::SyncData(data) => respond(&mut right, b, peer, data).await,
                other => panic!("unexpected {}", other.name()),
            }
        };
        let (l, r) = tokio::join!(initiator, responder);
        (l.unwrap(), r.unwrap())
    }

    #[tokio::test]
    async fn test_sync_transfers_missing_events_both_ways() {
        let mut net = TestNetwork::new(3);
        let a = side(&net.roster, 0);
        let b = side(&net.roster, 1);

        let shared = net.event(2, None, None);
        let a0 = net.event(0, None, Some(&shared));
        let a1 = net.event(0, Some(&a0), None);
        let a2 = net.event(0, Some(&a1), None);
        let b0 = net.event(1, None, Some(&shared));

        a.ctx
            .intake
            .ingest_batch(vec![
                (*shared).clone(),
                (*a0).clone(),
                (*a1).clone(),
                (*a2).clone(),
            ])
            .await
            .unwrap();
        b.ctx
            .intake
            .ingest_batch(vec![(*shared).clone(), (*b0).clone()])
            .await
            .unwrap();

        let (left, right) = sync_pair(&a.ctx, &b.ctx).await;
        // Neither side knows the other's tip, so everything is offered
        assert!(matches!(
            left,
            SyncOutcome::Completed { sent: 4, received } if received.accepted == 1
        ));
        assert!(matches!(
            right,
            SyncOutcome::Completed { sent: 2, received } if received.accepted == 3
        ));

        for hash in [shared.hash, a0.hash, a1.hash, a2.hash, b0.hash] {
            assert!(a.ctx.intake.shadowgraph().contains(&hash));
            assert!(b.ctx.intake.shadowgraph().contains(&hash));
        }

        // A second exchange has nothing left to send
        let (left, right) = sync_pair(&a.ctx, &b.ctx).await;
        assert!(matches!(left, SyncOutcome::Completed { sent: 0, .. }));
        assert!(matches!(right, SyncOutcome::Completed { sent: 0, .. }));
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_roster() {
        let net = TestNetwork::new(2);
        let other = TestNetwork::new(3);
        let a = side(&net.roster, 0);
        let b = side(&other.roster, 1);

        let (mut left, mut right) = pipe();
        let (l, r) = tokio::join!(handshake(&mut left, &a.ctx), handshake(&mut right, &b.ctx));
        assert!(matches!(l, Err(SyncError::RosterMismatch(NodeId(1)))));
        assert!(matches!(r, Err(SyncError::RosterMismatch(NodeId(0)))));
    }

    #[tokio::test]
    async fn test_peer_ahead_reports_fallen_behind() {
        let net = TestNetwork::new(3);
        let a = side(&net.roster, 0);
        let b = side(&net.roster, 1);
        b.ctx.intake.shadowgraph().expire(EventWindow {
            pending_consensus_round: 20,
            event_birth_round_floor: 20,
            ancient_threshold: 15,
            expired_threshold: 10,
        });

        let (left, right) = sync_pair(&a.ctx, &b.ctx).await;
        assert_eq!(left, SyncOutcome::SelfFallenBehind);
        assert_eq!(right, SyncOutcome::PeerFallenBehind);
        assert_eq!(a.ctx.fallen_behind.reported_weight(), 1);
        assert!(!b.ctx.fallen_behind.has_fallen_behind());
    }
}
