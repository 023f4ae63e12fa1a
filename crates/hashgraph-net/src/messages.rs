//! Gossip wire messages
//!
//! Every message maps to exactly one [`FrameType`]; payloads are postcard.

use crate::framing::{Frame, FrameType};
use hashgraph_core::types::{Bytes32, Event, EventHash, EventWindow, NodeId};
use serde::{Deserialize, Serialize};

/// Version of the sync protocol spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// First message on every connection
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub roster_digest: Bytes32,
    pub node_id: NodeId,
}

/// Opening message of a sync: what the sender knows
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncData {
    pub event_window: EventWindow,
    /// Hashes of the sender's tips (events without known children)
    pub tip_hashes: Vec<EventHash>,
}

/// One flag per tip received in [`SyncData`], true if the sender has it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TipKnowledge {
    pub known: Vec<bool>,
}

/// Events in topological order
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventBatch {
    pub events: Vec<Event>,
}

/// Any gossip message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Ping,
    Pong,
    Hello(Hello),
    SyncData(SyncData),
    TipKnowledge(TipKnowledge),
    Events(EventBatch),
    EndOfEvents,
}

impl Message {
    /// Short name for logs and protocol errors
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Hello(_) => "hello",
            Message::SyncData(_) => "sync-data",
            Message::TipKnowledge(_) => "tip-knowledge",
            Message::Events(_) => "events",
            Message::EndOfEvents => "end-of-events",
        }
    }

    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let frame = match self {
            Message::Ping => Frame::ping(),
            Message::Pong => Frame::pong(),
            Message::Hello(m) => Frame::new(FrameType::Hello, postcard::to_allocvec(m)?),
            Message::SyncData(m) => Frame::new(FrameType::SyncData, postcard::to_allocvec(m)?),
            Message::TipKnowledge(m) => {
                Frame::new(FrameType::TipKnowledge, postcard::to_allocvec(m)?)
            }
            Message::Events(m) => Frame::new(FrameType::Events, postcard::to_allocvec(m)?),
            Message::EndOfEvents => Frame::new(FrameType::EndOfEvents, vec![]),
        };
        Ok(frame)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, postcard::Error> {
        let message = match frame.frame_type {
            FrameType::Ping => Message::Ping,
            FrameType::Pong => Message::Pong,
            FrameType::Hello => Message::Hello(postcard::from_bytes(&frame.payload)?),
            FrameType::SyncData => Message::SyncData(postcard::from_bytes(&frame.payload)?),
            FrameType::TipKnowledge => {
                Message::TipKnowledge(postcard::from_bytes(&frame.payload)?)
            }
            FrameType::Events => Message::Events(postcard::from_bytes(&frame.payload)?),
            FrameType::EndOfEvents => Message::EndOfEvents,
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashgraph_core::types::{Timestamp, UnsignedEvent};

    #[test]
    fn test_message_frame_types() {
        let hello = Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            roster_digest: [3; 32],
            node_id: NodeId(4),
        });
        assert_eq!(hello.to_frame().unwrap().frame_type, FrameType::Hello);
        assert_eq!(
            Message::EndOfEvents.to_frame().unwrap().frame_type,
            FrameType::EndOfEvents
        );
    }

    #[test]
    fn test_event_batch_through_frame() {
        let event = Event {
            hash: EventHash([1; 32]),
            unsigned: UnsignedEvent::new(NodeId(0), None, None, 1, Timestamp(1), vec![vec![1]]),
            signature: vec![2; 64],
        };
        let message = Message::Events(EventBatch {
            events: vec![event],
        });
        let frame = message.to_frame().unwrap();
        assert_eq!(Message::from_frame(&frame).unwrap(), message);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let frame = Frame::new(FrameType::SyncData, vec![0xff; 3]);
        assert!(Message::from_frame(&frame).is_err());
    }
}
