//! Encoding test vectors
//!
//! These pin the canonical byte layout. Any change here is a wire and
//! hash-breaking protocol change.

use crate::canonical::*;
use crate::crypto::*;
use crate::types::*;

#[test]
fn vector_descriptor_bytes() {
    let descriptor = EventDescriptor {
        hash: EventHash([0xab; 32]),
        creator: NodeId(3),
        generation: 5,
        birth_round: 1,
    };
    let bytes = canonical_bytes(&descriptor).unwrap();

    let mut expected = vec![0xab; 32];
    expected.extend_from_slice(&[0x03, 0x05, 0x01]);
    assert_eq!(bytes, expected);
}

#[test]
fn vector_genesis_event_bytes() {
    let unsigned = UnsignedEvent::new(
        NodeId(2),
        None,
        None,
        1,
        Timestamp(300),
        vec![vec![7, 8]],
    );
    let bytes = canonical_bytes(&unsigned).unwrap();

    // creator, no self-parent, no other-parent, generation 1, birth round 1,
    // varint(300), one transaction of two bytes
    assert_eq!(
        bytes,
        vec![0x02, 0x00, 0x00, 0x01, 0x01, 0xac, 0x02, 0x01, 0x02, 0x07, 0x08]
    );
}

#[test]
fn vector_hash_stable_across_parse() {
    let unsigned = UnsignedEvent::new(
        NodeId(2),
        Some(EventDescriptor {
            hash: EventHash([1; 32]),
            creator: NodeId(2),
            generation: 1,
            birth_round: 1,
        }),
        None,
        1,
        Timestamp(301),
        vec![],
    );
    let hash = compute_event_hash(&unsigned).unwrap();
    let event = Event {
        hash,
        unsigned,
        signature: vec![0; 64],
    };

    let parsed = parse_event(&serialize_event(&event).unwrap()).unwrap();
    assert_eq!(compute_event_hash(&parsed.unsigned).unwrap(), hash);
    assert!(verify_event_hash(&parsed).is_ok());
}

#[test]
fn vector_event_json_shape() {
    let unsigned = UnsignedEvent::new(NodeId(7), None, None, 1, Timestamp(5), vec![]);
    let json = serde_json::to_value(&unsigned).unwrap();
    assert_eq!(json["creator"], 7);
    assert_eq!(json["generation"], 1);
    assert!(json["self_parent"].is_null());
}
