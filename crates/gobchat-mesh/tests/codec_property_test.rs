// Property-based tests for fragmentation, reassembly, relay TTLs and dedup

use gobchat_mesh::codec::FIXED_HEADER_LEN;
use gobchat_mesh::{Message, MessageCodec, PayloadType, ReassemblyBuffer, SeenSet};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::Duration;
use tokio::time::Instant;

const ORIGIN: &str = "gobchat_1700000000000_k3j9x0a2b";

fn payload_type() -> impl Strategy<Value = PayloadType> {
    prop_oneof![
        Just(PayloadType::Text),
        Just(PayloadType::VoiceRef),
        Just(PayloadType::FileChunk),
    ]
}

fn buffer() -> ReassemblyBuffer {
    ReassemblyBuffer::new(16, Duration::from_secs(60))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A message splits into ceil(S / L) frames, each within the link limit
    #[test]
    fn prop_fragment_count_matches_payload(
        payload in prop::collection::vec(any::<u8>(), 0..4000),
        extra in 1usize..400,
    ) {
        let max_payload = FIXED_HEADER_LEN + ORIGIN.len() + extra;
        let codec = MessageCodec::new(max_payload);
        let message = Message::new(ORIGIN.to_string(), 3, PayloadType::FileChunk, payload.clone());

        let frames = codec.encode_bytes(&message).unwrap();
        let expected = payload.len().div_ceil(extra).max(1);
        prop_assert_eq!(frames.len(), expected);
        prop_assert!(frames.iter().all(|f| f.len() <= max_payload));
    }

    /// Any arrival order reassembles the original message byte-for-byte
    #[test]
    fn prop_reassembly_in_any_order(
        payload in prop::collection::vec(any::<u8>(), 0..3000),
        extra in 1usize..200,
        ttl in any::<u8>(),
        kind in payload_type(),
        seed in any::<u64>(),
    ) {
        let codec = MessageCodec::new(FIXED_HEADER_LEN + ORIGIN.len() + extra);
        let message = Message::new(ORIGIN.to_string(), ttl, kind, payload);
        let mut frames = codec.encode_bytes(&message).unwrap();
        frames.shuffle(&mut StdRng::seed_from_u64(seed));

        let mut reassembly = buffer();
        let now = Instant::now();
        let last = frames.len() - 1;
        for (i, frame) in frames.iter().enumerate() {
            let decoded = codec.decode(frame, &mut reassembly, now).unwrap();
            if i < last {
                prop_assert!(decoded.is_none());
            } else {
                prop_assert_eq!(decoded, Some(message.clone()));
            }
        }
        prop_assert_eq!(reassembly.pending_count(), 0);
    }

    /// A strict subset of fragments never yields a message
    #[test]
    fn prop_incomplete_subset_yields_nothing(
        payload in prop::collection::vec(any::<u8>(), 2..3000),
        extra in 1usize..64,
        seed in any::<u64>(),
        keep in 0.0f64..1.0,
    ) {
        let codec = MessageCodec::new(FIXED_HEADER_LEN + ORIGIN.len() + extra);
        let message = Message::new(ORIGIN.to_string(), 5, PayloadType::VoiceRef, payload);
        let mut frames = codec.encode_bytes(&message).unwrap();
        prop_assume!(frames.len() > 1);
        frames.shuffle(&mut StdRng::seed_from_u64(seed));
        let kept = ((frames.len() as f64 * keep) as usize).min(frames.len() - 1);

        let mut reassembly = buffer();
        let now = Instant::now();
        for frame in &frames[..kept] {
            prop_assert!(codec.decode(frame, &mut reassembly, now).unwrap().is_none());
        }
        // Replaying what already arrived changes nothing
        for frame in &frames[..kept] {
            prop_assert!(codec.decode(frame, &mut reassembly, now).unwrap().is_none());
        }
    }

    /// Relay copies always carry a strictly smaller TTL; TTL 0 is never relayed
    #[test]
    fn prop_relay_ttl_decreases(ttl in any::<u8>()) {
        let message = Message::text(ORIGIN.to_string(), ttl, "hop");
        match message.relay_copy() {
            Some(copy) => {
                prop_assert!(copy.ttl < message.ttl);
                prop_assert_eq!(copy.ttl, ttl - 1);
                prop_assert_eq!(copy.id, message.id);
            }
            None => prop_assert_eq!(ttl, 0),
        }
    }

    /// However many peers hand over the same id, it is accepted exactly once
    #[test]
    fn prop_seen_set_accepts_once(
        senders in prop::collection::vec("[a-e]", 1..20),
        distinct in 1usize..10,
    ) {
        let mut seen = SeenSet::new(Duration::from_secs(600), 10_000);
        let ids: Vec<_> = (0..distinct)
            .map(|_| Message::text(ORIGIN.to_string(), 1, "x").id)
            .collect();
        let now = Instant::now();

        let mut accepted = 0;
        for (i, sender) in senders.iter().enumerate() {
            if seen.check_and_insert(ids[i % distinct], sender, now) {
                accepted += 1;
            }
        }
        prop_assert_eq!(accepted, distinct.min(senders.len()));
        for sender in &senders {
            prop_assert!(ids.iter().any(|id| seen.is_held_by(id, sender)));
        }
    }
}
