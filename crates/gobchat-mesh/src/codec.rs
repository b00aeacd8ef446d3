//! Message fragmentation and reassembly over size-limited link payloads
//!
//! Every frame starts with a fixed header followed by the origin id and a
//! slice of the message payload:
//!
//! ```text
//! version u8 | message_id [u8;16] | fragment_index u16 | fragment_count u16 |
//! ttl u8 | payload_type u8 | created_at_ms i64 | origin_len u8 | origin | fragment
//! ```
//!
//! Integers are big-endian.

use crate::error::{MeshError, MeshResult};
use crate::types::{Message, MessageId, PayloadType, PeerId};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Wire protocol version carried in every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size without the variable-length origin id
pub const FIXED_HEADER_LEN: usize = 32;

/// One link-sized piece of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: MessageId,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub ttl: u8,
    pub payload_type: PayloadType,
    pub created_at_ms: i64,
    pub origin_id: PeerId,
    pub fragment: Vec<u8>,
}

impl Frame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let origin = self.origin_id.as_bytes();
        let mut bytes = Vec::with_capacity(FIXED_HEADER_LEN + origin.len() + self.fragment.len());
        bytes.push(PROTOCOL_VERSION);
        bytes.extend_from_slice(self.message_id.as_bytes());
        bytes.extend_from_slice(&self.fragment_index.to_be_bytes());
        bytes.extend_from_slice(&self.fragment_count.to_be_bytes());
        bytes.push(self.ttl);
        bytes.push(self.payload_type.code());
        bytes.extend_from_slice(&self.created_at_ms.to_be_bytes());
        bytes.push(origin.len() as u8);
        bytes.extend_from_slice(origin);
        bytes.extend_from_slice(&self.fragment);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        let version = *bytes
            .first()
            .ok_or_else(|| MeshError::MalformedFrame("empty frame".to_string()))?;
        if version != PROTOCOL_VERSION {
            return Err(MeshError::UnsupportedVersion(version));
        }
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(MeshError::MalformedFrame(format!(
                "frame of {} bytes is shorter than the header",
                bytes.len()
            )));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[1..17]);
        let fragment_index = u16::from_be_bytes([bytes[17], bytes[18]]);
        let fragment_count = u16::from_be_bytes([bytes[19], bytes[20]]);
        let ttl = bytes[21];
        let payload_type = PayloadType::from_code(bytes[22]).ok_or_else(|| {
            MeshError::MalformedFrame(format!("unknown payload type {}", bytes[22]))
        })?;
        let mut created = [0u8; 8];
        created.copy_from_slice(&bytes[23..31]);
        let created_at_ms = i64::from_be_bytes(created);
        let origin_len = bytes[31] as usize;

        let origin_end = FIXED_HEADER_LEN + origin_len;
        if bytes.len() < origin_end {
            return Err(MeshError::MalformedFrame("truncated origin id".to_string()));
        }
        let origin_id = std::str::from_utf8(&bytes[FIXED_HEADER_LEN..origin_end])
            .map_err(|_| MeshError::MalformedFrame("origin id is not UTF-8".to_string()))?
            .to_string();

        Ok(Self {
            message_id: MessageId::from_bytes(id),
            fragment_index,
            fragment_count,
            ttl,
            payload_type,
            created_at_ms,
            origin_id,
            fragment: bytes[origin_end..].to_vec(),
        })
    }
}

/// Splits messages into frames no larger than the link's payload size
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_payload: usize,
}

impl MessageCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Payload bytes that fit in a single frame of `message`
    pub fn chunk_size(&self, message: &Message) -> MeshResult<usize> {
        let origin_len = message.origin_id.len();
        if origin_len > u8::MAX as usize {
            return Err(MeshError::MessageTooLarge(format!(
                "origin id of {} bytes",
                origin_len
            )));
        }

        let header = FIXED_HEADER_LEN + origin_len;
        match self.max_payload.checked_sub(header) {
            Some(chunk) if chunk > 0 => Ok(chunk),
            _ => Err(MeshError::MessageTooLarge(format!(
                "link payload of {} bytes cannot fit a {} byte header",
                self.max_payload, header
            ))),
        }
    }

    /// Number of frames `message` encodes to
    pub fn fragment_count(&self, message: &Message) -> MeshResult<usize> {
        let chunk = self.chunk_size(message)?;
        let count = message.payload.len().div_ceil(chunk).max(1);
        if count > u16::MAX as usize {
            return Err(MeshError::MessageTooLarge(format!(
                "{} bytes need {} fragments",
                message.payload.len(),
                count
            )));
        }
        Ok(count)
    }

    pub fn encode(&self, message: &Message) -> MeshResult<Vec<Frame>> {
        let chunk = self.chunk_size(message)?;
        let count = self.fragment_count(message)?;
        let created_at_ms = message.created_at.timestamp_millis();

        let frames: Vec<Frame> = (0..count)
            .map(|index| {
                let start = (index * chunk).min(message.payload.len());
                let end = (start + chunk).min(message.payload.len());
                Frame {
                    message_id: message.id,
                    fragment_index: index as u16,
                    fragment_count: count as u16,
                    ttl: message.ttl,
                    payload_type: message.payload_type,
                    created_at_ms,
                    origin_id: message.origin_id.clone(),
                    fragment: message.payload[start..end].to_vec(),
                }
            })
            .collect();

        debug!(
            message_id = %message.id,
            "Encoded {} bytes into {} frames",
            message.payload.len(),
            frames.len()
        );
        Ok(frames)
    }

    pub fn encode_bytes(&self, message: &Message) -> MeshResult<Vec<Vec<u8>>> {
        Ok(self.encode(message)?.iter().map(Frame::to_bytes).collect())
    }

    /// Parse raw link bytes and feed them to a connection's reassembly buffer
    pub fn decode(
        &self,
        bytes: &[u8],
        buffer: &mut ReassemblyBuffer,
        now: Instant,
    ) -> MeshResult<Option<Message>> {
        buffer.accept(Frame::from_bytes(bytes)?, now)
    }
}

struct PartialMessage {
    fragment_count: u16,
    ttl: u8,
    payload_type: PayloadType,
    created_at_ms: i64,
    origin_id: PeerId,
    fragments: Vec<Option<Vec<u8>>>,
    received: usize,
    started_at: Instant,
}

impl PartialMessage {
    fn from_frame(frame: &Frame, now: Instant) -> Self {
        Self {
            fragment_count: frame.fragment_count,
            ttl: frame.ttl,
            payload_type: frame.payload_type,
            created_at_ms: frame.created_at_ms,
            origin_id: frame.origin_id.clone(),
            fragments: vec![None; frame.fragment_count as usize],
            received: 0,
            started_at: now,
        }
    }

    fn matches(&self, frame: &Frame) -> bool {
        self.fragment_count == frame.fragment_count
            && self.ttl == frame.ttl
            && self.payload_type == frame.payload_type
            && self.created_at_ms == frame.created_at_ms
            && self.origin_id == frame.origin_id
    }
}

/// Per-connection collection of incomplete messages
pub struct ReassemblyBuffer {
    pending: HashMap<MessageId, PartialMessage>,
    max_pending: usize,
    timeout: Duration,
}

impl ReassemblyBuffer {
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending: max_pending.max(1),
            timeout,
        }
    }

    /// Number of incomplete messages held
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Add a frame, returning the message once every fragment has arrived.
    ///
    /// A frame that contradicts the partial it belongs to discards that
    /// partial only. Repeated fragments are ignored.
    pub fn accept(&mut self, frame: Frame, now: Instant) -> MeshResult<Option<Message>> {
        if frame.fragment_count == 0 || frame.fragment_index >= frame.fragment_count {
            self.pending.remove(&frame.message_id);
            return Err(MeshError::MalformedFrame(format!(
                "fragment {} of {}",
                frame.fragment_index, frame.fragment_count
            )));
        }

        if frame.fragment_count == 1 && !self.pending.contains_key(&frame.message_id) {
            return build_message(
                frame.message_id,
                &frame.origin_id,
                frame.ttl,
                frame.payload_type,
                frame.created_at_ms,
                frame.fragment,
            )
            .map(Some);
        }

        if let Some(partial) = self.pending.get(&frame.message_id) {
            if !partial.matches(&frame) {
                self.pending.remove(&frame.message_id);
                return Err(MeshError::MalformedFrame(format!(
                    "frame metadata for {} does not match earlier fragments",
                    frame.message_id
                )));
            }
        } else {
            if self.pending.len() >= self.max_pending {
                self.evict_oldest();
            }
            self.pending
                .insert(frame.message_id, PartialMessage::from_frame(&frame, now));
        }

        let complete = match self.pending.get_mut(&frame.message_id) {
            Some(partial) => {
                let slot = &mut partial.fragments[frame.fragment_index as usize];
                if slot.is_none() {
                    *slot = Some(frame.fragment);
                    partial.received += 1;
                }
                partial.received == partial.fragments.len()
            }
            None => false,
        };

        if !complete {
            return Ok(None);
        }

        let partial = match self.pending.remove(&frame.message_id) {
            Some(partial) => partial,
            None => return Ok(None),
        };
        let payload: Vec<u8> = partial.fragments.into_iter().flatten().flatten().collect();
        build_message(
            frame.message_id,
            &partial.origin_id,
            partial.ttl,
            partial.payload_type,
            partial.created_at_ms,
            payload,
        )
        .map(Some)
    }

    /// Drop partials older than the reassembly timeout
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, partial| now.saturating_duration_since(partial.started_at) < timeout);
        let purged = before - self.pending.len();
        if purged > 0 {
            debug!("Purged {} expired partial messages", purged);
        }
        purged
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, partial)| partial.started_at)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            warn!(message_id = %id, "Reassembly buffer full, evicting oldest partial message");
            self.pending.remove(&id);
        }
    }
}

fn build_message(
    id: MessageId,
    origin_id: &str,
    ttl: u8,
    payload_type: PayloadType,
    created_at_ms: i64,
    payload: Vec<u8>,
) -> MeshResult<Message> {
    let created_at = Utc
        .timestamp_millis_opt(created_at_ms)
        .single()
        .ok_or_else(|| MeshError::MalformedFrame(format!("bad timestamp {}", created_at_ms)))?;

    Ok(Message {
        id,
        origin_id: origin_id.to_string(),
        ttl,
        payload_type,
        payload,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> ReassemblyBuffer {
        ReassemblyBuffer::new(16, Duration::from_secs(60))
    }

    fn message_of(len: usize) -> Message {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Message::new("node-a".to_string(), 3, PayloadType::FileChunk, payload)
    }

    #[test]
    fn test_frame_header_layout() {
        let message = Message::text("abc".to_string(), 4, "hi");
        let frames = MessageCodec::new(64).encode(&message).unwrap();
        let bytes = frames[0].to_bytes();

        assert_eq!(bytes.len(), FIXED_HEADER_LEN + 3 + 2);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(&bytes[1..17], message.id.as_bytes());
        assert_eq!(bytes[21], 4);
        assert_eq!(bytes[31], 3);
        assert_eq!(&bytes[32..35], b"abc");
        assert_eq!(&bytes[35..], b"hi");
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frames[0]);
    }

    #[test]
    fn test_fragment_count_is_ceiling() {
        let codec = MessageCodec::new(64);
        let message = message_of(100);
        let chunk = codec.chunk_size(&message).unwrap();
        assert_eq!(chunk, 64 - FIXED_HEADER_LEN - "node-a".len());

        let frames = codec.encode(&message).unwrap();
        assert_eq!(frames.len(), 100usize.div_ceil(chunk));
        assert!(frames.iter().all(|f| f.to_bytes().len() <= 64));
    }

    #[test]
    fn test_empty_payload_encodes_to_one_frame() {
        let codec = MessageCodec::new(64);
        let message = message_of(0);
        let frames = codec.encode(&message).unwrap();
        assert_eq!(frames.len(), 1);

        let decoded = buffer()
            .accept(frames[0].clone(), Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_reassembles_out_of_order() {
        let codec = MessageCodec::new(48);
        let message = message_of(200);
        let mut frames = codec.encode(&message).unwrap();
        frames.reverse();

        let mut buffer = buffer();
        let now = Instant::now();
        let last = frames.pop().unwrap();
        for frame in frames {
            assert!(buffer.accept(frame, now).unwrap().is_none());
        }
        assert_eq!(buffer.accept(last, now).unwrap(), Some(message));
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_fragments_are_ignored() {
        let codec = MessageCodec::new(48);
        let message = message_of(40);
        let frames = codec.encode(&message).unwrap();
        assert!(frames.len() > 1);

        let mut buffer = buffer();
        let now = Instant::now();
        assert!(buffer.accept(frames[0].clone(), now).unwrap().is_none());
        assert!(buffer.accept(frames[0].clone(), now).unwrap().is_none());
        let mut result = None;
        for frame in frames.into_iter().skip(1) {
            result = buffer.accept(frame, now).unwrap();
        }
        assert_eq!(result, Some(message));
    }

    #[test]
    fn test_inconsistent_metadata_discards_only_that_partial() {
        let codec = MessageCodec::new(48);
        let first = message_of(60);
        let second = message_of(60);
        let first_frames = codec.encode(&first).unwrap();
        let second_frames = codec.encode(&second).unwrap();

        let mut buffer = buffer();
        let now = Instant::now();
        buffer.accept(first_frames[0].clone(), now).unwrap();
        buffer.accept(second_frames[0].clone(), now).unwrap();

        let mut bad = first_frames[1].clone();
        bad.ttl = 9;
        assert!(matches!(
            buffer.accept(bad, now),
            Err(MeshError::MalformedFrame(_))
        ));
        assert_eq!(buffer.pending_count(), 1);

        let mut result = None;
        for frame in second_frames.into_iter().skip(1) {
            result = buffer.accept(frame, now).unwrap();
        }
        assert_eq!(result, Some(second));
    }

    #[test]
    fn test_oldest_partial_evicted_at_capacity() {
        let codec = MessageCodec::new(48);
        let mut buffer = ReassemblyBuffer::new(2, Duration::from_secs(60));
        let start = Instant::now();

        let messages: Vec<Message> = (0..3).map(|_| message_of(60)).collect();
        for (i, message) in messages.iter().enumerate() {
            let frame = codec.encode(message).unwrap().remove(0);
            buffer
                .accept(frame, start + Duration::from_millis(i as u64))
                .unwrap();
        }
        assert_eq!(buffer.pending_count(), 2);

        // The first message lost its partial, so its tail alone completes nothing
        let tail: Vec<Frame> = codec.encode(&messages[0]).unwrap().into_iter().skip(1).collect();
        for frame in tail {
            assert!(buffer.accept(frame, start).unwrap().is_none());
        }
    }

    #[test]
    fn test_purge_expired_partials() {
        let codec = MessageCodec::new(48);
        let mut buffer = buffer();
        let start = Instant::now();
        let frame = codec.encode(&message_of(60)).unwrap().remove(0);
        buffer.accept(frame, start).unwrap();

        assert_eq!(buffer.purge_expired(start + Duration::from_secs(30)), 0);
        assert_eq!(buffer.purge_expired(start + Duration::from_secs(61)), 1);
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(matches!(
            Frame::from_bytes(&[]),
            Err(MeshError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::from_bytes(&[7; 40]),
            Err(MeshError::UnsupportedVersion(7))
        ));
        assert!(matches!(
            Frame::from_bytes(&[PROTOCOL_VERSION, 1, 2]),
            Err(MeshError::MalformedFrame(_))
        ));

        let mut bytes = MessageCodec::new(64)
            .encode_bytes(&message_of(4))
            .unwrap()
            .remove(0);
        bytes[22] = 42;
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(MeshError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_bad_fragment_index_discards_partial_on_decode() {
        let codec = MessageCodec::new(48);
        let message = message_of(30);
        let frames = codec.encode(&message).unwrap();
        assert_eq!(frames.len(), 3);

        let mut buffer = buffer();
        let now = Instant::now();
        assert!(codec
            .decode(&frames[0].to_bytes(), &mut buffer, now)
            .unwrap()
            .is_none());
        assert_eq!(buffer.pending_count(), 1);

        let bad = Frame {
            fragment_index: 200,
            ..frames[1].clone()
        };
        assert!(matches!(
            codec.decode(&bad.to_bytes(), &mut buffer, now),
            Err(MeshError::MalformedFrame(_))
        ));
        assert_eq!(buffer.pending_count(), 0);

        // The rest of the fragments no longer complete the dropped partial
        for frame in &frames[1..] {
            assert!(codec
                .decode(&frame.to_bytes(), &mut buffer, now)
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_link_too_small_for_header() {
        let codec = MessageCodec::new(FIXED_HEADER_LEN);
        assert!(matches!(
            codec.encode(&message_of(1)),
            Err(MeshError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_decode_from_raw_bytes() {
        let codec = MessageCodec::new(40);
        let message = message_of(30);
        let mut buffer = buffer();
        let now = Instant::now();

        let mut result = None;
        for bytes in codec.encode_bytes(&message).unwrap() {
            result = codec.decode(&bytes, &mut buffer, now).unwrap();
        }
        assert_eq!(result, Some(message));
    }
}
