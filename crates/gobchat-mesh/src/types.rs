use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, stable identifier of a device on the mesh
pub type PeerId = String;

/// Globally unique message identifier (random 128 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of content carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    Text,
    VoiceRef,
    FileChunk,
}

impl PayloadType {
    pub fn code(self) -> u8 {
        match self {
            PayloadType::Text => 0,
            PayloadType::VoiceRef => 1,
            PayloadType::FileChunk => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PayloadType::Text),
            1 => Some(PayloadType::VoiceRef),
            2 => Some(PayloadType::FileChunk),
            _ => None,
        }
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadType::Text => write!(f, "Text"),
            PayloadType::VoiceRef => write!(f, "VoiceRef"),
            PayloadType::FileChunk => write!(f, "FileChunk"),
        }
    }
}

/// An application message. Immutable once created; relaying produces a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub origin_id: PeerId,
    pub ttl: u8,
    pub payload_type: PayloadType,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message originating at `origin_id`
    pub fn new(origin_id: PeerId, ttl: u8, payload_type: PayloadType, payload: Vec<u8>) -> Self {
        // Frames carry millisecond timestamps, so truncate here to keep
        // reassembled messages identical to the original.
        let now = Utc::now();
        let created_at = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now);

        Self {
            id: MessageId::new(),
            origin_id,
            ttl,
            payload_type,
            payload,
            created_at,
        }
    }

    pub fn text(origin_id: PeerId, ttl: u8, text: &str) -> Self {
        Self::new(origin_id, ttl, PayloadType::Text, text.as_bytes().to_vec())
    }

    /// Copy for the next hop, or `None` once the hop budget is spent
    pub fn relay_copy(&self) -> Option<Message> {
        if self.ttl == 0 {
            return None;
        }
        let mut copy = self.clone();
        copy.ttl -= 1;
        Some(copy)
    }

    /// Payload as UTF-8 text for `Text` messages
    pub fn as_text(&self) -> Option<&str> {
        match self.payload_type {
            PayloadType::Text => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }
}

/// Connection state of a peer, owned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Connected, Failed)
                | (Disconnecting, Disconnected)
                | (Disconnected, Discovered)
                | (Failed, Discovered)
                | (Discovered, Disconnected)
                | (Failed, Disconnected)
        )
    }

    /// States in which a live connection object may exist
    pub fn has_live_connection(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Discovered => write!(f, "Discovered"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

/// A peer known to this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDevice {
    pub id: PeerId,
    pub display_name: String,
    /// RSSI in dBm
    pub signal_strength: i16,
    pub connection_state: ConnectionState,
    pub last_seen: DateTime<Utc>,
}

/// Raised by the link whenever a device is (re)discovered during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub peer_id: PeerId,
    pub display_name: String,
    pub signal_strength: i16,
}

/// Destination of an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Broadcast,
    Peer(PeerId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_copy_decrements_ttl() {
        let message = Message::text("origin".to_string(), 2, "hello");
        let relayed = message.relay_copy().unwrap();
        assert_eq!(relayed.ttl, 1);
        assert_eq!(relayed.id, message.id);
        assert_eq!(relayed.payload, message.payload);

        let last = relayed.relay_copy().unwrap();
        assert_eq!(last.ttl, 0);
        assert!(last.relay_copy().is_none());
    }

    #[test]
    fn test_payload_type_codes() {
        for kind in [PayloadType::Text, PayloadType::VoiceRef, PayloadType::FileChunk] {
            assert_eq!(PayloadType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(PayloadType::from_code(9), None);
    }

    #[test]
    fn test_connecting_is_required_before_connected() {
        use ConnectionState::*;
        assert!(!Discovered.can_transition_to(Connected));
        assert!(Discovered.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Connected));
    }

    #[test]
    fn test_as_text() {
        let message = Message::text("a".to_string(), 1, "hi there");
        assert_eq!(message.as_text(), Some("hi there"));

        let voice = Message::new("a".to_string(), 1, PayloadType::VoiceRef, vec![1, 2]);
        assert_eq!(voice.as_text(), None);
    }
}
