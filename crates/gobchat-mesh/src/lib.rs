//! Offline BLE mesh messaging engine
//!
//! Devices discover each other over a radio link, hold connections to their
//! neighbours and flood messages across the mesh with TTL-bounded relays,
//! deduplication and per-neighbour retries. Large messages are fragmented to
//! fit the link's payload limit and reassembled on the receiving side.

pub mod codec;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod event_bus;
pub mod identity;
pub mod link;
pub mod node;
pub mod registry;
pub mod types;

// Re-export main types
pub use codec::{Frame, MessageCodec, ReassemblyBuffer, PROTOCOL_VERSION};
pub use config::MeshConfig;
pub use connection::ConnectionManager;
pub use delivery::{Delivery, DeliveryEngine, OutboundQueueEntry, SeenSet};
pub use error::{ErrorCategory, LinkError, MeshError, MeshResult};
pub use event_bus::{EventBus, EventKind, MeshEvent, SubscriptionHandle};
pub use identity::{DeviceIdentity, FileStore, IdentityStore, KeyValueStore, MemoryStore};
pub use link::{BleLink, LinkAdapter, MemoryLink, MemoryMedium};
pub use node::{MaintenanceReport, MeshNode};
pub use registry::PeerRegistry;
pub use types::{
    ConnectionState, DiscoveryEvent, Message, MessageId, PayloadType, PeerDevice, PeerId, Target,
};
