//! Radio link abstraction consumed by the connection manager

pub mod ble;
pub mod memory;

use crate::error::LinkError;
use crate::types::{DiscoveryEvent, PeerId};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use ble::BleLink;
pub use memory::{MemoryLink, MemoryMedium};

/// Opaque handle to one open link connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub peer_id: PeerId,
    pub session: u64,
}

/// Traffic and lifecycle notifications for an open connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw frame bytes received from the remote end
    Frame(Vec<u8>),
    /// The remote end closed the connection deliberately
    Closed,
    /// The transport dropped the connection
    Lost { reason: String },
}

/// An open connection together with its receive side
#[derive(Debug)]
pub struct LinkConnection {
    pub handle: ConnectionHandle,
    /// Name the remote end advertises
    pub peer_name: String,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Running scan; cancel to stop delivering discovery events
#[derive(Debug, Clone)]
pub struct ScanHandle {
    token: CancellationToken,
}

impl ScanHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Trait for platform-agnostic link operations
#[async_trait]
pub trait LinkAdapter: Send + Sync {
    /// Whether the radio is powered and usable
    async fn is_available(&self) -> bool;

    /// Start discovering nearby devices, reporting each sighting on `discovered`
    async fn scan(
        &self,
        discovered: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<ScanHandle, LinkError>;

    /// Open a connection to a discovered device
    async fn connect(&self, peer_id: &PeerId) -> Result<LinkConnection, LinkError>;

    /// Write one frame; the frame must fit in `max_payload_size`
    async fn send(&self, handle: &ConnectionHandle, bytes: &[u8]) -> Result<(), LinkError>;

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), LinkError>;

    /// Largest frame the link can carry in one write
    fn max_payload_size(&self) -> usize;

    /// Connections opened by remote devices. Yields `Some` at most once;
    /// links without a peripheral role return `None`.
    async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<LinkConnection>>;
}
