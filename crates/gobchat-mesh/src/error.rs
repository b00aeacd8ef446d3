//! Error types for mesh operations

use crate::types::PeerId;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors reported by the radio link underneath the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("radio powered off")]
    PoweredOff,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("link to {0} is not connected")]
    NotConnected(PeerId),

    #[error("adapter error: {0}")]
    Adapter(String),
}

/// Errors that can occur during mesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Link unavailable")]
    LinkUnavailable,

    #[error("Connection attempt already in flight for peer {0}")]
    AlreadyConnecting(PeerId),

    #[error("Peer not connected: {0}")]
    PeerNotConnected(PeerId),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("No connected peers")]
    NoConnectedPeers,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(PeerId),

    #[error("Illegal state transition for {peer}: {from} -> {to}")]
    InvalidTransition {
        peer: PeerId,
        from: crate::types::ConnectionState,
        to: crate::types::ConnectionState,
    },

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationError(err.to_string())
    }
}

impl MeshError {
    /// Coarse grouping used when logging and when deciding whether to retry
    pub fn category(&self) -> ErrorCategory {
        match self {
            MeshError::AlreadyConnecting(_)
            | MeshError::PeerNotConnected(_)
            | MeshError::PeerNotFound(_)
            | MeshError::NoConnectedPeers
            | MeshError::MessageTooLarge(_) => ErrorCategory::Usage,
            MeshError::LinkUnavailable
            | MeshError::ConnectTimeout(_)
            | MeshError::Link(_) => ErrorCategory::Transport,
            MeshError::MalformedFrame(_) | MeshError::UnsupportedVersion(_) => {
                ErrorCategory::Protocol
            }
            MeshError::InvalidTransition { .. }
            | MeshError::Persistence(_)
            | MeshError::SerializationError(_)
            | MeshError::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Transient transport failures are retried by the backoff policies;
    /// everything else is surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::ConnectTimeout(_) => true,
            MeshError::Link(LinkError::PoweredOff) => false,
            MeshError::Link(_) => true,
            _ => false,
        }
    }
}

/// Error categories for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Usage,
    Transport,
    Protocol,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Usage => write!(f, "usage"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}
