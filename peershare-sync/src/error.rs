//! Error types for the sync kit.
//!
//! Per-connection faults never surface here during a broadcast: they are
//! recovered by evicting the link (see [`crate::connection`]). What remains
//! are the faults the embedding application has to act on.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::storage::StorageError;
use crate::transport::TransportError;
use crate::PeerId;

/// Top-level error returned by the connection manager and session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The transport has no signaling backend to register with.
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("Connection to {peer} timed out after {timeout_ms}ms")]
    ConnectionTimeout { peer: PeerId, timeout_ms: u64 },

    /// A point-to-point send failed; the link has already been evicted.
    #[error("Send to {peer} failed: {reason}")]
    SendFailure { peer: PeerId, reason: String },

    #[error("Viewer cap of {cap} reached")]
    CapacityExceeded { cap: usize },

    #[error("No active share session")]
    NotActive,

    #[error("A share session is already active")]
    AlreadyActive,

    #[error("Operation requires the {expected} role")]
    WrongRole { expected: &'static str },

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Map a transport failure from `open`, promoting a missing signaling
    /// backend to [`SyncError::SignalingUnavailable`].
    pub(crate) fn from_open(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(reason) => SyncError::SignalingUnavailable(reason),
            other => SyncError::Transport(other),
        }
    }
}
