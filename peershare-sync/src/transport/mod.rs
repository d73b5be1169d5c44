//! Injected transport seam.
//!
//! The sync layer only relies on an open / send / close / on-data contract.
//! Backends:
//! - [`memory`] — in-process signaling hub, used by tests and the demo
//! - [`ws`] — direct WebSocket links (host listens, viewers dial)
//!
//! ```text
//!  Transport::open ──► local id registered with signaling
//!  Transport::dial ──► Link ◄── Transport::accept (remote side)
//!                       │
//!             sender ───┤─── events (Data / Closed)
//! ```

pub mod memory;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::PeerId;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use ws::WsTransport;

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame from the remote peer
    Data(String),
    /// The link is gone; no further events follow
    Closed,
}

/// Sending half of a link. Sends are non-blocking and ordered per link.
pub trait LinkSender: Send + Sync {
    fn send(&self, frame: &str) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Close the link. Idempotent.
    fn close(&self);
}

/// One live link to a remote peer.
pub struct Link {
    /// Remote peer identity
    pub peer_id: PeerId,
    pub sender: Arc<dyn LinkSender>,
    /// Inbound frames, in send order
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer_id", &self.peer_id)
            .field("open", &self.sender.is_open())
            .finish()
    }
}

/// Peer-connection backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register the local identity with signaling.
    ///
    /// Returns the id remote peers must dial. Fails with
    /// [`TransportError::Unavailable`] when there is no signaling backend.
    async fn open(&self, local_id: Option<PeerId>) -> Result<PeerId, TransportError>;

    /// Open an outbound link. Resolves once the link is open.
    async fn dial(&self, remote: &PeerId) -> Result<Link, TransportError>;

    /// Next inbound link, or `None` once the transport is shut down.
    async fn accept(&self) -> Option<Link>;

    /// Release the local registration. Established links are not touched.
    async fn shutdown(&self);
}

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Signaling backend unavailable: {0}")]
    Unavailable(String),
    #[error("Peer {0} is not reachable")]
    PeerUnavailable(PeerId),
    #[error("Peer id {0} is already registered")]
    IdInUse(PeerId),
    #[error("Transport not opened")]
    NotOpened,
    #[error("Link closed")]
    Closed,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("I/O error: {0}")]
    Io(String),
}
