//! # peershare-sync — Peer-to-peer state replication kit
//!
//! One host pushes its live application state (a JSON document) directly to
//! a handful of viewers and keeps them eventually consistent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  sync_data   ┌───────────────────┐   JSON packets   ┌──────────────┐
//! │ Application  │ ───────────► │ ShareSession      │ ───────────────► │ ShareSession │
//! │ (host state) │              │ (Host)            │                  │ (Viewer)     │
//! └──────────────┘              └─────────┬─────────┘                  └──────┬───────┘
//!                                         │                                   │
//!                                         ▼                                   ▼
//!                               ┌───────────────────┐                  ┌──────────────┐
//!                               │ ConnectionManager │                  │ mirror +     │
//!                               │ throttle, fan-out │                  │ SessionEvent │
//!                               │ compressor, delta │                  └──────────────┘
//!                               └─────────┬─────────┘
//!                                         │ Arc<dyn Transport>
//!                               ┌─────────┴─────────┐
//!                               │ memory │ websocket│
//!                               └───────────────────┘
//! ```
//!
//! Delivery is last-writer-wins by `lastUpdate`, best-effort, with at most
//! one broadcast per throttle window. Not a CRDT.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire packets and peer ids
//! - [`transport`] — injected transport seam with memory and WebSocket backends
//! - [`connection`] — connection lifecycle, viewer cap, throttled broadcast
//! - [`session`] — host / viewer state machine
//! - [`delta`] — structural diff / patch
//! - [`compressor`] — lossy canvas-state compressor
//! - [`performance`] — metrics and quality-tier tuning
//! - [`storage`] — session metadata persistence
//! - [`share_link`] — share URLs

pub mod compressor;
pub mod config;
pub mod connection;
pub mod delta;
pub mod error;
pub mod performance;
pub mod protocol;
pub mod session;
pub mod share_link;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use config::{SyncConfig, TransmissionMode};
pub use connection::{BroadcastOutcome, ConnectionManager, IncomingOutcome, ViewerInfo};
pub use delta::{apply_delta, compress_changes, decompress_changes, values_equal, ChangeKind, DeltaChange, DeltaEngine};
pub use error::SyncError;
pub use performance::{
    get_optimized_config, NetworkQuality, OptimizeThresholds, PerformanceMetrics, PerformanceMonitor,
    PerformanceProfile,
};
pub use protocol::{PacketType, PeerId, ProtocolError, SyncPacket};
pub use session::{Role, SessionEvent, SessionStatus, ShareSession};
pub use share_link::{host_from_url, share_url};
pub use storage::{FileStorage, MemoryStorage, SessionMetadata, StorageAdapter, StorageError};
pub use transport::{Link, LinkEvent, LinkSender, MemoryNetwork, MemoryTransport, Transport, TransportError, WsTransport};
