//! JSON wire protocol for host → viewer state replication.
//!
//! Wire format (one JSON object per frame):
//! ```text
//! {
//!   "id":         "<uuid v4>",
//!   "type":       "state-update" | "delta-update" | "initial-state"
//!               | "request-initial-state" | "cursor-move" | "action",
//!   "content":    <any JSON>,
//!   "lastUpdate": <epoch ms>,
//!   "compressed": true            // only present when the compressor ran
//! }
//! ```
//!
//! Receivers resolve reordering across reconnects by `lastUpdate`, never by
//! arrival order.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identity of a peer as known to the transport's signaling layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity (uuid v4).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Packet types carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacketType {
    /// Full snapshot pushed by a host broadcast
    StateUpdate,
    /// Compacted structural changes against the previous broadcast
    DeltaUpdate,
    /// Full snapshot sent to one viewer on join or on request
    InitialState,
    /// Viewer asking the host for a full snapshot
    RequestInitialState,
    /// Pointer position, high frequency
    CursorMove,
    /// Application-defined action
    Action,
}

impl PacketType {
    /// Whether packets of this type carry a complete snapshot.
    pub fn is_snapshot(self) -> bool {
        matches!(self, PacketType::StateUpdate | PacketType::InitialState)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::StateUpdate => "state-update",
            PacketType::DeltaUpdate => "delta-update",
            PacketType::InitialState => "initial-state",
            PacketType::RequestInitialState => "request-initial-state",
            PacketType::CursorMove => "cursor-move",
            PacketType::Action => "action",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One wire message. Constructed per send, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPacket {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PacketType,
    #[serde(default)]
    pub content: Value,
    #[serde(rename = "lastUpdate")]
    pub last_update: u64,
    /// Set when `content` went through the domain compressor.
    #[serde(default, skip_serializing_if = "is_false")]
    pub compressed: bool,
}

impl SyncPacket {
    /// Create a packet stamped with the current wall-clock time.
    pub fn new(kind: PacketType, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content,
            last_update: now_millis(),
            compressed: false,
        }
    }

    pub fn state_update(state: Value) -> Self {
        Self::new(PacketType::StateUpdate, state)
    }

    pub fn initial_state(state: Value) -> Self {
        Self::new(PacketType::InitialState, state)
    }

    pub fn request_initial_state() -> Self {
        Self::new(PacketType::RequestInitialState, Value::Null)
    }

    /// Mark the content as compressor output.
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
