//! Pluggable key-value persistence for session metadata.
//!
//! The sync core writes exactly one record per created share
//! (`session:<share id>`) and never reads it back on the hot path.
//!
//! Backends:
//! - [`MemoryStorage`] — process-local map
//! - [`FileStorage`]   — one LZ4-compressed JSON file per key

pub mod file;
pub mod memory;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::TransmissionMode;
use crate::session::Role;
use crate::PeerId;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Key-value store for JSON documents.
pub trait StorageAdapter: Send + Sync {
    fn save(&self, key: &str, value: &Value) -> Result<(), StorageError>;

    /// `Ok(None)` when nothing is stored under `key`.
    fn load(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Record written once per created share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub share_id: PeerId,
    pub role: Role,
    /// Epoch milliseconds
    pub created_at: u64,
    pub viewer_cap: usize,
    pub transmission: TransmissionMode,
    pub compression: bool,
}

impl SessionMetadata {
    pub fn storage_key(share_id: &PeerId) -> String {
        format!("session:{share_id}")
    }

    pub fn key(&self) -> String {
        Self::storage_key(&self.share_id)
    }

    pub fn save(&self, storage: &dyn StorageAdapter) -> Result<(), StorageError> {
        let value =
            serde_json::to_value(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        storage.save(&self.key(), &value)
    }

    pub fn load(storage: &dyn StorageAdapter, share_id: &PeerId) -> Result<Option<Self>, StorageError> {
        storage
            .load(&Self::storage_key(share_id))?
            .map(|value| {
                serde_json::from_value(value).map_err(|e| StorageError::Deserialization(e.to_string()))
            })
            .transpose()
    }
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
