//! File-backed storage: one LZ4-compressed JSON file per key.
//!
//! Keys are escaped into file names (`[A-Za-z0-9_-]` kept, everything else
//! as `%XX`), so distinct keys never share a file. Writes go to a temporary
//! file first and are renamed into place.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::{StorageAdapter, StorageError};

const EXTENSION: &str = "json.lz4";

#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        log::debug!("File storage opened at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", escape_key(key)))
    }
}

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

impl StorageAdapter for FileStorage {
    fn save(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let json = serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let target = self.file_for(key);
        let tmp = target.with_extension("tmp");
        fs::write(&tmp, &compressed)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let compressed = match fs::read(self.file_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|e| StorageError::Deserialization(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.file_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
