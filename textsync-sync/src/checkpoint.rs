//! Shadow-state checkpoints, so a reopened document resumes where it left off.
//!
//! ```text
//!   unshare ──► checkpoint() ──► CheckpointStore::save
//!   share   ──► CheckpointStore::load ──► restore()  (deltaOk = false)
//! ```
//!
//! On disk every document gets one file, `<hex(id)>.ckpt`, holding a
//! bincode-encoded [`CheckpointFile`]: the encoded checkpoint plus an FNV-1a
//! checksum over it. Files that fail to decode or verify are logged and
//! treated as absent.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persistable shadow state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCheckpoint {
    pub id: String,
    pub shadow_text: String,
    pub client_version: u64,
    pub server_version: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint encoding failed: {0}")]
    Encode(String),
}

/// Where checkpoints live.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &DocumentCheckpoint) -> Result<(), StoreError>;

    fn load(&self, id: &str) -> Result<Option<DocumentCheckpoint>, StoreError>;

    fn remove(&self, id: &str) -> Result<(), StoreError>;
}

// ───────────────────────────────────────────────────────────────────
// In-memory store
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, DocumentCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &DocumentCheckpoint) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<DocumentCheckpoint>, StoreError> {
        Ok(self.entries.lock().get(id).cloned())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(id);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// File store
// ───────────────────────────────────────────────────────────────────

/// On-disk envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl CheckpointFile {
    pub fn seal(checkpoint: &DocumentCheckpoint) -> Result<Self, StoreError> {
        let payload = bincode::serde::encode_to_vec(checkpoint, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))?;
        Ok(Self {
            checksum: fnv1a(&payload),
            payload,
        })
    }

    /// Decode and verify; `None` if anything is off.
    pub fn open(&self) -> Option<DocumentCheckpoint> {
        if fnv1a(&self.payload) != self.checksum {
            return None;
        }
        bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .ok()
            .map(|(checkpoint, _)| checkpoint)
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// One checkpoint file per document under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open (and create if needed) a checkpoint directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let mut name = String::with_capacity(id.len() * 2 + 5);
        for byte in id.as_bytes() {
            let _ = write!(name, "{byte:02x}");
        }
        name.push_str(".ckpt");
        self.dir.join(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &DocumentCheckpoint) -> Result<(), StoreError> {
        let file = CheckpointFile::seal(checkpoint)?;
        let bytes = bincode::serde::encode_to_vec(&file, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        // Write-then-rename so a crash never leaves a torn file behind.
        let path = self.path_for(&checkpoint.id);
        let tmp = path.with_extension("ckpt.tmp");
        std::fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path, source })?;
        log::debug!("checkpointed {} at c{}/s{}", checkpoint.id, checkpoint.client_version, checkpoint.server_version);
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<DocumentCheckpoint>, StoreError> {
        let path = self.path_for(id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let file: Option<CheckpointFile> =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .ok()
                .map(|(file, _)| file);
        match file.and_then(|f| f.open()) {
            Some(checkpoint) if checkpoint.id == id => Ok(Some(checkpoint)),
            _ => {
                log::warn!("ignoring corrupt checkpoint {}", path.display());
                Ok(None)
            }
        }
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> DocumentCheckpoint {
        DocumentCheckpoint {
            id: id.to_owned(),
            shadow_text: "shadow ☃ text\nline two".to_owned(),
            client_version: 7,
            server_version: 3,
        }
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        assert!(store.load("a").unwrap().is_none());
        store.save(&sample("a")).unwrap();
        assert_eq!(store.load("a").unwrap(), Some(sample("a")));
        assert_eq!(store.len(), 1);
        store.remove("a").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(tmp.path().join("ckpt")).unwrap();
        store.save(&sample("docs/readme.md")).unwrap();

        let reopened = FileCheckpointStore::open(tmp.path().join("ckpt")).unwrap();
        assert_eq!(reopened.load("docs/readme.md").unwrap(), Some(sample("docs/readme.md")));
        assert!(reopened.load("other").unwrap().is_none());
    }

    #[test]
    fn test_file_store_overwrite_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(tmp.path()).unwrap();
        store.save(&sample("x")).unwrap();
        let mut newer = sample("x");
        newer.client_version = 8;
        store.save(&newer).unwrap();
        assert_eq!(store.load("x").unwrap().unwrap().client_version, 8);

        store.remove("x").unwrap();
        store.remove("x").unwrap();
        assert!(store.load("x").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(tmp.path()).unwrap();
        store.save(&sample("x")).unwrap();

        let path = store.path_for("x");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        assert!(store.load("x").unwrap().is_none());

        std::fs::write(&path, b"garbage").unwrap();
        assert!(store.load("x").unwrap().is_none());
    }

    #[test]
    fn test_checksum_detects_tamper() {
        let mut file = CheckpointFile::seal(&sample("x")).unwrap();
        assert_eq!(file.open(), Some(sample("x")));
        file.payload[0] ^= 1;
        assert!(file.open().is_none());
    }
}
