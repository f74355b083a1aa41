//! Durable key-value blob storage for cache persistence.
//!
//! The cache treats the platform storage engine as an opaque blob store:
//! each [`CacheStore`](crate::CacheStore) writes its whole map under one key.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, trace};

use crate::CacheError;
use crate::lock::{rw_read, rw_write};

/// Persistent key-value storage used by cache stores.
///
/// Calls are synchronous: cache mutations never suspend, so persistence
/// happens inside the mutation.
pub trait BlobStore: Send + Sync {
    /// Read a blob, `None` if it was never written.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Replace the blob under `key`.
    fn set(&self, key: &str, blob: &[u8]) -> Result<(), CacheError>;

    /// Delete the blob under `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// In-process blob store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        rw_read(&self.blobs, "memory_blob_len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(rw_read(&self.blobs, "memory_blob_get").get(key).cloned())
    }

    fn set(&self, key: &str, blob: &[u8]) -> Result<(), CacheError> {
        rw_write(&self.blobs, "memory_blob_set").insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        rw_write(&self.blobs, "memory_blob_remove").remove(key);
        Ok(())
    }
}

/// Directory-backed blob store, one file per key.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous blob intact.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    /// Open (and create if needed) a blob directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        if dir.exists() && !dir.is_dir() {
            return Err(CacheError::Persist(format!(
                "{} exists and is not a directory",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        debug!(dir = %dir.display(), "opened file blob store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys currently present on disk.
    pub fn keys(&self) -> Result<Vec<String>, CacheError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CacheError::Io {
            key: self.dir.display().to_string(),
            source,
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::Io {
                key: self.dir.display().to_string(),
                source,
            })?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".blob")) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.blob", sanitize_key(key)))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, blob: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("blob.tmp");
        let io_err = |source| CacheError::Io {
            key: key.to_string(),
            source,
        };

        fs::write(&tmp, blob).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        trace!(key, bytes = blob.len(), "blob written");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Map a key onto a safe file name.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
