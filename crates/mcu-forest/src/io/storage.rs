//! Persistent-storage collaborator.
//!
//! Everything that touches flash (sample stores, tree files, the node
//! predictor, the inference log) goes through the [`Storage`] trait. Two
//! implementations are provided:
//!
//! - [`FsStorage`]: files under a root directory (`std::fs`)
//! - [`MemStorage`]: an in-memory file map, for tests and hosts without a filesystem
//!
//! Handles are shared as [`SharedStorage`] (`Arc<dyn Storage>`), so the
//! trainer can hand the same store to every component it owns.
//!
//! # Example
//!
//! ```ignore
//! use mcu_forest::io::{MemStorage, Storage};
//!
//! let storage = MemStorage::new();
//! storage.write("/model_tree_0.bin", &[1, 2, 3])?;
//! assert_eq!(storage.size("/model_tree_0.bin")?, 3);
//! ```

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by a [`Storage`] backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The named file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// A range read went past the end of the file.
    #[error("short read on {path}: wanted {len} bytes at offset {offset}, file has {size}")]
    ShortRead {
        path: String,
        offset: u64,
        len: usize,
        size: u64,
    },

    /// Underlying I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(path: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_string())
        } else {
            Self::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

// ============================================================================
// Storage trait
// ============================================================================

/// Byte-level file operations on the persistent store.
///
/// Paths are flat names such as `/model_tree_3.bin`. All operations are
/// synchronous and their failure is observable immediately.
pub trait Storage: Send + Sync {
    /// Read a whole file.
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Read `len` bytes starting at `offset`.
    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, StorageError>;

    /// Create or truncate a file with the given contents.
    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Append to a file, creating it if needed.
    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Rename a file, replacing the destination.
    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Remove a file. Removing a missing file is not an error.
    fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Whether a file exists.
    fn exists(&self, path: &str) -> bool;

    /// Size of a file in bytes.
    fn size(&self, path: &str) -> Result<u64, StorageError>;

    /// Write through a temporary file and rename it into place.
    fn write_atomic(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let tmp = format!("{path}.tmp");
        self.write(&tmp, data)?;
        self.rename(&tmp, path)
    }
}

/// Shared handle to a storage backend.
pub type SharedStorage = Arc<dyn Storage>;

// ============================================================================
// FsStorage
// ============================================================================

/// Storage rooted at a host directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create a storage rooted at `root`. The directory is created if missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| StorageError::io(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Storage for FsStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        fs::read(self.resolve(path)).map_err(|e| StorageError::io(path, e))
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut file = fs::File::open(self.resolve(path)).map_err(|e| StorageError::io(path, e))?;
        let size = file
            .metadata()
            .map_err(|e| StorageError::io(path, e))?
            .len();
        if offset + len as u64 > size {
            return Err(StorageError::ShortRead {
                path: path.to_string(),
                offset,
                len,
                size,
            });
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(path, e))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| StorageError::io(path, e))?;
        Ok(buf)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        fs::write(self.resolve(path), data).map_err(|e| StorageError::io(path, e))
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(path))
            .map_err(|e| StorageError::io(path, e))?;
        file.write_all(data).map_err(|e| StorageError::io(path, e))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        fs::rename(self.resolve(from), self.resolve(to)).map_err(|e| StorageError::io(from, e))
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        fs::metadata(self.resolve(path))
            .map(|m| m.len())
            .map_err(|e| StorageError::io(path, e))
    }
}

// ============================================================================
// MemStorage
// ============================================================================

/// In-memory storage. Cloning shares the same file map.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: wrap into a [`SharedStorage`].
    pub fn shared() -> SharedStorage {
        Arc::new(Self::new())
    }

    /// Names of all files currently held, sorted.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.with_files(|files| files.keys().cloned().collect());
        names.sort();
        names
    }

    /// Total bytes held across all files.
    pub fn total_bytes(&self) -> usize {
        self.with_files(|files| files.values().map(Vec::len).sum())
    }

    fn with_files<R>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> R) -> R {
        // A poisoned map is still structurally valid; keep using it.
        let mut guard = match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Storage for MemStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.with_files(|files| {
            files
                .get(path)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        })
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        self.with_files(|files| {
            let data = files
                .get(path)
                .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
            let start = offset as usize;
            let end = start + len;
            if end > data.len() {
                return Err(StorageError::ShortRead {
                    path: path.to_string(),
                    offset,
                    len,
                    size: data.len() as u64,
                });
            }
            Ok(data[start..end].to_vec())
        })
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.with_files(|files| {
            files.insert(path.to_string(), data.to_vec());
        });
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.with_files(|files| {
            files
                .entry(path.to_string())
                .or_default()
                .extend_from_slice(data);
        });
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.with_files(|files| {
            let data = files
                .remove(from)
                .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
            files.insert(to.to_string(), data);
            Ok(())
        })
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.with_files(|files| {
            files.remove(path);
        });
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.with_files(|files| files.contains_key(path))
    }

    fn size(&self, path: &str) -> Result<u64, StorageError> {
        self.with_files(|files| {
            files
                .get(path)
                .map(|d| d.len() as u64)
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &dyn Storage) {
        storage.write("/a.bin", &[1, 2, 3, 4]).unwrap();
        assert!(storage.exists("/a.bin"));
        assert_eq!(storage.size("/a.bin").unwrap(), 4);
        assert_eq!(storage.read_range("/a.bin", 1, 2).unwrap(), vec![2, 3]);

        storage.append("/a.bin", &[5]).unwrap();
        assert_eq!(storage.read("/a.bin").unwrap(), vec![1, 2, 3, 4, 5]);

        storage.rename("/a.bin", "/b.bin").unwrap();
        assert!(!storage.exists("/a.bin"));
        assert_eq!(storage.read("/b.bin").unwrap().len(), 5);

        storage.write_atomic("/b.bin", &[9]).unwrap();
        assert_eq!(storage.read("/b.bin").unwrap(), vec![9]);
        assert!(!storage.exists("/b.bin.tmp"));

        storage.remove("/b.bin").unwrap();
        storage.remove("/b.bin").unwrap();
        assert!(!storage.exists("/b.bin"));
    }

    #[test]
    fn mem_storage_operations() {
        exercise(&MemStorage::new());
    }

    #[test]
    fn fs_storage_operations() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsStorage::new(dir.path()).unwrap());
    }

    #[test]
    fn missing_file_is_not_found() {
        let storage = MemStorage::new();
        assert!(matches!(storage.read("/nope"), Err(StorageError::NotFound(_))));

        let dir = tempfile::tempdir().unwrap();
        let fs_storage = FsStorage::new(dir.path()).unwrap();
        assert!(matches!(fs_storage.read("/nope"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn short_range_read_is_reported() {
        let storage = MemStorage::new();
        storage.write("/x", &[0; 4]).unwrap();
        let err = storage.read_range("/x", 2, 8).unwrap_err();
        assert!(matches!(err, StorageError::ShortRead { size: 4, .. }));
    }
}
