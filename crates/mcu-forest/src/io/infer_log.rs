//! Inference log: a running record of `(predicted, actual)` label pairs.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     Magic ("INFL")
//! 4       4     prediction_count (u32)
//! 8       2n    (predicted_label:u8, actual_label:u8) pairs
//! ```
//!
//! When the file outgrows its byte budget the oldest pairs are dropped and
//! only the most recent half of the allowed pairs is kept, leaving room to grow.

use tracing::{debug, warn};

use super::format::{ByteReader, FormatError, INFER_LOG_MAGIC};
use super::storage::SharedStorage;

/// Header size in bytes.
pub const INFER_LOG_HEADER_SIZE: usize = 8;

/// Default byte budget for the log file.
pub const DEFAULT_MAX_INFER_LOG_BYTES: usize = 2048;

/// Append-only prediction log on the persistent store.
#[derive(Clone)]
pub struct InferenceLog {
    storage: SharedStorage,
    path: String,
    max_bytes: usize,
}

impl std::fmt::Debug for InferenceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceLog")
            .field("path", &self.path)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl InferenceLog {
    pub fn new(storage: SharedStorage, path: impl Into<String>) -> Self {
        Self {
            storage,
            path: path.into(),
            max_bytes: DEFAULT_MAX_INFER_LOG_BYTES,
        }
    }

    /// Override the byte budget (header included).
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes.max(INFER_LOG_HEADER_SIZE + 2);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of predictions recorded in the header, 0 if the log is absent.
    pub fn count(&self) -> Result<u32, FormatError> {
        if !self.storage.exists(&self.path) {
            return Ok(0);
        }
        let header = self
            .storage
            .read_range(&self.path, 0, INFER_LOG_HEADER_SIZE)?;
        let mut r = ByteReader::new(&header);
        r.expect_magic(INFER_LOG_MAGIC)?;
        r.u32()
    }

    /// All recorded pairs, oldest first.
    pub fn read_pairs(&self) -> Result<Vec<(u8, u8)>, FormatError> {
        if !self.storage.exists(&self.path) {
            return Ok(Vec::new());
        }
        let bytes = self.storage.read(&self.path)?;
        let mut r = ByteReader::new(&bytes);
        r.expect_magic(INFER_LOG_MAGIC)?;
        let _count = r.u32()?;
        let body = r.take(r.remaining() & !1)?;
        Ok(body.chunks_exact(2).map(|p| (p[0], p[1])).collect())
    }

    /// Append pairs and bump the header count. Returns the new count.
    pub fn append(&self, pairs: &[(u8, u8)]) -> Result<u32, FormatError> {
        if pairs.is_empty() {
            return self.count();
        }

        let current = if self.storage.exists(&self.path) {
            match self.count() {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %self.path, error = %e, "inference log header unreadable, starting over");
                    self.storage.remove(&self.path)?;
                    0
                }
            }
        } else {
            0
        };

        if current == 0 && !self.storage.exists(&self.path) {
            let mut header = Vec::with_capacity(INFER_LOG_HEADER_SIZE);
            header.extend_from_slice(INFER_LOG_MAGIC);
            header.extend_from_slice(&0u32.to_le_bytes());
            self.storage.write(&self.path, &header)?;
        }

        let body: Vec<u8> = pairs.iter().flat_map(|&(p, a)| [p, a]).collect();
        self.storage.append(&self.path, &body)?;

        let updated = current + pairs.len() as u32;
        let mut bytes = self.storage.read(&self.path)?;
        bytes[4..8].copy_from_slice(&updated.to_le_bytes());
        self.storage.write(&self.path, &bytes)?;
        debug!(path = %self.path, added = pairs.len(), total = updated, "inference log appended");

        self.trim()?;
        self.count()
    }

    /// Drop the oldest pairs once the file exceeds its byte budget.
    ///
    /// Returns `true` if the file was rewritten.
    pub fn trim(&self) -> Result<bool, FormatError> {
        if !self.storage.exists(&self.path) {
            return Ok(false);
        }
        let size = self.storage.size(&self.path)? as usize;
        if size <= self.max_bytes {
            return Ok(false);
        }

        let pairs = self.read_pairs()?;
        let max_pairs = (self.max_bytes - INFER_LOG_HEADER_SIZE) / 2;
        if pairs.len() <= max_pairs {
            return Ok(false);
        }

        let keep = (max_pairs / 2).max(1);
        let skip = pairs.len() - keep;
        let mut bytes = Vec::with_capacity(INFER_LOG_HEADER_SIZE + keep * 2);
        bytes.extend_from_slice(INFER_LOG_MAGIC);
        bytes.extend_from_slice(&(keep as u32).to_le_bytes());
        for &(p, a) in &pairs[skip..] {
            bytes.push(p);
            bytes.push(a);
        }
        self.storage.write(&self.path, &bytes)?;
        debug!(path = %self.path, dropped = skip, kept = keep, "inference log trimmed");
        Ok(true)
    }

    /// Fraction of logged predictions that matched the actual label.
    pub fn accuracy(&self) -> Result<Option<f32>, FormatError> {
        let pairs = self.read_pairs()?;
        if pairs.is_empty() {
            return Ok(None);
        }
        let correct = pairs.iter().filter(|(p, a)| p == a).count();
        Ok(Some(correct as f32 / pairs.len() as f32))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemStorage;

    #[test]
    fn append_creates_header_and_counts() {
        let storage = MemStorage::shared();
        let log = InferenceLog::new(storage.clone(), "/m_infer_log.bin");

        assert_eq!(log.count().unwrap(), 0);
        assert_eq!(log.append(&[(1, 1), (2, 0)]).unwrap(), 2);
        assert_eq!(log.append(&[(0, 0)]).unwrap(), 3);

        let bytes = storage.read("/m_infer_log.bin").unwrap();
        assert_eq!(&bytes[0..4], b"INFL");
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 3);
        assert_eq!(log.read_pairs().unwrap(), vec![(1, 1), (2, 0), (0, 0)]);
    }

    #[test]
    fn trim_keeps_most_recent_half() {
        let storage = MemStorage::shared();
        // 8-byte header + room for 8 pairs.
        let log = InferenceLog::new(storage, "/log").with_max_bytes(24);

        let pairs: Vec<(u8, u8)> = (0..10u8).map(|i| (i, i)).collect();
        let count = log.append(&pairs).unwrap();

        assert_eq!(count, 4);
        assert_eq!(
            log.read_pairs().unwrap(),
            vec![(6, 6), (7, 7), (8, 8), (9, 9)]
        );
    }

    #[test]
    fn accuracy_over_logged_pairs() {
        let log = InferenceLog::new(MemStorage::shared(), "/log");
        assert_eq!(log.accuracy().unwrap(), None);
        log.append(&[(1, 1), (1, 0), (2, 2), (0, 0)]).unwrap();
        approx::assert_abs_diff_eq!(log.accuracy().unwrap().unwrap(), 0.75);
    }
}
