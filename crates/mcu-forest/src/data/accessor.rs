//! Storage-backed chunk accessor for partial loading.
//!
//! When the training split does not fit in memory, the tree builder reads
//! it through a [`ChunkAccessor`] instead of a resident
//! [`SampleStore`](super::SampleStore). The accessor reads whole chunks of
//! records from the store file and keeps the most recently used ones in a
//! small cache.
//!
//! # Example
//!
//! ```ignore
//! let mut accessor = ChunkAccessor::init(storage, "/m_train.bin", n, 16, 2, 512)?;
//! let values = accessor.batch_extract_feature(&indices, 0, indices.len(), 3);
//! println!("{:?}", accessor.stats());
//! ```

use tracing::{debug, warn};

use super::error::DataError;
use super::packing::PackedArray;
use super::source::SampleSource;
use super::store::{decode_record, record_size, StoreHeader, STORE_HEADER_SIZE};
use super::ERROR_LABEL;
use crate::io::SharedStorage;

/// Default number of chunks kept in the cache.
pub const DEFAULT_CACHED_CHUNKS: usize = 2;

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessorStats {
    /// Reads served from a cached chunk.
    pub hits: u64,
    /// Reads that required loading a chunk.
    pub misses: u64,
    /// Chunks read from storage.
    pub chunk_loads: u64,
    /// Bytes read from storage.
    pub bytes_read: u64,
    /// Chunk reads that failed (values defaulted).
    pub read_errors: u64,
}

impl AccessorStats {
    /// Fraction of reads served from cache.
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}

#[derive(Debug)]
struct CachedChunk {
    id: usize,
    first: usize,
    labels: Vec<u8>,
    features: PackedArray,
}

/// Read-only random access to a sample-store file by sample index.
pub struct ChunkAccessor {
    storage: SharedStorage,
    path: String,
    num_samples: usize,
    num_features: usize,
    bits: u8,
    samples_per_chunk: usize,
    record_size: usize,
    max_cached: usize,
    // Most recently used last.
    cache: Vec<CachedChunk>,
    stats: AccessorStats,
}

impl std::fmt::Debug for ChunkAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkAccessor")
            .field("path", &self.path)
            .field("num_samples", &self.num_samples)
            .field("samples_per_chunk", &self.samples_per_chunk)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ChunkAccessor {
    /// Open `path` for chunked reads.
    ///
    /// Fails if the file is missing, its header is unreadable, or its shape
    /// disagrees with the arguments.
    pub fn init(
        storage: SharedStorage,
        path: impl Into<String>,
        sample_count: usize,
        feature_count: usize,
        bits_per_feature: u8,
        samples_per_chunk: usize,
    ) -> Result<Self, DataError> {
        let path = path.into();
        if !(1..=8).contains(&bits_per_feature) {
            return Err(DataError::InvalidQuantBits(bits_per_feature));
        }
        let header_bytes = storage
            .read_range(&path, 0, STORE_HEADER_SIZE)
            .map_err(|source| DataError::AccessorOpen {
                path: path.clone(),
                source,
            })?;
        let header = StoreHeader::from_bytes(&header_bytes)?;
        if header.num_features as usize != feature_count {
            return Err(DataError::FeatureCountMismatch {
                expected: feature_count,
                actual: header.num_features as usize,
            });
        }
        if header.quant_bits != bits_per_feature {
            warn!(
                %path,
                expected = bits_per_feature,
                actual = header.quant_bits,
                "accessor width mismatch"
            );
            return Err(DataError::QuantBitsMismatch {
                expected: bits_per_feature,
                actual: header.quant_bits,
            });
        }
        let num_samples = sample_count.min(header.num_samples as usize);
        debug!(%path, num_samples, samples_per_chunk, "chunk accessor opened");

        Ok(Self {
            storage,
            path,
            num_samples,
            num_features: feature_count,
            bits: bits_per_feature,
            samples_per_chunk: samples_per_chunk.max(1),
            record_size: record_size(feature_count, bits_per_feature),
            max_cached: DEFAULT_CACHED_CHUNKS,
            cache: Vec::with_capacity(DEFAULT_CACHED_CHUNKS),
            stats: AccessorStats::default(),
        })
    }

    /// Keep up to `n` chunks cached (at least 1).
    pub fn with_cache_chunks(mut self, n: usize) -> Self {
        self.max_cached = n.max(1);
        self
    }

    /// Counters since the last [`flush`](Self::flush).
    pub fn stats(&self) -> AccessorStats {
        self.stats
    }

    /// Drop cached chunks and reset counters.
    pub fn flush(&mut self) {
        self.cache.clear();
        self.stats = AccessorStats::default();
    }

    /// Bytes held by cached chunks.
    pub fn memory_usage(&self) -> usize {
        self.cache
            .iter()
            .map(|c| c.labels.capacity() + c.features.memory_usage())
            .sum()
    }

    /// Values of `feature` for `indices[begin..end]`.
    pub fn batch_extract_feature(
        &mut self,
        indices: &[u32],
        begin: usize,
        end: usize,
        feature: usize,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        let range = clamp_range(indices, begin, end);
        self.extract_feature(&indices[range], feature, &mut out);
        out
    }

    /// Labels for `indices[begin..end]`.
    pub fn batch_extract_labels(&mut self, indices: &[u32], begin: usize, end: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let range = clamp_range(indices, begin, end);
        self.extract_labels(&indices[range], &mut out);
        out
    }

    /// Position in `cache` of the chunk holding `index`, loading it if needed.
    fn chunk_slot(&mut self, index: usize) -> Option<usize> {
        if index >= self.num_samples {
            return None;
        }
        let id = index / self.samples_per_chunk;
        if let Some(pos) = self.cache.iter().position(|c| c.id == id) {
            self.stats.hits += 1;
            if pos + 1 != self.cache.len() {
                let chunk = self.cache.remove(pos);
                self.cache.push(chunk);
            }
            return Some(self.cache.len() - 1);
        }

        self.stats.misses += 1;
        let chunk = self.read_chunk(id)?;
        if self.cache.len() >= self.max_cached {
            self.cache.remove(0);
        }
        self.cache.push(chunk);
        Some(self.cache.len() - 1)
    }

    fn read_chunk(&mut self, id: usize) -> Option<CachedChunk> {
        let first = id * self.samples_per_chunk;
        let count = self.samples_per_chunk.min(self.num_samples - first);
        let offset = (STORE_HEADER_SIZE + first * self.record_size) as u64;
        let bytes = match self
            .storage
            .read_range(&self.path, offset, count * self.record_size)
        {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.read_errors += 1;
                warn!(path = %self.path, chunk = id, error = %e, "chunk read failed");
                return None;
            }
        };
        self.stats.chunk_loads += 1;
        self.stats.bytes_read += bytes.len() as u64;

        let mut labels = Vec::with_capacity(count);
        let mut features = PackedArray::with_capacity(self.bits, count * self.num_features);
        for rec in bytes.chunks_exact(self.record_size) {
            let sample = decode_record(rec, self.num_features, self.bits);
            labels.push(sample.label);
            for v in sample.features {
                features.push(v);
            }
        }
        Some(CachedChunk {
            id,
            first,
            labels,
            features,
        })
    }
}

fn clamp_range(indices: &[u32], begin: usize, end: usize) -> std::ops::Range<usize> {
    let end = end.min(indices.len());
    begin.min(end)..end
}

impl SampleSource for ChunkAccessor {
    fn num_samples(&self) -> usize {
        self.num_samples
    }

    fn num_features(&self) -> usize {
        self.num_features
    }

    fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }

    fn is_paged(&self) -> bool {
        true
    }

    fn extract_labels(&mut self, indices: &[u32], out: &mut Vec<u8>) {
        out.clear();
        out.reserve(indices.len());
        for &i in indices {
            let i = i as usize;
            let label = match self.chunk_slot(i) {
                Some(slot) => {
                    let c = &self.cache[slot];
                    c.labels.get(i - c.first).copied().unwrap_or(ERROR_LABEL)
                }
                None => ERROR_LABEL,
            };
            out.push(label);
        }
    }

    fn extract_feature(&mut self, indices: &[u32], feature: usize, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(indices.len());
        let nf = self.num_features;
        for &i in indices {
            let i = i as usize;
            let value = match self.chunk_slot(i) {
                Some(slot) if feature < nf => {
                    let c = &self.cache[slot];
                    c.features.get((i - c.first) * nf + feature)
                }
                _ => 0,
            };
            out.push(value);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Sample, SampleStore};
    use crate::io::MemStorage;

    fn persisted_store(n: usize) -> SampleStore {
        let mut store = SampleStore::new(MemStorage::shared(), "/acc.bin");
        store.init(n, 3, 2).unwrap();
        for i in 0..n {
            store
                .push(&Sample::new(vec![(i % 4) as u8, 3, ((i / 4) % 4) as u8], (i % 3) as u8))
                .unwrap();
        }
        store.release(true).unwrap();
        store.load().unwrap();
        store
    }

    #[test]
    fn accessor_matches_resident_store() {
        let mut store = persisted_store(40);
        let mut acc =
            ChunkAccessor::init(store.storage().clone(), "/acc.bin", 40, 3, 2, 8).unwrap();

        let indices: Vec<u32> = vec![0, 39, 7, 8, 15, 16, 2];
        for f in 0..3 {
            let mut expected = Vec::new();
            store.extract_feature(&indices, f, &mut expected);
            assert_eq!(acc.batch_extract_feature(&indices, 0, indices.len(), f), expected);
        }
        let mut expected = Vec::new();
        store.extract_labels(&indices, &mut expected);
        assert_eq!(acc.batch_extract_labels(&indices, 0, indices.len()), expected);
    }

    #[test]
    fn sorted_reads_hit_cache() {
        let store = persisted_store(32);
        let mut acc =
            ChunkAccessor::init(store.storage().clone(), "/acc.bin", 32, 3, 2, 8)
                .unwrap()
                .with_cache_chunks(1);

        let sorted: Vec<u32> = (0..32).collect();
        acc.batch_extract_labels(&sorted, 0, sorted.len());
        let s = acc.stats();
        assert_eq!(s.chunk_loads, 4);
        assert_eq!(s.misses, 4);
        assert_eq!(s.hits, 28);

        acc.flush();
        let interleaved: Vec<u32> = (0..32).map(|i| (i % 4) * 8 + i / 4).collect();
        acc.batch_extract_labels(&interleaved, 0, interleaved.len());
        assert_eq!(acc.stats().chunk_loads, 32);
        assert!(acc.stats().hit_rate() < s.hit_rate());
    }

    #[test]
    fn out_of_range_indices_default() {
        let store = persisted_store(4);
        let mut acc = ChunkAccessor::init(store.storage().clone(), "/acc.bin", 4, 3, 2, 2).unwrap();
        assert_eq!(acc.batch_extract_labels(&[1, 9], 0, 2), vec![1, ERROR_LABEL]);
        assert_eq!(acc.batch_extract_feature(&[9], 0, 1, 0), vec![0]);
        assert_eq!(acc.batch_extract_feature(&[0, 1, 2], 1, 2, 0), vec![1]);
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = ChunkAccessor::init(MemStorage::shared(), "/nope", 4, 3, 2, 2).unwrap_err();
        assert!(matches!(err, DataError::AccessorOpen { .. }));
    }

    #[test]
    fn shape_mismatch_fails_to_open() {
        let store = persisted_store(4);
        let err =
            ChunkAccessor::init(store.storage().clone(), "/acc.bin", 4, 5, 2, 2).unwrap_err();
        assert!(matches!(err, DataError::FeatureCountMismatch { .. }));

        let err =
            ChunkAccessor::init(store.storage().clone(), "/acc.bin", 4, 3, 4, 2).unwrap_err();
        assert!(matches!(
            err,
            DataError::QuantBitsMismatch { expected: 4, actual: 2 }
        ));
    }
}
