//! Quantized, chunked sample store.
//!
//! Samples are kept in fixed-capacity chunks of bit-packed feature values,
//! sized so one chunk stays under [`MAX_CHUNK_BYTES`]. Labels are packed
//! separately. The whole store can be released to the persistent store and
//! loaded back, or read one chunk / one subset at a time.
//!
//! # File Format
//!
//! ```text
//! Offset  Size           Field
//! ------  ----           -----
//! 0       4              num_samples (u32)
//! 4       2              num_features (u16)
//! 6       1              quant_bits (u8)
//! 7       R × n          records, R = 1 + ceil(num_features × bits / 8)
//!
//! record: label (u8), features packed LSB-first at `bits` each
//! ```
//!
//! Sample ids are not stored; a sample's index is its record position.
//!
//! # Example
//!
//! ```ignore
//! use mcu_forest::data::{Sample, SampleStore};
//! use mcu_forest::io::MemStorage;
//!
//! let mut store = SampleStore::new(MemStorage::shared(), "/demo_base.bin");
//! store.init(100, 4, 2)?;
//! store.push(&Sample::new(vec![0, 1, 2, 3], 1))?;
//! store.release(true)?;   // written to flash, memory freed
//! store.load()?;          // back in memory
//! ```

use tracing::{debug, warn};

use super::error::DataError;
use super::packing::{label_bits_for, packed_len, read_packed, write_packed, PackedArray};
use super::sample::Sample;
use super::source::SampleSource;
use super::{ERROR_LABEL, MAX_CHUNK_BYTES};
use crate::io::{ByteReader, FormatError, SharedStorage};
use crate::repr::MAX_FEATURES;

// ============================================================================
// Header & record codec
// ============================================================================

/// Size of the store file header in bytes.
pub const STORE_HEADER_SIZE: usize = 7;

/// Header of a sample-store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    pub num_samples: u32,
    pub num_features: u16,
    pub quant_bits: u8,
}

impl StoreHeader {
    pub fn to_bytes(&self) -> [u8; STORE_HEADER_SIZE] {
        let mut buf = [0u8; STORE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.num_samples.to_le_bytes());
        buf[4..6].copy_from_slice(&self.num_features.to_le_bytes());
        buf[6] = self.quant_bits;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FormatError> {
        let mut r = ByteReader::new(buf);
        let header = Self {
            num_samples: r.u32()?,
            num_features: r.u16()?,
            quant_bits: r.u8()?,
        };
        if !(1..=8).contains(&header.quant_bits) {
            return Err(FormatError::CorruptPayload(format!(
                "invalid quantization width {} in store header",
                header.quant_bits
            )));
        }
        Ok(header)
    }
}

/// Bytes per record: one label byte plus packed features.
#[inline]
pub fn record_size(num_features: usize, bits: u8) -> usize {
    1 + packed_len(num_features, bits)
}

/// Samples per chunk for a feature count and width (at least 1).
#[inline]
pub fn samples_per_chunk(num_features: usize, bits: u8) -> usize {
    let bits_per_sample = (num_features * bits as usize).max(1);
    ((MAX_CHUNK_BYTES * 8) / bits_per_sample).max(1)
}

pub(crate) fn encode_record(sample: &Sample, bits: u8, out: &mut Vec<u8>) {
    out.push(sample.label);
    let start = out.len();
    out.resize(start + packed_len(sample.features.len(), bits), 0);
    for (i, &v) in sample.features.iter().enumerate() {
        write_packed(&mut out[start..], i, bits, v);
    }
}

pub(crate) fn decode_record(bytes: &[u8], num_features: usize, bits: u8) -> Sample {
    let label = bytes.first().copied().unwrap_or(ERROR_LABEL);
    let packed = bytes.get(1..).unwrap_or(&[]);
    let features = (0..num_features)
        .map(|f| read_packed(packed, f, bits))
        .collect();
    Sample { label, features }
}

// ============================================================================
// SampleStore
// ============================================================================

/// Chunked, bit-packed collection of quantized samples backed by a file.
pub struct SampleStore {
    storage: SharedStorage,
    path: String,
    num_features: usize,
    quant_bits: u8,
    label_bits: u8,
    samples_per_chunk: usize,
    chunks: Vec<PackedArray>,
    labels: PackedArray,
    len: usize,
    loaded: bool,
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStore")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("num_features", &self.num_features)
            .field("quant_bits", &self.quant_bits)
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl SampleStore {
    /// Create an uninitialized store bound to `path`.
    pub fn new(storage: SharedStorage, path: impl Into<String>) -> Self {
        Self {
            storage,
            path: path.into(),
            num_features: 0,
            quant_bits: 2,
            label_bits: 8,
            samples_per_chunk: 1,
            chunks: Vec::new(),
            labels: PackedArray::new(8),
            len: 0,
            loaded: false,
        }
    }

    /// Pack labels at the width needed for `num_labels` instead of 8 bits.
    ///
    /// Only takes effect while the store is empty.
    pub fn with_num_labels(mut self, num_labels: usize) -> Self {
        if self.len == 0 {
            self.label_bits = label_bits_for(num_labels);
            self.labels = PackedArray::new(self.label_bits);
        }
        self
    }

    /// Set the shape of the store.
    ///
    /// Re-initializing with a different feature count is refused.
    pub fn init(
        &mut self,
        capacity_hint: usize,
        num_features: usize,
        quant_bits: u8,
    ) -> Result<(), DataError> {
        if num_features == 0 {
            return Err(DataError::NotInitialized);
        }
        if num_features > MAX_FEATURES {
            warn!(path = %self.path, num_features, "refusing store wider than a node can address");
            return Err(DataError::TooManyFeatures {
                count: num_features,
                max: MAX_FEATURES,
            });
        }
        if !(1..=8).contains(&quant_bits) {
            return Err(DataError::InvalidQuantBits(quant_bits));
        }
        if self.num_features != 0 && self.num_features != num_features {
            warn!(
                path = %self.path,
                expected = self.num_features,
                actual = num_features,
                "refusing to re-initialize store with a different feature count"
            );
            return Err(DataError::FeatureCountMismatch {
                expected: self.num_features,
                actual: num_features,
            });
        }
        if self.loaded && self.len > 0 && self.quant_bits != quant_bits {
            return Err(DataError::QuantBitsMismatch {
                expected: self.quant_bits,
                actual: quant_bits,
            });
        }
        if !self.loaded {
            self.clear();
        }
        self.num_features = num_features;
        self.quant_bits = quant_bits;
        self.samples_per_chunk = samples_per_chunk(num_features, quant_bits);
        self.loaded = true;
        self.reserve(capacity_hint);
        Ok(())
    }

    /// Reserve room for `n` additional samples.
    pub fn reserve(&mut self, n: usize) {
        self.labels.reserve(n);
        let chunks_needed = (self.len + n).div_ceil(self.samples_per_chunk.max(1));
        self.chunks
            .reserve(chunks_needed.saturating_sub(self.chunks.len()));
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    #[inline]
    pub fn quant_bits(&self) -> u8 {
        self.quant_bits
    }

    #[inline]
    pub fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }

    /// Number of chunks spanned by `len` samples.
    #[inline]
    pub fn num_chunks(&self) -> usize {
        self.len.div_ceil(self.samples_per_chunk.max(1))
    }

    /// Chunk holding sample `index`.
    #[inline]
    pub fn chunk_of(&self, index: usize) -> usize {
        index / self.samples_per_chunk.max(1)
    }

    /// Whether samples are resident in memory.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Bytes per record in the backing file.
    #[inline]
    pub fn record_size(&self) -> usize {
        record_size(self.num_features, self.quant_bits)
    }

    /// Largest representable feature value.
    #[inline]
    pub fn max_value(&self) -> u8 {
        ((1u16 << self.quant_bits) - 1) as u8
    }

    /// Whether the backing file exists.
    pub fn has_file(&self) -> bool {
        self.storage.exists(&self.path)
    }

    /// Feature `feature` of sample `index`; 0 when out of range or not loaded.
    #[inline]
    pub fn feature(&self, index: usize, feature: usize) -> u8 {
        if index >= self.len || feature >= self.num_features || !self.loaded {
            return 0;
        }
        let spc = self.samples_per_chunk;
        self.chunks
            .get(index / spc)
            .map_or(0, |c| c.get((index % spc) * self.num_features + feature))
    }

    /// Label of sample `index`; [`ERROR_LABEL`] when out of range or not loaded.
    #[inline]
    pub fn label(&self, index: usize) -> u8 {
        if index >= self.len || !self.loaded {
            return ERROR_LABEL;
        }
        self.labels.get(index)
    }

    /// Copy of sample `index`.
    pub fn get(&self, index: usize) -> Option<Sample> {
        if index >= self.len || !self.loaded {
            return None;
        }
        Some(Sample {
            label: self.labels.get(index),
            features: (0..self.num_features)
                .map(|f| self.feature(index, f))
                .collect(),
        })
    }

    /// Iterate over resident samples.
    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        let n = if self.loaded { self.len } else { 0 };
        (0..n).filter_map(move |i| self.get(i))
    }

    /// Per-label sample counts for labels `0..num_labels`.
    pub fn label_counts(&self, num_labels: usize) -> Vec<u32> {
        let mut counts = vec![0u32; num_labels];
        if self.loaded {
            for label in self.labels.iter() {
                if let Some(c) = counts.get_mut(label as usize) {
                    *c += 1;
                }
            }
        }
        counts
    }

    /// Heap bytes held by resident chunks and labels.
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.labels.memory_usage()
            + self.chunks.iter().map(PackedArray::memory_usage).sum::<usize>()
    }

    /// Bytes the store would occupy once fully resident.
    pub fn estimated_resident_bytes(&self) -> usize {
        packed_len(self.len * self.num_features, self.quant_bits)
            + packed_len(self.len, self.label_bits)
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    fn validate(&self, sample: &Sample) -> Result<(), DataError> {
        if self.num_features == 0 {
            return Err(DataError::NotInitialized);
        }
        if sample.features.len() != self.num_features {
            warn!(
                path = %self.path,
                expected = self.num_features,
                actual = sample.features.len(),
                "sample refused: feature count mismatch"
            );
            return Err(DataError::FeatureCountMismatch {
                expected: self.num_features,
                actual: sample.features.len(),
            });
        }
        let max = self.max_value();
        if let Some((feature, &value)) = sample.features.iter().enumerate().find(|&(_, &v)| v > max)
        {
            return Err(DataError::ValueOutOfRange { feature, value, max });
        }
        if sample.label > self.labels.max_value() {
            return Err(DataError::LabelOutOfRange {
                label: sample.label,
                bits: self.label_bits,
            });
        }
        Ok(())
    }

    fn resize(&mut self, n: usize) {
        let spc = self.samples_per_chunk;
        let nf = self.num_features;
        let needed_chunks = n.div_ceil(spc);
        self.chunks.truncate(needed_chunks);
        while self.chunks.len() < needed_chunks {
            self.chunks
                .push(PackedArray::with_capacity(self.quant_bits, spc * nf));
        }
        for (ci, chunk) in self.chunks.iter_mut().enumerate() {
            let in_chunk = (n - ci * spc).min(spc);
            if chunk.len() != in_chunk * nf {
                chunk.resize(in_chunk * nf);
            }
        }
        self.labels.resize(n);
        self.len = n;
    }

    fn write_slot(&mut self, index: usize, sample: &Sample) {
        let spc = self.samples_per_chunk;
        let base = (index % spc) * self.num_features;
        let chunk = &mut self.chunks[index / spc];
        for (f, &v) in sample.features.iter().enumerate() {
            chunk.set(base + f, v);
        }
        self.labels.set(index, sample.label);
    }

    /// Store `sample` at `index`.
    ///
    /// `index == len` appends, `index < len` overwrites, and `index > len`
    /// fills the gap with zeroed samples before writing.
    pub fn store(&mut self, sample: &Sample, index: usize) -> Result<(), DataError> {
        self.validate(sample)?;
        if !self.loaded {
            return Err(DataError::NotInitialized);
        }
        if index >= self.len {
            if index > self.len {
                debug!(path = %self.path, from = self.len, to = index, "gap-filling sample store");
            }
            self.resize(index + 1);
        }
        self.write_slot(index, sample);
        Ok(())
    }

    /// Append a sample.
    pub fn push(&mut self, sample: &Sample) -> Result<(), DataError> {
        self.store(sample, self.len)
    }

    /// Drop all resident samples and forget the logical size.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.labels.clear();
        self.len = 0;
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Serialize resident samples in file format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let rec = self.record_size();
        let mut out = Vec::with_capacity(STORE_HEADER_SIZE + rec * self.len);
        out.extend_from_slice(
            &StoreHeader {
                num_samples: self.len as u32,
                num_features: self.num_features as u16,
                quant_bits: self.quant_bits,
            }
            .to_bytes(),
        );
        for i in 0..self.len {
            out.push(self.labels.get(i));
            let start = out.len();
            out.resize(start + rec - 1, 0);
            for f in 0..self.num_features {
                write_packed(&mut out[start..], f, self.quant_bits, self.feature(i, f));
            }
        }
        out
    }

    /// Free resident chunks, writing them to storage first when `persist`.
    ///
    /// Without `persist` the logical size is kept, so the caller must know the
    /// file already reflects the data (e.g. it was loaded and not modified).
    pub fn release(&mut self, persist: bool) -> Result<(), DataError> {
        if persist && self.loaded {
            self.storage.write_atomic(&self.path, &self.to_bytes())?;
            debug!(path = %self.path, samples = self.len, "sample store released to storage");
        }
        self.chunks = Vec::new();
        self.labels = PackedArray::new(self.label_bits);
        self.loaded = false;
        Ok(())
    }

    fn read_header(&self) -> Result<StoreHeader, DataError> {
        let bytes = self.storage.read_range(&self.path, 0, STORE_HEADER_SIZE)?;
        Ok(StoreHeader::from_bytes(&bytes)?)
    }

    /// Refuse a file whose shape disagrees with an initialized store.
    fn check_header(&self, header: &StoreHeader) -> Result<(), DataError> {
        let file_features = header.num_features as usize;
        if self.num_features == 0 {
            return Ok(());
        }
        if header.quant_bits != self.quant_bits {
            warn!(
                path = %self.path,
                expected = self.quant_bits,
                actual = header.quant_bits,
                "refusing file: quantization width mismatch"
            );
            return Err(DataError::QuantBitsMismatch {
                expected: self.quant_bits,
                actual: header.quant_bits,
            });
        }
        if self.num_features != file_features {
            warn!(
                path = %self.path,
                expected = self.num_features,
                actual = file_features,
                "refusing to load: feature count mismatch"
            );
            return Err(DataError::FeatureCountMismatch {
                expected: self.num_features,
                actual: file_features,
            });
        }
        Ok(())
    }

    /// Load every sample from the backing file into memory.
    ///
    /// On failure the store is left empty.
    pub fn load(&mut self) -> Result<(), DataError> {
        let result = self.load_inner();
        if let Err(e) = &result {
            warn!(path = %self.path, error = %e, "sample store load failed");
            self.clear();
            self.loaded = self.num_features != 0;
        }
        result
    }

    fn load_inner(&mut self) -> Result<(), DataError> {
        let bytes = self.storage.read(&self.path)?;
        let header = StoreHeader::from_bytes(&bytes)?;
        let nf = header.num_features as usize;
        self.check_header(&header)?;
        if self.num_features == 0 {
            self.init(0, nf, header.quant_bits)?;
        }

        let rec = self.record_size();
        let n = header.num_samples as usize;
        let expected = STORE_HEADER_SIZE + rec * n;
        if bytes.len() < expected {
            return Err(FormatError::Truncated {
                expected,
                actual: bytes.len(),
            }
            .into());
        }

        self.clear();
        self.loaded = true;
        self.resize(n);
        for i in 0..n {
            let off = STORE_HEADER_SIZE + i * rec;
            let sample = decode_record(&bytes[off..off + rec], nf, self.quant_bits);
            self.write_slot(i, &sample);
        }
        debug!(path = %self.path, samples = n, "sample store loaded");
        Ok(())
    }

    /// Load the samples with the given ids from `source`'s backing file.
    ///
    /// Ids index records in the source file; out-of-range ids are skipped.
    /// Loaded samples are densely re-indexed in id order. Returns the count.
    pub fn load_subset(&mut self, source: &SampleStore, ids: &[u32]) -> Result<usize, DataError> {
        let header = source.read_header()?;
        let nf = header.num_features as usize;
        self.check_header(&header)?;
        if self.num_features == 0 || !self.loaded {
            self.init(ids.len(), nf, header.quant_bits)?;
        }
        self.clear();
        self.loaded = true;

        let rec = record_size(nf, header.quant_bits);
        let total = header.num_samples as usize;
        let mut loaded = 0usize;
        let mut i = 0usize;
        while i < ids.len() {
            // Coalesce runs of consecutive ids into a single read.
            let start = ids[i] as usize;
            let mut run = 1usize;
            while i + run < ids.len() && ids[i + run] as usize == start + run {
                run += 1;
            }
            if start >= total {
                i += run;
                continue;
            }
            let run_len = run.min(total - start);
            let offset = (STORE_HEADER_SIZE + start * rec) as u64;
            let bytes = source
                .storage
                .read_range(&source.path, offset, run_len * rec)?;
            for r in 0..run_len {
                let sample = decode_record(&bytes[r * rec..(r + 1) * rec], nf, self.quant_bits);
                self.resize(loaded + 1);
                self.write_slot(loaded, &sample);
                loaded += 1;
            }
            i += run;
        }
        debug!(source = %source.path, dest = %self.path, loaded, "loaded sample subset");
        Ok(loaded)
    }

    /// Read chunk `chunk_index` from the backing file without loading the rest.
    pub fn read_chunk(&self, chunk_index: usize) -> Result<Vec<Sample>, DataError> {
        let header = self.read_header()?;
        let nf = header.num_features as usize;
        self.check_header(&header)?;
        let bits = header.quant_bits;
        let total = header.num_samples as usize;
        let spc = samples_per_chunk(nf, bits);
        let start = chunk_index * spc;
        if start >= total {
            return Ok(Vec::new());
        }
        let count = spc.min(total - start);
        let rec = record_size(nf, bits);
        let bytes = self.storage.read_range(
            &self.path,
            (STORE_HEADER_SIZE + start * rec) as u64,
            count * rec,
        )?;
        Ok(bytes
            .chunks_exact(rec)
            .map(|r| decode_record(r, nf, bits))
            .collect())
    }

    /// Delete the backing file and all resident data.
    pub fn purge(&mut self) -> Result<(), DataError> {
        self.clear();
        self.storage.remove(&self.path)?;
        debug!(path = %self.path, "sample store purged");
        Ok(())
    }

    /// Append samples straight to the backing file.
    ///
    /// With `max_samples > 0`, the oldest samples beyond the limit are
    /// dropped and their labels returned. A resident store is written out
    /// first and reloaded afterwards.
    pub fn append_to_file(
        &mut self,
        samples: &[Sample],
        max_samples: usize,
    ) -> Result<Vec<u8>, DataError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let nf = samples[0].features.len();
        if self.num_features == 0 {
            self.init(0, nf, self.quant_bits)?;
        }
        for s in samples {
            self.validate(s)?;
        }

        let was_loaded = self.loaded;
        if was_loaded {
            self.release(true)?;
        }

        let mut bytes = if self.has_file() {
            self.storage.read(&self.path)?
        } else {
            StoreHeader {
                num_samples: 0,
                num_features: self.num_features as u16,
                quant_bits: self.quant_bits,
            }
            .to_bytes()
            .to_vec()
        };
        let header = StoreHeader::from_bytes(&bytes)?;
        self.check_header(&header)?;

        let rec = self.record_size();
        let existing = header.num_samples as usize;
        bytes.truncate(STORE_HEADER_SIZE + existing * rec);
        for s in samples {
            encode_record(s, self.quant_bits, &mut bytes);
        }

        let mut total = existing + samples.len();
        let mut removed = Vec::new();
        if max_samples > 0 && total > max_samples {
            let drop = total - max_samples;
            removed.extend(
                (0..drop).map(|i| bytes[STORE_HEADER_SIZE + i * rec]),
            );
            bytes.drain(STORE_HEADER_SIZE..STORE_HEADER_SIZE + drop * rec);
            total = max_samples;
            debug!(path = %self.path, dropped = drop, "dropped oldest samples");
        }
        bytes[0..4].copy_from_slice(&(total as u32).to_le_bytes());
        self.storage.write_atomic(&self.path, &bytes)?;
        self.len = total;

        if was_loaded {
            self.load()?;
        }
        Ok(removed)
    }
}

// ============================================================================
// SampleSource
// ============================================================================

impl SampleSource for SampleStore {
    fn num_samples(&self) -> usize {
        self.len
    }

    fn num_features(&self) -> usize {
        self.num_features
    }

    fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }

    fn extract_labels(&mut self, indices: &[u32], out: &mut Vec<u8>) {
        out.clear();
        out.extend(indices.iter().map(|&i| self.label(i as usize)));
    }

    fn extract_feature(&mut self, indices: &[u32], feature: usize, out: &mut Vec<u8>) {
        out.clear();
        out.extend(indices.iter().map(|&i| self.feature(i as usize, feature)));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemStorage, Storage};

    fn store_with(n: usize, nf: usize) -> SampleStore {
        let mut store = SampleStore::new(MemStorage::shared(), "/t_base.bin");
        store.init(n, nf, 2).unwrap();
        for i in 0..n {
            let features = (0..nf).map(|f| ((i + f) % 4) as u8).collect();
            store.push(&Sample::new(features, (i % 3) as u8)).unwrap();
        }
        store
    }

    #[test]
    fn chunk_capacity_fits_byte_budget() {
        assert_eq!(samples_per_chunk(4, 2), 8192);
        assert_eq!(samples_per_chunk(100_000, 8), 1);
        assert_eq!(record_size(4, 2), 2);
        assert_eq!(record_size(5, 2), 3);
    }

    #[test]
    fn store_append_overwrite_and_gap_fill() {
        let mut store = SampleStore::new(MemStorage::shared(), "/s");
        store.init(4, 3, 2).unwrap();

        store.store(&Sample::new(vec![1, 2, 3], 1), 0).unwrap();
        store.store(&Sample::new(vec![3, 3, 3], 2), 0).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(0).unwrap(), Sample::new(vec![3, 3, 3], 2));

        store.store(&Sample::new(vec![1, 1, 1], 1), 3).unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.get(1).unwrap(), Sample::zeroed(3));
        assert_eq!(store.get(2).unwrap(), Sample::zeroed(3));
        assert_eq!(store.get(3).unwrap(), Sample::new(vec![1, 1, 1], 1));
    }

    #[test]
    fn store_refuses_wrong_feature_count() {
        let mut store = store_with(3, 4);
        let err = store.push(&Sample::new(vec![0, 0], 0)).unwrap_err();
        assert!(matches!(
            err,
            DataError::FeatureCountMismatch { expected: 4, actual: 2 }
        ));
        assert_eq!(store.len(), 3);

        let err = store.init(10, 5, 2).unwrap_err();
        assert!(matches!(err, DataError::FeatureCountMismatch { .. }));
    }

    #[test]
    fn store_refuses_more_features_than_nodes_address() {
        let mut store = SampleStore::new(MemStorage::shared(), "/s");
        assert!(store.init(1, MAX_FEATURES, 1).is_ok());

        let mut wide = SampleStore::new(MemStorage::shared(), "/s2");
        let err = wide.init(1, MAX_FEATURES + 76, 1).unwrap_err();
        assert!(matches!(err, DataError::TooManyFeatures { count: 1100, max: 1024 }));
    }

    #[test]
    fn store_refuses_values_above_width() {
        let mut store = SampleStore::new(MemStorage::shared(), "/s");
        store.init(1, 2, 2).unwrap();
        let err = store.push(&Sample::new(vec![4, 0], 0)).unwrap_err();
        assert!(matches!(err, DataError::ValueOutOfRange { value: 4, max: 3, .. }));
    }

    #[test]
    fn release_and_load_roundtrip() {
        let mut store = store_with(50, 4);
        let before: Vec<Sample> = store.iter().collect();

        store.release(true).unwrap();
        assert!(!store.is_loaded());
        assert_eq!(store.label(0), ERROR_LABEL);
        assert_eq!(store.len(), 50);

        store.load().unwrap();
        assert!(store.is_loaded());
        let after: Vec<Sample> = store.iter().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn file_layout_is_header_then_packed_records() {
        let storage = MemStorage::shared();
        let mut store = SampleStore::new(storage.clone(), "/f");
        store.init(2, 4, 2).unwrap();
        store.push(&Sample::new(vec![1, 2, 3, 0], 2)).unwrap();
        store.release(true).unwrap();

        let bytes = storage.read("/f").unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0, 4, 0, 2, 2, 0b00_11_10_01]);
    }

    #[test]
    fn load_refuses_feature_mismatch_and_leaves_store_empty() {
        let storage = MemStorage::shared();
        let mut a = SampleStore::new(storage.clone(), "/shared");
        a.init(1, 4, 2).unwrap();
        a.push(&Sample::new(vec![0; 4], 0)).unwrap();
        a.release(true).unwrap();

        let mut b = SampleStore::new(storage, "/shared");
        b.init(1, 3, 2).unwrap();
        b.push(&Sample::new(vec![1; 3], 1)).unwrap();
        let err = b.load().unwrap_err();
        assert!(matches!(err, DataError::FeatureCountMismatch { .. }));
        assert!(b.is_empty());
    }

    #[test]
    fn fresh_store_takes_width_from_file() {
        let storage = MemStorage::shared();
        let mut wide = SampleStore::new(storage.clone(), "/wide");
        wide.init(3, 3, 4).unwrap();
        let samples = vec![
            Sample::new(vec![15, 0, 9], 1),
            Sample::new(vec![7, 12, 3], 0),
            Sample::new(vec![1, 14, 8], 2),
        ];
        for s in &samples {
            wide.push(s).unwrap();
        }
        wide.release(true).unwrap();

        let mut reopened = SampleStore::new(storage.clone(), "/wide");
        reopened.load().unwrap();
        assert_eq!(reopened.quant_bits(), 4);
        assert_eq!(reopened.iter().collect::<Vec<_>>(), samples);

        let released = SampleStore::new(storage.clone(), "/wide");
        assert_eq!(released.read_chunk(0).unwrap(), samples);

        let mut subset = SampleStore::new(storage, "/wide_sub");
        assert_eq!(subset.load_subset(&released, &[0, 2]).unwrap(), 2);
        assert_eq!(subset.quant_bits(), 4);
        assert_eq!(subset.get(1).unwrap(), samples[2]);
    }

    #[test]
    fn load_refuses_width_mismatch() {
        let storage = MemStorage::shared();
        let mut wide = SampleStore::new(storage.clone(), "/w");
        wide.init(1, 2, 4).unwrap();
        wide.push(&Sample::new(vec![9, 3], 0)).unwrap();
        wide.release(true).unwrap();

        let mut narrow = SampleStore::new(storage, "/w");
        narrow.init(1, 2, 2).unwrap();
        let err = narrow.load().unwrap_err();
        assert!(matches!(
            err,
            DataError::QuantBitsMismatch { expected: 2, actual: 4 }
        ));
        assert!(narrow.is_empty());
    }

    #[test]
    fn load_of_missing_file_is_storage_error() {
        let mut store = SampleStore::new(MemStorage::shared(), "/missing");
        assert!(matches!(store.load(), Err(DataError::Storage(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn load_subset_reads_selected_records() {
        let mut base = store_with(20, 4);
        let expected: Vec<Sample> = [2usize, 3, 4, 10, 19]
            .iter()
            .map(|&i| base.get(i).unwrap())
            .collect();
        base.release(true).unwrap();

        let mut subset = SampleStore::new(base.storage().clone(), "/t_sub.bin");
        let n = subset.load_subset(&base, &[2, 3, 4, 10, 19, 25]).unwrap();
        assert_eq!(n, 5);
        assert_eq!(subset.iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn read_chunk_without_loading() {
        let mut store = store_with(10, 4);
        let first = store.get(0).unwrap();
        store.release(true).unwrap();

        let chunk = store.read_chunk(0).unwrap();
        assert_eq!(chunk.len(), 10);
        assert_eq!(chunk[0], first);
        assert!(store.read_chunk(1).unwrap().is_empty());
    }

    #[test]
    fn append_to_file_drops_oldest_beyond_limit() {
        let mut store = store_with(5, 2);
        store.release(true).unwrap();

        let new = vec![
            Sample::new(vec![3, 3], 1),
            Sample::new(vec![2, 2], 2),
        ];
        let removed = store.append_to_file(&new, 6).unwrap();
        assert_eq!(removed, vec![0]);
        assert_eq!(store.len(), 6);

        store.load().unwrap();
        assert_eq!(store.get(0).unwrap().label, 1);
        assert_eq!(store.get(5).unwrap(), Sample::new(vec![2, 2], 2));
    }

    #[test]
    fn append_to_file_keeps_resident_store_resident() {
        let mut store = store_with(3, 2);
        store.append_to_file(&[Sample::new(vec![1, 1], 0)], 0).unwrap();
        assert!(store.is_loaded());
        assert_eq!(store.len(), 4);
        assert_eq!(store.get(3).unwrap(), Sample::new(vec![1, 1], 0));
    }

    #[test]
    fn purge_removes_file() {
        let mut store = store_with(3, 2);
        store.release(true).unwrap();
        assert!(store.has_file());
        store.purge().unwrap();
        assert!(!store.has_file());
        assert!(store.is_empty());
    }

    #[test]
    fn packed_labels_for_small_label_sets() {
        let mut store = SampleStore::new(MemStorage::shared(), "/l").with_num_labels(2);
        store.init(1, 1, 1).unwrap();
        store.push(&Sample::new(vec![1], 1)).unwrap();
        let err = store.push(&Sample::new(vec![0], 2)).unwrap_err();
        assert!(matches!(err, DataError::LabelOutOfRange { label: 2, bits: 1 }));
    }
}
