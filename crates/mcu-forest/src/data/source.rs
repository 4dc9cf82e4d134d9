//! Read access to quantized samples during tree building.
//!
//! The tree builder works over a [`SampleSource`], implemented by:
//!
//! - [`SampleStore`](super::SampleStore): fully resident samples
//! - [`ChunkAccessor`](super::ChunkAccessor): storage-backed reads with a
//!   small chunk cache ("partial loading")
//!
//! Extraction is batched over a slice of sample indices so a paged source
//! can group reads by chunk.

/// Batched feature and label reads by sample index.
pub trait SampleSource {
    /// Number of addressable samples.
    fn num_samples(&self) -> usize;

    /// Features per sample.
    fn num_features(&self) -> usize;

    /// Samples per storage chunk, used to order reads.
    fn samples_per_chunk(&self) -> usize;

    /// Whether reads go to persistent storage.
    ///
    /// Callers sort index ranges by chunk before extracting from a paged
    /// source to maximize cache hits.
    fn is_paged(&self) -> bool {
        false
    }

    /// Labels of `indices`, written into `out` (cleared first).
    ///
    /// Out-of-range indices yield [`ERROR_LABEL`](super::ERROR_LABEL).
    fn extract_labels(&mut self, indices: &[u32], out: &mut Vec<u8>);

    /// Values of `feature` for `indices`, written into `out` (cleared first).
    ///
    /// Out-of-range indices yield 0.
    fn extract_feature(&mut self, indices: &[u32], feature: usize, out: &mut Vec<u8>);

    /// Chunk holding sample `index`.
    #[inline]
    fn chunk_of(&self, index: u32) -> usize {
        index as usize / self.samples_per_chunk().max(1)
    }
}
