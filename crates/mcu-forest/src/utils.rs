//! Hashing and seed-mixing helpers shared across the crate.

// =============================================================================
// SplitMix64
// =============================================================================

/// Golden-ratio increment, also used to spread stream ids.
pub const SPLITMIX_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;
const SPLITMIX_M1: u64 = 0xbf58_476d_1ce4_e5b9;
const SPLITMIX_M2: u64 = 0x94d0_49bb_1331_11eb;

/// SplitMix64 finalizer: a bijective 64-bit mix.
#[inline]
pub fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(SPLITMIX_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(SPLITMIX_M1);
    z = (z ^ (z >> 27)).wrapping_mul(SPLITMIX_M2);
    z ^ (z >> 31)
}

/// Seed for an independent stream derived from `(seed, stream, nonce)`.
#[inline]
pub fn derive_seed(seed: u64, stream: u64, nonce: u64) -> u64 {
    splitmix64(seed ^ stream.wrapping_mul(SPLITMIX_GAMMA).wrapping_add(nonce))
}

// =============================================================================
// FNV-1a
// =============================================================================

pub const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
pub const FNV_PRIME: u64 = 1_099_511_628_211;

/// Incremental 64-bit FNV-1a.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Fnv1a {
    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    #[inline]
    pub fn finish(self) -> u64 {
        self.0
    }
}

/// Order-sensitive hash of an id vector: every id as little-endian `u32`,
/// then the length.
pub fn hash_ids(ids: &[u32]) -> u64 {
    let mut h = Fnv1a::default();
    for id in ids {
        h.write(&id.to_le_bytes());
    }
    h.write(&(ids.len() as u64).to_le_bytes());
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitmix_reference_values() {
        // First outputs of the reference SplitMix64 generator seeded with 0.
        assert_eq!(splitmix64(0), 0xe220_a839_7b1d_cdaf);
        assert_eq!(splitmix64(SPLITMIX_GAMMA), 0x6e78_9e6a_a1b9_65f4);
    }

    #[test]
    fn fnv_empty_input_is_offset() {
        assert_eq!(Fnv1a::default().finish(), FNV_OFFSET);
        let mut h = Fnv1a::default();
        h.write(b"a");
        assert_eq!(h.finish(), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn hash_ids_is_order_and_length_sensitive() {
        assert_ne!(hash_ids(&[1, 2, 3]), hash_ids(&[3, 2, 1]));
        assert_ne!(hash_ids(&[0]), hash_ids(&[0, 0]));
        assert_eq!(hash_ids(&[5, 6]), hash_ids(&[5, 6]));
    }

    #[test]
    fn derived_seeds_differ_per_stream_and_nonce() {
        let a = derive_seed(37, 0, 0);
        assert_ne!(a, derive_seed(37, 1, 0));
        assert_ne!(a, derive_seed(37, 0, 1));
        assert_eq!(a, derive_seed(37, 0, 0));
    }
}
