//! Per-tree sample subsets.
//!
//! Each tree draws its training subset from an independent RNG stream
//! derived from `(seed, tree index, nonce)`:
//!
//! - with replacement: `n` draws from `0..n`
//! - without replacement: a partial Fisher-Yates shuffle of
//!   `max(1, floor(n * ratio))` ids
//!
//! Subsets are sorted so trees read the sample store in chunk order. A
//! subset whose hash was already produced in the current pass is redrawn
//! with the next nonce; after [`MAX_BOOTSTRAP_RETRIES`] collisions one id is
//! replaced by a fresh draw and the result is accepted.

use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::utils::{derive_seed, hash_ids};

use super::config::RfConfig;

/// Redraws before a colliding subset is perturbed and accepted.
pub const MAX_BOOTSTRAP_RETRIES: u64 = 8;

/// Stream offset separating split-feature draws from bootstrap draws.
pub const FEATURE_STREAM: u64 = 1 << 32;

/// Independent generator for `(seed, stream, nonce)`.
pub fn derive_rng(seed: u64, stream: u64, nonce: u64) -> Xoshiro256PlusPlus {
    Xoshiro256PlusPlus::seed_from_u64(derive_seed(seed, stream, nonce))
}

/// Draws reproducible, pairwise-distinct per-tree subsets.
#[derive(Debug, Clone)]
pub struct BootstrapEngine {
    seed: u64,
    with_replacement: bool,
    ratio: f32,
    seen: HashSet<u64>,
    collisions: usize,
}

impl BootstrapEngine {
    pub fn new(seed: u64, with_replacement: bool, ratio: f32) -> Self {
        Self {
            seed,
            with_replacement,
            ratio,
            seen: HashSet::new(),
            collisions: 0,
        }
    }

    pub fn from_config(config: &RfConfig) -> Self {
        Self::new(config.seed, config.bootstrap, config.bootstrap_ratio)
    }

    /// Forget hashes from the previous pass.
    pub fn reset(&mut self) {
        self.seen.clear();
        self.collisions = 0;
    }

    /// Collisions seen in the current pass.
    #[inline]
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    /// Size of a subset drawn from `n` samples.
    pub fn subset_size(&self, n: usize) -> usize {
        if n == 0 {
            0
        } else if self.with_replacement {
            n
        } else {
            ((n as f64 * self.ratio as f64).floor() as usize).clamp(1, n)
        }
    }

    fn draw(&self, rng: &mut Xoshiro256PlusPlus, n: usize) -> Vec<u32> {
        let k = self.subset_size(n);
        let mut ids: Vec<u32> = if self.with_replacement {
            (0..k).map(|_| rng.gen_range(0..n) as u32).collect()
        } else {
            let mut pool: Vec<u32> = (0..n as u32).collect();
            for i in 0..k {
                let j = rng.gen_range(i..n);
                pool.swap(i, j);
            }
            pool.truncate(k);
            pool
        };
        ids.sort_unstable();
        ids
    }

    /// Subset for tree `tree_index` out of `n` samples.
    pub fn subset(&mut self, tree_index: usize, n: usize) -> Vec<u32> {
        if n == 0 {
            return Vec::new();
        }
        let stream = tree_index as u64;
        for nonce in 0..MAX_BOOTSTRAP_RETRIES {
            let mut rng = derive_rng(self.seed, stream, nonce);
            let ids = self.draw(&mut rng, n);
            if self.seen.insert(hash_ids(&ids)) {
                return ids;
            }
            self.collisions += 1;
        }

        let mut rng = derive_rng(self.seed, stream, MAX_BOOTSTRAP_RETRIES);
        let mut ids = self.draw(&mut rng, n);
        let pos = rng.gen_range(0..ids.len());
        ids[pos] = rng.gen_range(0..n) as u32;
        ids.sort_unstable();
        self.seen.insert(hash_ids(&ids));
        tracing::debug!(tree = tree_index, "bootstrap retries exhausted, accepting perturbed subset");
        ids
    }

    /// Subsets for `num_trees` trees, starting a fresh pass.
    pub fn build_all(&mut self, num_trees: usize, n: usize) -> Vec<Vec<u32>> {
        self.reset();
        let subsets: Vec<_> = (0..num_trees).map(|i| self.subset(i, n)).collect();
        if self.collisions > 0 {
            tracing::debug!(collisions = self.collisions, "bootstrap subset collisions");
        }
        subsets
    }
}

/// Membership bitmap of one subset over `0..n`.
pub fn in_bag_mask(subset: &[u32], n: usize) -> Vec<bool> {
    let mut mask = vec![false; n];
    for &id in subset {
        if let Some(m) = mask.get_mut(id as usize) {
            *m = true;
        }
    }
    mask
}
