//! A fixed-bit-array Bloom filter with no false negatives, safe for
//! concurrent `add`/`contains` from multiple threads.
//!
//! Sized from `(expected_elements, target_false_positive_rate)` using the
//! standard formulas `m = ceil(-n * ln(p) / ln(2)^2)` and
//! `k = round(m / n * ln(2))`.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::errors::CoreError;

const BITS_PER_WORD: usize = 64;

/// A concurrent, fixed-size Bloom filter.
///
/// Contract: `add(h)` returns `false` iff every selected bit was already
/// set (meaning `h` was possibly already present); it returns `true` only
/// when at least one bit was flipped from unset to set, which guarantees
/// `h` was definitely not present before this call. `contains(h)` never
/// returns `false` for a previously-added `h` that has not been cleared.
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
    approx_len: AtomicUsize,
}

impl BloomFilter {
    /// Construct a filter sized for `expected_elements` insertions at a
    /// target false-positive rate `fpr`. Fails for `expected_elements == 0`
    /// or `fpr` outside `(0, 1)`.
    pub fn new(expected_elements: usize, fpr: f64) -> Result<Self, CoreError> {
        if expected_elements == 0 {
            return Err(CoreError::ConfigInvalid(
                "bloom filter expected_elements must be greater than zero".into(),
            ));
        }
        if !(fpr > 0.0 && fpr < 1.0) {
            return Err(CoreError::ConfigInvalid(
                "bloom filter false-positive rate must be in (0, 1)".into(),
            ));
        }

        let n = expected_elements as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(n * fpr.ln()) / (ln2 * ln2)).ceil().max(BITS_PER_WORD as f64) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;
        let num_words = num_bits.div_ceil(BITS_PER_WORD as u64) as usize;

        Ok(Self {
            bits: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            num_hashes,
            approx_len: AtomicUsize::new(0),
        })
    }

    fn hash_pair<T: Hash>(item: &T) -> (u64, u64) {
        let mut h1 = std::collections::hash_map::DefaultHasher::new();
        item.hash(&mut h1);
        0xBu64.hash(&mut h1);
        let a = h1.finish();

        let mut h2 = std::collections::hash_map::DefaultHasher::new();
        item.hash(&mut h2);
        0x9E3779B97F4A7C15u64.hash(&mut h2);
        let b = h2.finish();
        (a, b)
    }

    fn bit_indices<T: Hash>(&self, item: &T) -> impl Iterator<Item = u64> + '_ {
        let (a, b) = Self::hash_pair(item);
        (0..self.num_hashes).map(move |i| {
            let combined = a.wrapping_add((i as u64).wrapping_mul(b));
            combined % self.num_bits
        })
    }

    /// Insert `item`. Returns `true` iff it was definitely not present
    /// before this call.
    pub fn add<T: Hash>(&self, item: &T) -> bool {
        let mut was_new = false;
        for idx in self.bit_indices(item).collect::<Vec<_>>() {
            let word = (idx / BITS_PER_WORD as u64) as usize;
            let bit = idx % BITS_PER_WORD as u64;
            let mask = 1u64 << bit;
            let prev = self.bits[word].fetch_or(mask, Ordering::AcqRel);
            if prev & mask == 0 {
                was_new = true;
            }
        }
        if was_new {
            self.approx_len.fetch_add(1, Ordering::Relaxed);
        }
        was_new
    }

    /// Test membership. Never returns `false` for an item that was
    /// previously added and not cleared.
    pub fn contains<T: Hash>(&self, item: &T) -> bool {
        self.bit_indices(item).all(|idx| {
            let word = (idx / BITS_PER_WORD as u64) as usize;
            let bit = idx % BITS_PER_WORD as u64;
            let mask = 1u64 << bit;
            self.bits[word].load(Ordering::Acquire) & mask != 0
        })
    }

    /// Approximate count of distinct elements inserted so far.
    pub fn len(&self) -> usize {
        self.approx_len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of bits currently set, in `[0, 1]`.
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self
            .bits
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum();
        set as f64 / self.num_bits as f64
    }

    /// Clear every bit and reset the approximate count.
    pub fn clear(&self) {
        for word in &self.bits {
            word.store(0, Ordering::Release);
        }
        self.approx_len.store(0, Ordering::Relaxed);
    }
}
