//! A cuckoo filter: a bucket table supporting deletion via 16-bit
//! fingerprints placed in one of two candidate buckets.

use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::errors::CoreError;

/// Entries per bucket.
const BUCKET_SIZE: usize = 4;
/// Maximum number of evictions attempted before an insert gives up.
const MAX_KICKS: u32 = 500;
/// Fixed seed for the eviction PRNG, so kick sequences (and therefore which
/// entries end up where) are reproducible across runs.
const EVICTION_SEED: u64 = 0x5EED_CAFE_u64;

type Bucket = [u16; BUCKET_SIZE];

struct Table {
    buckets: Vec<Bucket>,
    count: usize,
}

/// A fixed-capacity cuckoo filter.
///
/// `insert` returns `false` when 500 kicks fail to find a free slot; the
/// table's existing entries remain fully findable even after a failed
/// insert (kicks only relocate entries between their two valid buckets,
/// never outside that pair).
pub struct CuckooFilter {
    num_buckets: usize,
    table: RwLock<Table>,
    rng: RwLock<SmallRng>,
}

impl CuckooFilter {
    /// Construct a filter sized to hold roughly `expected_elements` items at
    /// ~50% load factor. Buckets are rounded up to a power of two and then
    /// doubled to reach that target load.
    pub fn new(expected_elements: usize) -> Result<Self, CoreError> {
        if expected_elements == 0 {
            return Err(CoreError::ConfigInvalid(
                "cuckoo filter expected_elements must be greater than zero".into(),
            ));
        }
        let entries_needed = expected_elements.div_ceil(BUCKET_SIZE).max(1);
        let num_buckets = (entries_needed.next_power_of_two() * 2).max(2);

        Ok(Self {
            num_buckets,
            table: RwLock::new(Table {
                buckets: vec![[0u16; BUCKET_SIZE]; num_buckets],
                count: 0,
            }),
            rng: RwLock::new(SmallRng::seed_from_u64(EVICTION_SEED)),
        })
    }

    fn hash64<T: Hash>(item: &T) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        item.hash(&mut hasher);
        hasher.finish()
    }

    fn mask(&self) -> usize {
        self.num_buckets - 1
    }

    fn primary_index<T: Hash>(&self, item: &T) -> usize {
        Self::hash64(item) as usize & self.mask()
    }

    /// Non-zero 16-bit fingerprint for `item`. Zero is reserved to mean
    /// "empty slot", so a zero result is remapped to 1.
    fn fingerprint<T: Hash>(&self, item: &T) -> u16 {
        let h = Self::hash64(item);
        let fp = ((h >> 32) ^ h) as u16;
        if fp == 0 { 1 } else { fp }
    }

    /// The bucket symmetric to `index` for `fingerprint`: applying this
    /// twice with the same fingerprint returns the original index.
    pub fn alt_index(&self, index: usize, fingerprint: u16) -> usize {
        let fp_hash = Self::hash64(&fingerprint) as usize & self.mask();
        index ^ fp_hash
    }

    /// Insert `item`. Returns `false` if 500 kicks failed to place it.
    pub fn insert<T: Hash>(&self, item: &T) -> bool {
        let fp = self.fingerprint(item);
        let i1 = self.primary_index(item);
        let i2 = self.alt_index(i1, fp);

        let mut table = self.table.write().unwrap();
        if Self::try_place(&mut table.buckets[i1], fp) || Self::try_place(&mut table.buckets[i2], fp)
        {
            table.count += 1;
            return true;
        }

        let mut current_index = if self.coin_flip() { i1 } else { i2 };
        let mut current_fp = fp;
        for _ in 0..MAX_KICKS {
            let victim_slot = self.random_slot();
            let victim_fp = table.buckets[current_index][victim_slot];
            table.buckets[current_index][victim_slot] = current_fp;
            current_fp = victim_fp;
            current_index = self.alt_index(current_index, current_fp);
            if Self::try_place(&mut table.buckets[current_index], current_fp) {
                table.count += 1;
                return true;
            }
        }
        false
    }

    fn try_place(bucket: &mut Bucket, fp: u16) -> bool {
        for slot in bucket.iter_mut() {
            if *slot == 0 {
                *slot = fp;
                return true;
            }
        }
        false
    }

    fn coin_flip(&self) -> bool {
        self.rng.write().unwrap().gen_bool(0.5)
    }

    fn random_slot(&self) -> usize {
        self.rng.write().unwrap().gen_range(0..BUCKET_SIZE)
    }

    /// Test membership.
    pub fn lookup<T: Hash>(&self, item: &T) -> bool {
        let fp = self.fingerprint(item);
        let i1 = self.primary_index(item);
        let i2 = self.alt_index(i1, fp);
        let table = self.table.read().unwrap();
        table.buckets[i1].contains(&fp) || table.buckets[i2].contains(&fp)
    }

    /// Remove one occurrence of `item`. Returns whether it was found.
    pub fn delete<T: Hash>(&self, item: &T) -> bool {
        let fp = self.fingerprint(item);
        let i1 = self.primary_index(item);
        let i2 = self.alt_index(i1, fp);
        let mut table = self.table.write().unwrap();
        for idx in [i1, i2] {
            if let Some(slot) = table.buckets[idx].iter_mut().find(|s| **s == fp) {
                *slot = 0;
                table.count -= 1;
                return true;
            }
        }
        false
    }

    pub fn count(&self) -> usize {
        self.table.read().unwrap().count
    }

    /// Remove every entry.
    pub fn reset(&self) {
        let mut table = self.table.write().unwrap();
        for bucket in table.buckets.iter_mut() {
            *bucket = [0u16; BUCKET_SIZE];
        }
        table.count = 0;
    }

    pub fn load_factor(&self) -> f64 {
        self.count() as f64 / self.capacity() as f64
    }

    pub fn capacity(&self) -> usize {
        self.num_buckets * BUCKET_SIZE
    }
}
