//! A blob cache bounded by total byte size, backed by a hash map plus an
//! arena-indexed doubly-linked list in recency order, pre-filtered by a
//! Bloom filter, evicted by a cost-aware (approximate LFU-weighted-by-size)
//! policy.
//!
//! The list is represented as a slab of nodes addressed by integer id
//! (`spec.md` §9 Design Notes) rather than `Rc<RefCell<_>>` pointers, so
//! splicing is O(1) without reference-counting cycles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::blob::CachedBlob;
use crate::cache::CacheStats;
use crate::hash::ObjectHash;
use crate::prob::BloomFilter;

/// Minimum number of elements a cache's Bloom pre-filter is sized for, even
/// when `max_size / average_expected_blob_size` would round lower.
const BLOOM_MIN_ELEMENTS: usize = 64;
/// Target false-positive rate for the pre-filter.
const BLOOM_FPR: f64 = 0.01;
/// How many tail-end (LRU) nodes cost-aware eviction samples per victim.
const EVICTION_SAMPLE: usize = 5;
/// Used to normalize size into the cost formula: `cost = access_count / max(size/1024, 1)`.
const COST_SIZE_UNIT: usize = 1024;

struct Node {
    hash: ObjectHash,
    blob: CachedBlob,
    size_bytes: usize,
    access_count: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner {
    map: HashMap<ObjectHash, usize>,
    nodes: Vec<Option<Node>>,
    free_list: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    current_size: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free_list: Vec::new(),
            head: None,
            tail: None,
            current_size: 0,
        }
    }

    fn alloc_node(&mut self, node: Node) -> usize {
        if let Some(id) = self.free_list.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn node(&self, id: usize) -> &Node {
        self.nodes[id].as_ref().expect("dangling node id")
    }

    fn node_mut(&mut self, id: usize) -> &mut Node {
        self.nodes[id].as_mut().expect("dangling node id")
    }

    fn unlink(&mut self, id: usize) {
        let (prev, next) = {
            let n = self.node(id);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let n = self.node_mut(id);
        n.prev = None;
        n.next = None;
    }

    fn push_front(&mut self, id: usize) {
        let old_head = self.head;
        {
            let n = self.node_mut(id);
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn move_to_front(&mut self, id: usize) {
        if self.head == Some(id) {
            return;
        }
        self.unlink(id);
        self.push_front(id);
    }

    fn remove(&mut self, id: usize) -> Node {
        self.unlink(id);
        let node = self.nodes[id].take().expect("dangling node id");
        self.free_list.push(id);
        self.map.remove(&node.hash);
        self.current_size -= node.size_bytes;
        node
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    /// Sample up to `EVICTION_SAMPLE` nodes walking back from the tail and
    /// evict the one with minimum `access_count / max(size/1024, 1)`.
    /// Returns `false` if the list was empty (nothing to evict).
    fn evict_one(&mut self) -> bool {
        let mut candidate: Option<usize> = self.tail;
        let mut best: Option<(usize, f64)> = None;
        for _ in 0..EVICTION_SAMPLE {
            let Some(id) = candidate else { break };
            let node = self.node(id);
            let cost = node.access_count as f64 / (node.size_bytes / COST_SIZE_UNIT).max(1) as f64;
            if best.map(|(_, c)| cost < c).unwrap_or(true) {
                best = Some((id, cost));
            }
            candidate = node.prev;
        }
        match best {
            Some((id, _)) => {
                self.remove(id);
                true
            }
            None => false,
        }
    }
}

/// A byte-bounded, Bloom-pre-filtered LRU cache mapping `ObjectHash` to
/// `CachedBlob`.
pub struct BlobLruCache {
    inner: RwLock<Inner>,
    bloom: BloomFilter,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    bloom_filtered: AtomicU64,
}

impl BlobLruCache {
    /// Build a cache bounded to `max_size` bytes. `average_expected_blob_size`
    /// sizes the Bloom pre-filter (`max_size / average_expected_blob_size`,
    /// floored at `BLOOM_MIN_ELEMENTS`). Bloom construction failure at this
    /// point (only possible for a zero-sized estimate) is a programmer error
    /// and panics, matching `spec.md` §4.3's "Failure semantics".
    pub fn new(max_size: usize, average_expected_blob_size: usize) -> Self {
        let expected = (max_size / average_expected_blob_size.max(1)).max(BLOOM_MIN_ELEMENTS);
        let bloom = BloomFilter::new(expected, BLOOM_FPR)
            .expect("blob cache bloom pre-filter sizing is a programmer error");
        Self {
            inner: RwLock::new(Inner::new()),
            bloom,
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bloom_filtered: AtomicU64::new(0),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn current_size(&self) -> usize {
        self.inner.read().unwrap().current_size
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bloom_filtered: self.bloom_filtered.load(Ordering::Relaxed),
        }
    }

    /// Look up `hash`. Short-circuits on a Bloom-filter miss without taking
    /// any lock.
    pub fn get(&self, hash: &ObjectHash) -> Option<CachedBlob> {
        if !self.bloom.contains(hash) {
            self.bloom_filtered.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut inner = self.inner.write().unwrap();
        self.get_locked(&mut inner, hash)
    }

    fn get_locked(&self, inner: &mut Inner, hash: &ObjectHash) -> Option<CachedBlob> {
        match inner.map.get(hash).copied() {
            Some(id) => {
                inner.node_mut(id).access_count += 1;
                inner.move_to_front(id);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(inner.node(id).blob.clone())
            }
            None => {
                // Bloom false positive.
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Batch lookup: the Bloom partition happens before any lock is taken,
    /// and only Bloom-positive candidates cross the lock boundary. Duplicate
    /// hashes in `hashes` are each looked up independently (no deduplication
    /// through the map), per the documented choice in `spec.md` §9.
    pub fn get_multi(&self, hashes: &[ObjectHash]) -> Vec<Option<CachedBlob>> {
        let candidate_flags: Vec<bool> = hashes.iter().map(|h| self.bloom.contains(h)).collect();
        let absent = candidate_flags.iter().filter(|c| !**c).count() as u64;
        if absent > 0 {
            self.bloom_filtered.fetch_add(absent, Ordering::Relaxed);
            self.misses.fetch_add(absent, Ordering::Relaxed);
        }

        let mut results = vec![None; hashes.len()];
        if candidate_flags.iter().any(|c| *c) {
            let mut inner = self.inner.write().unwrap();
            for (i, is_candidate) in candidate_flags.iter().enumerate() {
                if *is_candidate {
                    results[i] = self.get_locked(&mut inner, &hashes[i]);
                }
            }
        }
        results
    }

    /// Insert `blob` under `hash`. Silently does nothing if `blob` is `None`,
    /// empty, or larger than `max_size`. If the key already exists, bumps
    /// its access count and recency without replacing its bytes.
    pub fn put(&self, hash: ObjectHash, blob: Option<CachedBlob>) {
        let Some(blob) = blob else { return };
        if blob.is_empty() || blob.len() > self.max_size {
            return;
        }

        let mut inner = self.inner.write().unwrap();
        if let Some(&id) = inner.map.get(&hash) {
            inner.node_mut(id).access_count += 1;
            inner.move_to_front(id);
            return;
        }

        let new_size = blob.len();
        while inner.current_size + new_size > self.max_size && !inner.map.is_empty() {
            if !inner.evict_one() {
                break;
            }
        }
        if inner.current_size + new_size > self.max_size {
            // Emptying everything evictable still would not make room.
            return;
        }

        let node = Node {
            hash,
            blob: blob.clone(),
            size_bytes: new_size,
            access_count: 0,
            prev: None,
            next: None,
        };
        let id = inner.alloc_node(node);
        inner.push_front(id);
        inner.map.insert(hash, id);
        inner.current_size += new_size;
        self.bloom.add(&hash);
    }

    /// Drop every entry and reset the Bloom pre-filter, keeping them
    /// consistent per `spec.md` §3's invariant.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        *inner = Inner::new();
        self.bloom.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(data: &[u8]) -> CachedBlob {
        CachedBlob::new(ObjectHash::ZERO, data.to_vec())
    }

    fn hash(byte: u8) -> ObjectHash {
        ObjectHash::new([byte; 20])
    }

    #[test]
    fn bloom_short_circuits_most_absent_keys() {
        let cache = BlobLruCache::new(10_000 * 64, 64);
        for i in 0..10_000u32 {
            let mut h = [0u8; 20];
            h[0..4].copy_from_slice(&i.to_le_bytes());
            cache.put(ObjectHash::new(h), Some(blob(&[0u8; 64])));
        }

        let mut absent_probed = 0u64;
        for i in 0..10_000u32 {
            let mut h = [0xffu8; 20];
            h[0..4].copy_from_slice(&(i + 1_000_000).to_le_bytes());
            let key = ObjectHash::new(h);
            // 80% of probes target keys outside the preloaded range.
            if i % 5 != 0 {
                absent_probed += 1;
                cache.get(&key);
            }
        }

        let stats = cache.stats();
        assert!(
            stats.bloom_filtered as f64 >= 0.7 * absent_probed as f64,
            "bloom_filtered={} absent_probed={}",
            stats.bloom_filtered,
            absent_probed
        );
    }

    #[test]
    fn lru_eviction_respects_recency_bump() {
        let cache = BlobLruCache::new(100, 40);
        let h1 = hash(1);
        let h2 = hash(2);
        let h3 = hash(3);
        cache.put(h1, Some(blob(&[0u8; 40])));
        cache.put(h2, Some(blob(&[0u8; 40])));
        cache.get(&h2); // bump h2 to MRU
        cache.put(h3, Some(blob(&[0u8; 40])));

        assert!(cache.get(&h1).is_none(), "h1 should have been evicted");
        assert!(cache.get(&h2).is_some());
        assert!(cache.get(&h3).is_some());
    }

    #[test]
    fn clear_resets_bloom_too() {
        let cache = BlobLruCache::new(1024, 64);
        let h = hash(9);
        cache.put(h, Some(blob(b"hello")));
        cache.clear();
        assert!(cache.get(&h).is_none());
        assert_eq!(cache.stats().bloom_filtered, 1);
    }

    #[test]
    fn oversized_blob_is_silently_rejected() {
        let cache = BlobLruCache::new(10, 5);
        cache.put(hash(1), Some(blob(&[0u8; 100])));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn current_size_matches_sum_of_entries() {
        let cache = BlobLruCache::new(1000, 40);
        cache.put(hash(1), Some(blob(&[0u8; 30])));
        cache.put(hash(2), Some(blob(&[0u8; 20])));
        cache.put(hash(3), Some(blob(&[0u8; 10])));
        assert_eq!(cache.current_size(), 60);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn none_and_empty_blobs_are_ignored() {
        let cache = BlobLruCache::new(1000, 40);
        cache.put(hash(1), None);
        cache.put(hash(2), Some(blob(&[])));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn get_multi_partitions_before_locking_and_preserves_order() {
        let cache = BlobLruCache::new(1000, 40);
        let h1 = hash(1);
        let h2 = hash(2);
        cache.put(h1, Some(blob(b"one")));

        let results = cache.get_multi(&[h1, h2, hash(3)]);
        assert!(results[0].is_some());
        assert!(results[1].is_none());
        assert!(results[2].is_none());
    }
}
