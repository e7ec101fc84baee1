//! Cross-commit caches: a byte-bounded blob LRU with a Bloom pre-filter and
//! cost-aware eviction, and a bounded-entry diff-result LRU.

pub mod blob_lru;
pub mod diff_cache;

pub use blob_lru::BlobLruCache;
pub use diff_cache::DiffCache;

/// Hit/miss counters shared by both caches' stats snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups short-circuited by a Bloom pre-filter before any lock was
    /// taken. Always zero for caches without a pre-filter (the diff cache).
    pub bloom_filtered: u64,
}
