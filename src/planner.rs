//! Computes contiguous chunk boundaries over a commit sequence so that each
//! chunk's projected analyzer-state growth plus the pipeline's fixed
//! overhead stays within a memory budget.

use crate::errors::CoreError;

/// Minimum commits per chunk, floor enforced regardless of budget math, to
/// amortize per-chunk setup (worker spawn, handle open, cache warm-up).
pub const MIN_CHUNK_COMMITS: usize = 200;

/// One contiguous, half-open `[start, end)` slice of the overall commit
/// range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: usize,
    pub end: usize,
    pub chunk_id: usize,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Fixed, chunk-independent cost of running the pipeline: worker handles,
/// arenas, and the blob/diff caches. Computed once per run from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOverhead {
    pub bytes: usize,
}

impl PipelineOverhead {
    pub fn estimate(config: &crate::config::Config) -> Self {
        let workers = config.resolved_workers();
        let per_worker_arena = config.blob_arena_size;
        let bytes = workers
            .saturating_mul(per_worker_arena)
            .saturating_add(config.blob_cache_size)
            .saturating_add(config.diff_cache_size * 256);
        Self { bytes }
    }
}

/// Computes chunk boundaries for one run.
#[derive(Debug)]
pub struct StreamingPlanner {
    chunks: Vec<Chunk>,
    double_buffered: bool,
}

impl StreamingPlanner {
    /// Build a plan for `total_commits`, given the overall `memory_budget`,
    /// `pipeline_overhead`, and the worst-case per-commit aggregate growth
    /// across all registered analyzers (`growth_per_commit_bytes`, already
    /// summed — `None` per-analyzer estimates should be folded into a
    /// configured default by the caller before reaching here).
    pub fn new(
        total_commits: usize,
        memory_budget: usize,
        pipeline_overhead: PipelineOverhead,
        growth_per_commit_bytes: usize,
    ) -> Result<Self, CoreError> {
        let min_chunk_bytes =
            pipeline_overhead.bytes + MIN_CHUNK_COMMITS * growth_per_commit_bytes.max(1);
        if memory_budget < min_chunk_bytes {
            return Err(CoreError::ConfigInvalid(format!(
                "memory_budget {memory_budget} is too small to fit one minimum chunk of {MIN_CHUNK_COMMITS} commits ({min_chunk_bytes} bytes required)"
            )));
        }

        let double_buffered = memory_budget >= pipeline_overhead.bytes + 2 * min_chunk_bytes
            && total_commits > MIN_CHUNK_COMMITS;

        let effective_budget = if double_buffered {
            pipeline_overhead.bytes + (memory_budget - pipeline_overhead.bytes) / 2
        } else {
            memory_budget
        };

        let growth = growth_per_commit_bytes.max(1);
        let usable = effective_budget.saturating_sub(pipeline_overhead.bytes);
        let chunk_size = (usable / growth).max(MIN_CHUNK_COMMITS);

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut chunk_id = 0;
        while start < total_commits {
            let end = (start + chunk_size).min(total_commits);
            chunks.push(Chunk {
                start,
                end,
                chunk_id,
            });
            start = end;
            chunk_id += 1;
        }
        if chunks.is_empty() {
            chunks.push(Chunk {
                start: 0,
                end: 0,
                chunk_id: 0,
            });
        }

        Ok(Self {
            chunks,
            double_buffered,
        })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn is_double_buffered(&self) -> bool {
        self.double_buffered
    }
}

/// 30 s ceiling on draining an in-flight prefetch task at shutdown.
pub const PREFETCH_DRAIN_CEILING: std::time::Duration = std::time::Duration::from_secs(30);
