//! Runtime configuration for the streaming analysis core.
//!
//! Every option in `spec.md` §6's configuration table has a field here.
//! Sizes are already-resolved byte/entry counts — parsing a humanized size
//! string like `"4G"` is a thin helper excluded from this crate's scope; a
//! caller-side CLI is expected to do that conversion before constructing a
//! `Config`.

use serde::{Deserialize, Serialize};

/// Pipeline and resource-budget configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of pool workers. `None` resolves to `ceil(0.60 * logical_cpus)`
    /// at worker-pool construction time.
    pub workers: Option<usize>,
    /// Pipeline queue depth. `None` resolves to `2 * workers`.
    pub buffer_size: Option<usize>,
    /// Commit streamer batch size.
    pub commit_batch_size: usize,
    /// Blob LRU cache byte budget. Zero disables the cache.
    pub blob_cache_size: usize,
    /// Diff LRU cache entry budget. Zero disables the cache.
    pub diff_cache_size: usize,
    /// Per-batch blob-load arena size in bytes.
    pub blob_arena_size: usize,
    /// Overall memory budget driving the streaming planner. When set,
    /// overrides the cache/arena defaults above for planning purposes.
    pub memory_budget: Option<usize>,
    /// Collector aggressiveness percentage; 0 means "use the platform
    /// default". A no-op on platforms without a tunable collector.
    pub gc_percent: u32,
    /// Long-lived byte ballast allocation to smooth collector behavior.
    /// A no-op on platforms without a tracing GC.
    pub ballast_size: usize,
    /// Watchdog per-request timeout. `None` disables the watchdog.
    pub worker_timeout: Option<std::time::Duration>,
    /// Restrict the commit walk to first-parent history.
    pub first_parent: bool,
    /// Only include commits at or after this time (seconds since epoch).
    pub since: Option<i64>,
    /// Maximum number of commits to walk.
    pub limit: Option<usize>,
    /// Only walk the current HEAD, ignoring other refs.
    pub head_only: bool,
    /// Fan-out width for parallelizable analyzer leaves. 1 disables forking.
    pub fork_width: usize,
    /// Fallback per-commit state-growth estimate for analyzers that don't
    /// report `state_growth_per_commit_bytes()`.
    pub default_growth_per_commit_bytes: usize,
    /// Directory for checkpoint manifests and per-analyzer state. `None`
    /// disables checkpointing regardless of analyzer support.
    pub checkpoint_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: None,
            buffer_size: None,
            commit_batch_size: 100,
            blob_cache_size: 256 * 1024 * 1024,
            diff_cache_size: 10_000,
            blob_arena_size: 4 * 1024 * 1024,
            memory_budget: None,
            gc_percent: 0,
            ballast_size: 0,
            worker_timeout: None,
            first_parent: false,
            since: None,
            limit: None,
            head_only: false,
            fork_width: 1,
            default_growth_per_commit_bytes: 4 * 1024,
            checkpoint_dir: None,
        }
    }
}

impl Config {
    /// Resolve `workers`, defaulting to `ceil(0.60 * logical_cpus)` with a
    /// floor of 1 (per `spec.md` §4.8).
    pub fn resolved_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let cpus = num_cpus::get().max(1);
            ((cpus as f64) * 0.60).ceil() as usize
        }).max(1)
    }

    /// Resolve `buffer_size`, defaulting to `2 * workers`.
    pub fn resolved_buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or_else(|| 2 * self.resolved_workers())
    }

    /// Validate the configuration, surfacing `ConfigInvalid` for values the
    /// planner or caches could not act on.
    pub fn validate(&self) -> Result<(), crate::errors::CoreError> {
        if self.commit_batch_size == 0 {
            return Err(crate::errors::CoreError::ConfigInvalid(
                "commit_batch_size must be greater than zero".into(),
            ));
        }
        if self.workers == Some(0) {
            return Err(crate::errors::CoreError::ConfigInvalid(
                "workers must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_buffer_size_tracks_workers() {
        let cfg = Config {
            workers: Some(4),
            ..Default::default()
        };
        assert_eq!(cfg.resolved_buffer_size(), 8);
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let cfg = Config {
            commit_batch_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
