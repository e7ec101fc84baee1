//! The `Analyzer` plugin contract the Runner drives per commit artifact.
//!
//! Mirrors the `async_trait` idiom this crate already uses for `ObjectStore`
//! (`src/store.rs`) — the teacher crate has no equivalent plugin seam, so the
//! shape is grounded on this crate's own external-interface convention
//! rather than borrowed from elsewhere.

use std::path::Path;

use async_trait::async_trait;

use crate::artifact::CommitArtifact;
use crate::errors::CoreError;

/// Capability flags the Runner consults when scheduling an analyzer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzerCapabilities {
    /// Must run on the main sequential task; never forked.
    pub sequential_only: bool,
    /// Expensive per-commit work; a hint for schedulers, not enforced here.
    pub cpu_heavy: bool,
    /// Supports `fork`/`merge` for hash-mod-K data-parallel consumption.
    pub parallelizable: bool,
}

/// A pluggable unit of per-commit analysis. Some analyzers are "core"
/// (produce plumbing state consumed by others via shared context outside
/// this trait); some are "leaf" (emit a final report from `finalize`).
#[async_trait]
pub trait Analyzer: Send {
    /// Stable identifier used in checkpoint manifests and report keys.
    fn name(&self) -> &str;

    fn capabilities(&self) -> AnalyzerCapabilities {
        AnalyzerCapabilities::default()
    }

    /// Called once before the first `consume`.
    async fn initialize(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Called once per commit artifact, in commit order.
    async fn consume(&mut self, artifact: &CommitArtifact) -> Result<(), CoreError>;

    /// Called once after the last chunk; produces this analyzer's report.
    async fn finalize(&mut self) -> Result<serde_json::Value, CoreError>;

    /// Compact transient state between chunks. Default is a no-op (nothing
    /// to compact).
    fn hibernate(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Restore from a hibernated state. Default is a no-op.
    fn boot(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Whether this analyzer participates in checkpointing. The checkpoint
    /// manager disables itself entirely unless every registered analyzer
    /// returns `true` here.
    fn is_checkpointable(&self) -> bool {
        false
    }

    fn save_checkpoint(&self, _dir: &Path) -> Result<(), CoreError> {
        Ok(())
    }

    fn load_checkpoint(&mut self, _dir: &Path) -> Result<(), CoreError> {
        Ok(())
    }

    /// Estimated bytes of internal state growth per consumed commit, used by
    /// the streaming planner to size chunks. `None` means "unknown", and the
    /// planner falls back to its configured default estimate.
    fn state_growth_per_commit_bytes(&self) -> Option<usize> {
        None
    }

    /// Split into `n` worker-local instances for data-parallel consumption.
    /// Only called when `capabilities().parallelizable` is true. Returning
    /// `None` means this analyzer does not actually support forking despite
    /// the flag (treated as a configuration error by the Runner).
    fn fork(&self, _n: usize) -> Option<Vec<Box<dyn Analyzer>>> {
        None
    }

    /// Merge forked branches back into `self` at chunk end, single-threaded.
    async fn merge(&mut self, _branches: Vec<Box<dyn Analyzer>>) -> Result<(), CoreError> {
        Ok(())
    }
}
