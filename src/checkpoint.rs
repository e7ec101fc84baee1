//! Saves and restores per-analyzer state and chunk position between runs,
//! keyed by repository identity.
//!
//! The manifest is `serde_json` (human-inspectable, matching the teacher's
//! own choice of `serde_json` for metadata); each analyzer owns the format of
//! its own `<name>.bin` file written inside the checkpoint directory via
//! `save_checkpoint`/`load_checkpoint` — `bincode` is the expected choice
//! there, the same way the teacher's own object types derive
//! `bincode::{Encode, Decode}`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::analyzer::Analyzer;
use crate::errors::CoreError;
use crate::hash::ObjectHash;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub repo_hash: String,
    pub analyzer_names: Vec<String>,
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub processed_commits: usize,
    pub last_commit_hash: ObjectHash,
}

/// Owns a checkpoint directory for one repository.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn manifest_path(&self) -> PathBuf {
        self.dir.join("manifest.json")
    }

    /// Checkpointing only ever applies when every registered analyzer opts
    /// in; a mixed roster disables it entirely rather than checkpointing a
    /// subset.
    pub fn is_enabled(analyzers: &[Box<dyn Analyzer>]) -> bool {
        !analyzers.is_empty() && analyzers.iter().all(|a| a.is_checkpointable())
    }

    pub fn save(
        &self,
        repo_hash: &str,
        analyzers: &[Box<dyn Analyzer>],
        current_chunk: usize,
        total_chunks: usize,
        processed_commits: usize,
        last_commit_hash: ObjectHash,
    ) -> Result<(), CoreError> {
        if !Self::is_enabled(analyzers) {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        for analyzer in analyzers {
            analyzer.save_checkpoint(&self.dir)?;
        }
        let manifest = Manifest {
            repo_hash: repo_hash.to_string(),
            analyzer_names: analyzers.iter().map(|a| a.name().to_string()).collect(),
            current_chunk,
            total_chunks,
            processed_commits,
            last_commit_hash,
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(self.manifest_path(), bytes)?;
        Ok(())
    }

    /// Attempt to resume a prior run. Returns the next chunk index to
    /// process on success. Any mismatch or failure — missing manifest,
    /// `repo_hash`/`analyzer_names` skew, a checkpointable analyzer that
    /// can't restore — yields `None` rather than an error: per the spec, a
    /// broken resume always falls back to a fresh run rather than aborting.
    pub fn try_resume(&self, repo_hash: &str, analyzers: &mut [Box<dyn Analyzer>]) -> Option<usize> {
        if !Self::is_enabled(analyzers) {
            return None;
        }
        let bytes = std::fs::read(self.manifest_path()).ok()?;
        let manifest: Manifest = serde_json::from_slice(&bytes).ok()?;
        if manifest.repo_hash != repo_hash {
            return None;
        }
        let expected_names: Vec<String> =
            analyzers.iter().map(|a| a.name().to_string()).collect();
        if manifest.analyzer_names != expected_names {
            return None;
        }
        for analyzer in analyzers.iter_mut() {
            if analyzer.load_checkpoint(&self.dir).is_err() {
                return None;
            }
        }
        Some(manifest.current_chunk)
    }
}
