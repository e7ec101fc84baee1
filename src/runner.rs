//! Drives a chunk's worth of `CommitArtifact`s into the registered
//! analyzers, handling fork/merge for the ones that declare themselves
//! data-parallel.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tokio::sync::mpsc;

use crate::analyzer::Analyzer;
use crate::artifact::CommitArtifact;
use crate::errors::CoreError;

fn wrap(name: &str, cause: CoreError) -> CoreError {
    match cause {
        CoreError::AnalyzerFailure { .. } => cause,
        other => CoreError::AnalyzerFailure {
            name: name.to_string(),
            cause: other.to_string(),
        },
    }
}

/// Stable partition of a commit hash into `[0, k)`, used to dispatch commits
/// to forked analyzer branches while preserving each branch's relative order.
fn partition_index(hash: &crate::hash::ObjectHash, k: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    hash.hash(&mut hasher);
    (hasher.finish() % k as u64) as usize
}

/// Owns the analyzer roster across an entire run and routes chunks to it.
pub struct Runner {
    analyzers: Vec<Box<dyn Analyzer>>,
    fork_width: usize,
}

impl Runner {
    pub fn new(analyzers: Vec<Box<dyn Analyzer>>, fork_width: usize) -> Self {
        Self {
            analyzers,
            fork_width: fork_width.max(1),
        }
    }

    pub fn analyzers(&self) -> &[Box<dyn Analyzer>] {
        &self.analyzers
    }

    pub fn analyzers_mut(&mut self) -> &mut [Box<dyn Analyzer>] {
        &mut self.analyzers
    }

    pub async fn initialize(&mut self) -> Result<(), CoreError> {
        for analyzer in &mut self.analyzers {
            let name = analyzer.name().to_string();
            analyzer.initialize().await.map_err(|e| wrap(&name, e))?;
        }
        Ok(())
    }

    /// Drain `artifact_rx` (from the coordinator) for one chunk and route
    /// every artifact to every analyzer, in commit order. Returns the number
    /// of commits processed.
    ///
    /// Non-forked analyzers consume each artifact as it arrives off the
    /// channel, so the bounded channel's back-pressure actually reaches the
    /// pipeline: a slow analyzer stalls `recv().await`, which stalls the
    /// producers upstream. Forked analyzers are the one exception — hash
    /// partitioning needs the whole chunk up front to assign commits to
    /// branches, so only their input is buffered.
    pub async fn process_chunk(
        &mut self,
        mut artifact_rx: mpsc::Receiver<Result<CommitArtifact, CoreError>>,
        _start_index: usize,
        _chunk_id: usize,
    ) -> Result<usize, CoreError> {
        let forked: Vec<bool> = self
            .analyzers
            .iter()
            .map(|a| a.capabilities().parallelizable && self.fork_width > 1)
            .collect();
        let any_forked = forked.iter().any(|&f| f);

        let mut forked_buffer = Vec::new();
        let mut processed = 0usize;

        while let Some(artifact) = artifact_rx.recv().await {
            let artifact = artifact?;
            processed += 1;

            for (analyzer, &is_forked) in self.analyzers.iter_mut().zip(forked.iter()) {
                if is_forked {
                    continue;
                }
                let name = analyzer.name().to_string();
                analyzer
                    .consume(&artifact)
                    .await
                    .map_err(|e| wrap(&name, e))?;
            }

            if any_forked {
                forked_buffer.push(artifact);
            }
        }

        for (analyzer, &is_forked) in self.analyzers.iter_mut().zip(forked.iter()) {
            if is_forked {
                run_forked(analyzer, &forked_buffer, self.fork_width).await?;
            }
        }

        Ok(processed)
    }

    /// Compact transient state between chunks, per analyzer.
    pub fn hibernate_all(&mut self) -> Result<(), CoreError> {
        for analyzer in &mut self.analyzers {
            let name = analyzer.name().to_string();
            analyzer.hibernate().map_err(|e| wrap(&name, e))?;
        }
        Ok(())
    }

    /// Restore from hibernation before the next chunk, per analyzer.
    pub fn boot_all(&mut self) -> Result<(), CoreError> {
        for analyzer in &mut self.analyzers {
            let name = analyzer.name().to_string();
            analyzer.boot().map_err(|e| wrap(&name, e))?;
        }
        Ok(())
    }

    /// Invoke `finalize` on every analyzer and collect their reports.
    pub async fn finalize_with_aggregators(
        &mut self,
    ) -> Result<HashMap<String, serde_json::Value>, CoreError> {
        let mut reports = HashMap::new();
        for analyzer in &mut self.analyzers {
            let name = analyzer.name().to_string();
            let report = analyzer.finalize().await.map_err(|e| wrap(&name, e))?;
            reports.insert(name, report);
        }
        Ok(reports)
    }
}

/// Fork `analyzer` into `k` worker-local instances, dispatch `artifacts` to
/// them by `hash(commit) % k` (preserving each branch's relative order), run
/// the branches concurrently, and merge them back into `analyzer`.
async fn run_forked(
    analyzer: &mut Box<dyn Analyzer>,
    artifacts: &[CommitArtifact],
    k: usize,
) -> Result<(), CoreError> {
    let name = analyzer.name().to_string();
    let branches = analyzer.fork(k).ok_or_else(|| CoreError::AnalyzerFailure {
        name: name.clone(),
        cause: "analyzer declared parallelizable but fork() returned None".into(),
    })?;

    let mut partitions: Vec<Vec<CommitArtifact>> = (0..k).map(|_| Vec::new()).collect();
    for artifact in artifacts {
        let bucket = partition_index(&artifact.commit.hash, k);
        partitions[bucket].push(artifact.clone());
    }

    let mut handles = Vec::with_capacity(k);
    for (mut branch, partition) in branches.into_iter().zip(partitions.into_iter()) {
        handles.push(tokio::spawn(async move {
            for artifact in &partition {
                branch.consume(artifact).await?;
            }
            Ok::<Box<dyn Analyzer>, CoreError>(branch)
        }));
    }

    let mut merged = Vec::with_capacity(k);
    for handle in handles {
        let branch = handle.await.map_err(|e| CoreError::AnalyzerFailure {
            name: name.clone(),
            cause: format!("forked branch task panicked: {e}"),
        })??;
        merged.push(branch);
    }

    analyzer.merge(merged).await.map_err(|e| wrap(&name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::CountingAnalyzer;
    use crate::hash::ObjectHash;
    use crate::store::CommitRef;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn artifact(i: u8) -> CommitArtifact {
        CommitArtifact {
            commit: CommitRef {
                hash: ObjectHash::new([i; 20]),
                parent_count: 1,
                committer_timestamp: i as i64,
            },
            index: i as usize,
            changes: vec![],
            blob_map: Default::default(),
            file_diffs: Default::default(),
            error: None,
        }
    }

    #[tokio::test]
    async fn process_chunk_routes_every_artifact_to_every_analyzer() {
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        let analyzers: Vec<Box<dyn Analyzer>> = vec![
            Box::new(CountingAnalyzer {
                name: "a".into(),
                count: count_a.clone(),
            }),
            Box::new(CountingAnalyzer {
                name: "b".into(),
                count: count_b.clone(),
            }),
        ];
        let mut runner = Runner::new(analyzers, 1);

        let (tx, rx) = mpsc::channel(8);
        for i in 0..5u8 {
            tx.send(Ok(artifact(i))).await.unwrap();
        }
        drop(tx);

        let processed = runner.process_chunk(rx, 0, 0).await.unwrap();
        assert_eq!(processed, 5);
        assert_eq!(count_a.load(Ordering::SeqCst), 5);
        assert_eq!(count_b.load(Ordering::SeqCst), 5);

        let reports = runner.finalize_with_aggregators().await.unwrap();
        assert_eq!(reports["a"]["consumed"], 5);
        assert_eq!(reports["b"]["consumed"], 5);
    }

    /// A parallelizable leaf that sums up the `committer_timestamp` of every
    /// artifact it sees; `merge` adds the forked branches' partial sums.
    struct SummingAnalyzer {
        total: i64,
    }

    #[async_trait]
    impl Analyzer for SummingAnalyzer {
        fn name(&self) -> &str {
            "summer"
        }

        fn capabilities(&self) -> crate::analyzer::AnalyzerCapabilities {
            crate::analyzer::AnalyzerCapabilities {
                parallelizable: true,
                ..Default::default()
            }
        }

        async fn consume(&mut self, artifact: &CommitArtifact) -> Result<(), CoreError> {
            self.total += artifact.commit.committer_timestamp;
            Ok(())
        }

        async fn finalize(&mut self) -> Result<serde_json::Value, CoreError> {
            Ok(serde_json::json!({ "total": self.total }))
        }

        fn fork(&self, n: usize) -> Option<Vec<Box<dyn Analyzer>>> {
            Some((0..n).map(|_| Box::new(SummingAnalyzer { total: 0 }) as Box<dyn Analyzer>).collect())
        }

        async fn merge(&mut self, branches: Vec<Box<dyn Analyzer>>) -> Result<(), CoreError> {
            for mut branch in branches {
                // Downcasting a `Box<dyn Analyzer>` would need `Any`; instead
                // recover each branch's partial sum through its own report
                // convention.
                let report = branch.finalize().await?;
                self.total += report["total"].as_i64().unwrap_or(0);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn forked_leaf_merges_partial_sums_correctly() {
        let analyzers: Vec<Box<dyn Analyzer>> = vec![Box::new(SummingAnalyzer { total: 0 })];
        let mut runner = Runner::new(analyzers, 3);

        let (tx, rx) = mpsc::channel(8);
        let mut expected = 0i64;
        for i in 0..9u8 {
            expected += i as i64;
            tx.send(Ok(artifact(i))).await.unwrap();
        }
        drop(tx);

        runner.process_chunk(rx, 0, 0).await.unwrap();
        let reports = runner.finalize_with_aggregators().await.unwrap();
        assert_eq!(reports["summer"]["total"], expected);
    }
}
