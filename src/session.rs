//! Drives one end-to-end streaming run: resolves the commit range, plans
//! chunk boundaries, feeds each chunk through the coordinator into the
//! runner's analyzers, and checkpoints between chunks — including the
//! streaming planner's double-buffered prefetch (`spec.md` §4.12).

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analyzer::Analyzer;
use crate::artifact::CommitArtifact;
use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::errors::CoreError;
use crate::hash::ObjectHash;
use crate::planner::{Chunk, PipelineOverhead, StreamingPlanner, PREFETCH_DRAIN_CEILING};
use crate::runner::Runner;
use crate::store::{CommitRef, LogOptions, ObjectStore};

type ChunkArtifacts = Vec<Result<CommitArtifact, CoreError>>;

/// Owns one run's coordinator, runner, chunk plan, and checkpoint manager.
pub struct Session<S: ObjectStore + 'static> {
    config: Config,
    coordinator: Coordinator<S>,
    runner: Runner,
    planner: StreamingPlanner,
    checkpoint: Option<CheckpointManager>,
    /// The repository path doubles as the checkpoint manifest's identity key
    /// — stable across runs against the same repository, and trivially
    /// available without hashing repository contents.
    repo_hash: String,
    commits: Vec<CommitRef>,
}

impl<S: ObjectStore + 'static> Session<S> {
    /// Resolve the commit range under `opts`, build the chunk plan from
    /// `config` and the analyzers' declared growth estimates, and construct
    /// the coordinator and runner. Does not run anything yet.
    pub async fn new(
        repo_path: impl Into<String>,
        config: Config,
        opts: LogOptions,
        analyzers: Vec<Box<dyn Analyzer>>,
        cancel: CancellationToken,
    ) -> Result<Self, CoreError> {
        let repo_path = repo_path.into();
        let handle = S::open(&repo_path).await?;
        let commits = S::log(&handle, &opts).await?;
        drop(handle);

        let coordinator = Coordinator::<S>::new(&repo_path, &config, cancel).await?;

        let growth_per_commit_bytes: usize = analyzers
            .iter()
            .map(|a| {
                a.state_growth_per_commit_bytes()
                    .unwrap_or(config.default_growth_per_commit_bytes)
            })
            .sum();
        let overhead = PipelineOverhead::estimate(&config);
        let budget = config.memory_budget.unwrap_or(usize::MAX / 4);
        let planner = StreamingPlanner::new(commits.len(), budget, overhead, growth_per_commit_bytes)?;

        let runner = Runner::new(analyzers, config.fork_width);
        let checkpoint = config
            .checkpoint_dir
            .as_ref()
            .map(|dir| CheckpointManager::new(dir.clone()));

        Ok(Self {
            config,
            coordinator,
            runner,
            planner,
            checkpoint,
            repo_hash: repo_path,
            commits,
        })
    }

    pub fn chunks(&self) -> &[Chunk] {
        self.planner.chunks()
    }

    pub fn is_double_buffered(&self) -> bool {
        self.planner.is_double_buffered()
    }

    /// Run every remaining chunk (resuming from a checkpoint if one
    /// validates) and return each analyzer's final report.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<HashMap<String, serde_json::Value>, CoreError> {
        self.runner.initialize().await?;

        let start_chunk = self
            .checkpoint
            .as_ref()
            .and_then(|cp| cp.try_resume(&self.repo_hash, self.runner.analyzers_mut()));
        if start_chunk.is_some() {
            self.runner.boot_all()?;
        }
        let start_chunk = start_chunk.unwrap_or(0);

        let chunks = self.planner.chunks().to_vec();
        let double_buffered = self.planner.is_double_buffered();
        let mut prefetch: Option<JoinHandle<Result<ChunkArtifacts, CoreError>>> = None;

        for (i, chunk) in chunks.iter().enumerate() {
            if i < start_chunk || chunk.is_empty() {
                continue;
            }

            let commit_rx = if let Some(task) = prefetch.take() {
                let artifacts = await_prefetch(task).await?;
                replay_into_channel(artifacts)
            } else {
                self.coordinator.run_commits(
                    self.commits[chunk.start..chunk.end].to_vec(),
                    chunk.start,
                    self.config.commit_batch_size,
                    self.config.resolved_buffer_size(),
                    cancel.clone(),
                )
            };

            // Kick off the next chunk's prefetch now, so its pipeline runs
            // concurrently with this chunk's analyzer consumption below.
            if double_buffered {
                if let Some(next) = chunks.get(i + 1).copied() {
                    prefetch = Some(self.spawn_prefetch(next, cancel.clone()));
                }
            }

            self.runner
                .process_chunk(commit_rx, chunk.start, chunk.chunk_id)
                .await?;

            self.runner.hibernate_all()?;
            if let Some(cp) = &self.checkpoint {
                let last_commit_hash = self
                    .commits
                    .get(chunk.end.saturating_sub(1))
                    .map(|c| c.hash)
                    .unwrap_or(ObjectHash::ZERO);
                cp.save(
                    &self.repo_hash,
                    self.runner.analyzers(),
                    i + 1,
                    chunks.len(),
                    chunk.end,
                    last_commit_hash,
                )?;
            }
            self.runner.boot_all()?;
        }

        if let Some(task) = prefetch.take() {
            // No further chunk wants this buffer (the plan ended early or the
            // last chunk started one anyway); drain it so the task doesn't
            // outlive the run, bounded so shutdown can't hang on it.
            let _ = tokio::time::timeout(PREFETCH_DRAIN_CEILING, task).await;
        }

        self.runner.finalize_with_aggregators().await
    }

    /// Spawn a background task that drives `chunk`'s full pipeline to
    /// completion and buffers its artifacts in commit order, sharing this
    /// session's worker pool, watchdog, and caches via the coordinator's
    /// cheap clone.
    fn spawn_prefetch(
        &self,
        chunk: Chunk,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<ChunkArtifacts, CoreError>> {
        let coordinator = self.coordinator.clone();
        let commits = self.commits[chunk.start..chunk.end].to_vec();
        let batch_size = self.config.commit_batch_size;
        let buffer_size = self.config.resolved_buffer_size();

        tokio::spawn(async move {
            let mut rx =
                coordinator.run_commits(commits, chunk.start, batch_size, buffer_size, cancel);
            let mut buffered = Vec::new();
            while let Some(artifact) = rx.recv().await {
                buffered.push(artifact);
            }
            Ok(buffered)
        })
    }
}

async fn await_prefetch(
    task: JoinHandle<Result<ChunkArtifacts, CoreError>>,
) -> Result<ChunkArtifacts, CoreError> {
    task.await
        .map_err(|e| CoreError::ObjectStore(format!("prefetch task panicked: {e}")))?
}

/// Replay an already-materialized buffer of artifacts back onto a channel so
/// `Runner::process_chunk` can consume it the same way it consumes a live
/// pipeline's receiver.
fn replay_into_channel(
    artifacts: ChunkArtifacts,
) -> mpsc::Receiver<Result<CommitArtifact, CoreError>> {
    let (tx, rx) = mpsc::channel(artifacts.len().max(1));
    tokio::spawn(async move {
        for artifact in artifacts {
            if tx.send(artifact).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::tests::CountingAnalyzer;
    use crate::hash::ObjectHash;
    use crate::store::tests::{install_fixture, MemoryStore};
    use crate::store::{Change, PathHash};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn commit(i: u8) -> CommitRef {
        CommitRef {
            hash: ObjectHash::new([i; 20]),
            parent_count: if i == 0 { 0 } else { 1 },
            committer_timestamp: i as i64,
        }
    }

    fn seeded_store(n: u8) -> MemoryStore {
        let mut store = MemoryStore::default();
        store.commits = (0..n).map(commit).collect();
        for i in 0..n {
            let hash = ObjectHash::new([100 + i; 20]);
            let change = Change::insert(PathHash {
                path: format!("f{i}.txt"),
                hash,
            });
            store
                .tree_diffs
                .insert(commit(i).hash, (vec![change], ObjectHash::new([150 + i; 20])));
            store.blobs.insert(hash, format!("data{i}").into_bytes());
        }
        store
    }

    #[tokio::test]
    async fn single_pass_and_chunked_runs_see_every_commit_once() {
        let repo_path = "/tmp/fixture-session-chunked";
        install_fixture(repo_path, seeded_store(10));

        let count = Arc::new(AtomicUsize::new(0));
        let analyzers: Vec<Box<dyn Analyzer>> = vec![Box::new(CountingAnalyzer {
            name: "counter".into(),
            count: count.clone(),
        })];

        let config = Config {
            workers: Some(2),
            commit_batch_size: 4,
            blob_cache_size: 1_000_000,
            diff_cache_size: 100,
            memory_budget: None,
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let mut session = Session::<MemoryStore>::new(
            repo_path,
            config,
            LogOptions::default(),
            analyzers,
            cancel.clone(),
        )
        .await
        .unwrap();

        let reports = session.run(cancel).await.unwrap();
        assert_eq!(reports["counter"]["consumed"], 10);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn double_buffered_run_still_processes_every_commit_in_order() {
        let repo_path = "/tmp/fixture-session-double-buffered";
        install_fixture(repo_path, seeded_store(500));

        let count = Arc::new(AtomicUsize::new(0));
        let analyzers: Vec<Box<dyn Analyzer>> = vec![Box::new(CountingAnalyzer {
            name: "counter".into(),
            count: count.clone(),
        })];

        // Sized so the chunk plan lands on exactly two chunks while still
        // qualifying for double buffering (budget >= overhead + 2 * min
        // chunk bytes) — see the math behind these constants in the
        // streaming-planner test suite.
        let config = Config {
            workers: Some(2),
            commit_batch_size: 50,
            blob_cache_size: 100_000,
            diff_cache_size: 100,
            blob_arena_size: 4096,
            memory_budget: Some(1_210_000),
            default_growth_per_commit_bytes: 2_000,
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let mut session = Session::<MemoryStore>::new(
            repo_path,
            config,
            LogOptions::default(),
            analyzers,
            cancel.clone(),
        )
        .await
        .unwrap();
        assert!(session.is_double_buffered());
        assert!(session.chunks().len() >= 2);

        let reports = session.run(cancel).await.unwrap();
        assert_eq!(reports["counter"]["consumed"], 500);
        assert_eq!(count.load(Ordering::SeqCst), 500);
    }

    /// A checkpointable analyzer that round-trips its count through
    /// `bincode`, local to this module to avoid reaching into another
    /// module's private test fixtures.
    struct CheckpointableCounter {
        name: String,
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Analyzer for CheckpointableCounter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn consume(&mut self, _artifact: &CommitArtifact) -> Result<(), CoreError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn finalize(&mut self) -> Result<serde_json::Value, CoreError> {
            Ok(serde_json::json!({ "consumed": self.count.load(Ordering::SeqCst) }))
        }

        fn is_checkpointable(&self) -> bool {
            true
        }

        fn save_checkpoint(&self, dir: &std::path::Path) -> Result<(), CoreError> {
            let bytes = bincode::serde::encode_to_vec(
                self.count.load(Ordering::SeqCst),
                bincode::config::standard(),
            )
            .map_err(|e| CoreError::CheckpointInvalid(e.to_string()))?;
            std::fs::write(dir.join(format!("{}.bin", self.name)), bytes)?;
            Ok(())
        }

        fn load_checkpoint(&mut self, dir: &std::path::Path) -> Result<(), CoreError> {
            let bytes = std::fs::read(dir.join(format!("{}.bin", self.name)))?;
            let (restored, _): (usize, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| CoreError::CheckpointInvalid(e.to_string()))?;
            self.count.store(restored, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn checkpointed_run_resumes_from_the_saved_chunk() {
        let repo_path = "/tmp/fixture-session-checkpoint";
        install_fixture(repo_path, seeded_store(12));

        let dir = std::env::temp_dir().join(format!(
            "repomine-session-checkpoint-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);

        let config = Config {
            workers: Some(1),
            commit_batch_size: 3,
            blob_cache_size: 1_000_000,
            diff_cache_size: 100,
            checkpoint_dir: Some(dir.to_string_lossy().into_owned()),
            ..Default::default()
        };

        // First run processes and consumes every commit, checkpointing after
        // its (single) chunk.
        let first_count = Arc::new(AtomicUsize::new(0));
        let first_analyzers: Vec<Box<dyn Analyzer>> = vec![Box::new(CheckpointableCounter {
            name: "counter".into(),
            count: first_count.clone(),
        })];
        let cancel = CancellationToken::new();
        let mut first_session = Session::<MemoryStore>::new(
            repo_path,
            config.clone(),
            LogOptions::default(),
            first_analyzers,
            cancel.clone(),
        )
        .await
        .unwrap();
        let reports = first_session.run(cancel.clone()).await.unwrap();
        assert_eq!(reports["counter"]["consumed"], 12);

        // A second session, built with a fresh (zeroed) analyzer instance,
        // resumes past the completed run entirely: `load_checkpoint`
        // restores the prior count without re-consuming any commit.
        let second_count = Arc::new(AtomicUsize::new(0));
        let second_analyzers: Vec<Box<dyn Analyzer>> = vec![Box::new(CheckpointableCounter {
            name: "counter".into(),
            count: second_count.clone(),
        })];
        let mut second_session = Session::<MemoryStore>::new(
            repo_path,
            config,
            LogOptions::default(),
            second_analyzers,
            cancel.clone(),
        )
        .await
        .unwrap();
        let reports = second_session.run(cancel).await.unwrap();
        assert_eq!(reports["counter"]["consumed"], 12);
        assert_eq!(second_count.load(Ordering::SeqCst), 12);

        std::fs::remove_dir_all(&dir).ok();
    }
}
