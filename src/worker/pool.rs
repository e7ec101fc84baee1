//! Two request channels shared by the pipeline stages: `sequential_channel`
//! for tree-diff (single worker, amortized tree reuse) and `pool_channel` for
//! blob/diff batches (N workers, no shared state).
//!
//! Workers are long-lived `tokio::task::spawn` tasks rather than a
//! synchronous thread pool, so every suspension point inside a request can
//! observe the pipeline's `CancellationToken` (`spec.md` §5) instead of
//! blocking a native OS thread uninterruptibly.

use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::diff_types::FileDiffResult;
use crate::errors::CoreError;
use crate::hash::ObjectHash;
use crate::store::{Change, ObjectStore};

/// A request handled by the single sequential worker.
pub enum SequentialRequest {
    TreeDiff {
        prev_tree: Option<ObjectHash>,
        commit: ObjectHash,
        respond_to: oneshot::Sender<Result<(Vec<Change>, ObjectHash), CoreError>>,
    },
}

/// A request handled by any pool worker.
pub enum PoolRequest {
    BlobBatch {
        hashes: Vec<ObjectHash>,
        respond_to: oneshot::Sender<Result<Vec<Option<Vec<u8>>>, CoreError>>,
    },
    DiffBatch {
        pairs: Vec<(ObjectHash, ObjectHash)>,
        respond_to: oneshot::Sender<Result<Vec<Result<FileDiffResult, CoreError>>, CoreError>>,
    },
}

/// Owns the two request channels and the tasks consuming them.
///
/// Workers carry no per-request state: each receives a request, performs one
/// `ObjectStore` call against its own handle, and replies on the
/// request-supplied oneshot channel.
pub struct WorkerPool<S: ObjectStore> {
    sequential_tx: mpsc::Sender<SequentialRequest>,
    pool_tx: mpsc::Sender<PoolRequest>,
    pool_rx: Arc<Mutex<mpsc::Receiver<PoolRequest>>>,
    repo_path: String,
    cancel: CancellationToken,
    _marker: PhantomData<S>,
}

impl<S: ObjectStore + 'static> WorkerPool<S> {
    /// Open `pool_size` + 1 repository handles (one sequential, `pool_size`
    /// pooled) at `repo_path` and start their worker tasks.
    pub async fn new(
        repo_path: &str,
        pool_size: usize,
        buffer_size: usize,
        cancel: CancellationToken,
    ) -> Result<Self, CoreError> {
        let pool_size = pool_size.max(1);
        let buffer_size = buffer_size.max(1);

        let (sequential_tx, sequential_rx) = mpsc::channel(buffer_size);
        let (pool_tx, pool_rx) = mpsc::channel(buffer_size);
        let pool_rx = Arc::new(Mutex::new(pool_rx));

        let seq_handle = S::open(repo_path).await?;
        spawn_sequential_worker::<S>(Arc::new(seq_handle), sequential_rx, cancel.clone());

        let pool = Self {
            sequential_tx,
            pool_tx,
            pool_rx,
            repo_path: repo_path.to_string(),
            cancel,
            _marker: PhantomData,
        };

        for _ in 0..pool_size {
            pool.spawn_pool_worker().await?;
        }

        Ok(pool)
    }

    /// Open a fresh handle and start one more pool worker consuming from the
    /// shared pool channel. Used both at startup and by the watchdog to
    /// replace a stalled worker; the replaced worker's task is simply never
    /// awaited again (abandoned, per `spec.md` §4.9/§9).
    pub async fn spawn_pool_worker(&self) -> Result<(), CoreError> {
        let handle = S::open(&self.repo_path).await?;
        spawn_pool_worker::<S>(Arc::new(handle), self.pool_rx.clone(), self.cancel.clone());
        Ok(())
    }

    pub fn sequential_sender(&self) -> mpsc::Sender<SequentialRequest> {
        self.sequential_tx.clone()
    }

    pub fn pool_sender(&self) -> mpsc::Sender<PoolRequest> {
        self.pool_tx.clone()
    }
}

fn spawn_sequential_worker<S: ObjectStore + 'static>(
    handle: Arc<S::Handle>,
    mut rx: mpsc::Receiver<SequentialRequest>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = rx.recv() => match request {
                    Some(r) => r,
                    None => break,
                },
            };
            match request {
                SequentialRequest::TreeDiff {
                    prev_tree,
                    commit,
                    respond_to,
                } => {
                    let result = S::tree_diff(&handle, prev_tree.as_ref(), &commit).await;
                    let _ = respond_to.send(result);
                }
            }
        }
    });
}

fn spawn_pool_worker<S: ObjectStore + 'static>(
    handle: Arc<S::Handle>,
    rx: Arc<Mutex<mpsc::Receiver<PoolRequest>>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let request = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    request = guard.recv() => match request {
                        Some(r) => r,
                        None => break,
                    },
                }
            };
            match request {
                PoolRequest::BlobBatch { hashes, respond_to } => {
                    let result = S::blob_batch(&handle, &hashes).await;
                    let _ = respond_to.send(result);
                }
                PoolRequest::DiffBatch { pairs, respond_to } => {
                    let result = S::diff_batch(&handle, &pairs).await;
                    let _ = respond_to.send(result);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::MemoryStore;
    use crate::store::{LogOptions, PathHash};

    #[tokio::test]
    async fn tree_diff_request_round_trips_through_sequential_worker() {
        let mut store = MemoryStore::default();
        let commit_hash = ObjectHash::new([7; 20]);
        let tree_hash = ObjectHash::new([8; 20]);
        let change = Change::insert(PathHash {
            path: "a.txt".into(),
            hash: ObjectHash::new([9; 20]),
        });
        store
            .tree_diffs
            .insert(commit_hash, (vec![change.clone()], tree_hash));

        // The pool opens its own handles via `S::open`, so seed indirectly by
        // using a store type whose `open` yields fixture data. MemoryStore's
        // `open` starts empty, so exercise the sequential channel directly
        // against a handle we construct ourselves instead.
        let handle = Arc::new(Arc::new(store));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        spawn_sequential_worker::<MemoryStore>(handle, rx, cancel);

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(SequentialRequest::TreeDiff {
            prev_tree: None,
            commit: commit_hash,
            respond_to: resp_tx,
        })
        .await
        .unwrap();

        let (changes, returned_tree) = resp_rx.await.unwrap().unwrap();
        assert_eq!(changes, vec![change]);
        assert_eq!(returned_tree, tree_hash);
    }

    #[tokio::test]
    async fn pool_workers_serve_blob_batch_requests() {
        let mut store = MemoryStore::default();
        let hash = ObjectHash::new([1; 20]);
        store.blobs.insert(hash, b"hello".to_vec());
        let handle = Arc::new(Arc::new(store));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        let rx = Arc::new(Mutex::new(rx));
        spawn_pool_worker::<MemoryStore>(handle, rx, cancel);

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(PoolRequest::BlobBatch {
            hashes: vec![hash, ObjectHash::new([2; 20])],
            respond_to: resp_tx,
        })
        .await
        .unwrap();

        let result = resp_rx.await.unwrap().unwrap();
        assert_eq!(result, vec![Some(b"hello".to_vec()), None]);
    }

    #[tokio::test]
    async fn pool_construction_opens_expected_handle_count() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::<MemoryStore>::new("/tmp/fixture-repo", 3, 8, cancel)
            .await
            .unwrap();
        // Exercise both senders to confirm the pool is wired end to end.
        let (resp_tx, resp_rx) = oneshot::channel();
        pool.sequential_sender()
            .send(SequentialRequest::TreeDiff {
                prev_tree: None,
                commit: ObjectHash::new([1; 20]),
                respond_to: resp_tx,
            })
            .await
            .unwrap();
        assert!(resp_rx.await.unwrap().is_err());

        let (resp_tx, resp_rx) = oneshot::channel();
        pool.pool_sender()
            .send(PoolRequest::BlobBatch {
                hashes: vec![],
                respond_to: resp_tx,
            })
            .await
            .unwrap();
        assert_eq!(resp_rx.await.unwrap().unwrap(), Vec::<Option<Vec<u8>>>::new());

        let _ = LogOptions::default();
    }
}
