//! Stage one: commit batches in, `BlobArtifact`s out. A producer task walks
//! commits sequentially (tree-diff, which needs the previous tree for
//! amortized reuse) and submits blob-batch requests to the pool as it goes;
//! a consumer task drains those in FIFO order so output stays in input
//! order even though several requests may be in flight at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::artifact::BlobArtifact;
use crate::blob::CachedBlob;
use crate::cache::BlobLruCache;
use crate::errors::CoreError;
use crate::hash::ObjectHash;
use crate::store::{CommitRef, ObjectStore};
use crate::streamer::CommitBatch;
use crate::watchdog::Watchdog;
use crate::worker::{PoolRequest, SequentialRequest, WorkerPool};

struct PendingJob {
    commit: CommitRef,
    index: usize,
    changes: Vec<crate::store::Change>,
    cached: HashMap<ObjectHash, CachedBlob>,
    missing: Vec<ObjectHash>,
    response_rx: Option<oneshot::Receiver<Result<Vec<Option<Vec<u8>>>, CoreError>>>,
}

/// Start the blob pipeline. Consumes `commit_rx` (from the commit streamer)
/// and returns a receiver of `BlobArtifact`s in strict input-commit order.
pub fn spawn_blob_pipeline<S: ObjectStore + 'static>(
    mut commit_rx: mpsc::Receiver<Result<CommitBatch, CoreError>>,
    pool: Arc<WorkerPool<S>>,
    watchdog: Arc<Watchdog>,
    blob_cache: Option<Arc<BlobLruCache>>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<BlobArtifact, CoreError>> {
    let (job_tx, mut job_rx) = mpsc::channel::<Result<PendingJob, CoreError>>(buffer_size.max(1));
    let (artifact_tx, artifact_rx) = mpsc::channel(buffer_size.max(1));

    // Producer: sequential tree-diff + pool blob-batch submission.
    {
        let pool = pool.clone();
        let watchdog = watchdog.clone();
        let blob_cache = blob_cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut prev_tree: Option<ObjectHash> = None;
            'batches: loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = commit_rx.recv() => match batch {
                        Some(Ok(b)) => b,
                        Some(Err(e)) => {
                            let _ = job_tx.send(Err(e)).await;
                            break;
                        }
                        None => break,
                    },
                };

                for (offset, commit) in batch.commits.into_iter().enumerate() {
                    if cancel.is_cancelled() {
                        break 'batches;
                    }
                    let index = batch.start_index + offset;
                    let seq_tx = pool.sequential_sender();
                    let prev_tree_arg = prev_tree;
                    let commit_hash = commit.hash;
                    let tree_diff_result = watchdog
                        .call("tree_diff", &pool, move || {
                            let seq_tx = seq_tx.clone();
                            async move {
                                let (resp_tx, resp_rx) = oneshot::channel();
                                seq_tx
                                    .send(SequentialRequest::TreeDiff {
                                        prev_tree: prev_tree_arg,
                                        commit: commit_hash,
                                        respond_to: resp_tx,
                                    })
                                    .await
                                    .map_err(|_| {
                                        CoreError::ObjectStore(
                                            "sequential worker channel closed".into(),
                                        )
                                    })?;
                                resp_rx.await.map_err(|_| {
                                    CoreError::ObjectStore(
                                        "sequential worker dropped response".into(),
                                    )
                                })?
                            }
                        })
                        .await;

                    let (changes, new_tree) = match tree_diff_result {
                        Ok(v) => v,
                        Err(e) => {
                            let _ = job_tx.send(Err(e)).await;
                            break 'batches;
                        }
                    };
                    prev_tree = Some(new_tree);

                    let mut wanted: Vec<ObjectHash> = Vec::new();
                    let mut seen = HashSet::new();
                    for change in &changes {
                        for h in change.referenced_hashes() {
                            if seen.insert(h) {
                                wanted.push(h);
                            }
                        }
                    }

                    let mut cached = HashMap::new();
                    let mut missing = Vec::new();
                    if let Some(cache) = &blob_cache {
                        for (hash, hit) in wanted.iter().zip(cache.get_multi(&wanted)) {
                            match hit {
                                Some(blob) => {
                                    cached.insert(*hash, blob);
                                }
                                None => missing.push(*hash),
                            }
                        }
                    } else {
                        missing = wanted;
                    }

                    let response_rx = if missing.is_empty() {
                        None
                    } else {
                        let (resp_tx, resp_rx) = oneshot::channel();
                        if pool
                            .pool_sender()
                            .send(PoolRequest::BlobBatch {
                                hashes: missing.clone(),
                                respond_to: resp_tx,
                            })
                            .await
                            .is_err()
                        {
                            let _ = job_tx
                                .send(Err(CoreError::ObjectStore("pool channel closed".into())))
                                .await;
                            break 'batches;
                        }
                        Some(resp_rx)
                    };

                    let job = PendingJob {
                        commit,
                        index,
                        changes,
                        cached,
                        missing,
                        response_rx,
                    };
                    if job_tx.send(Ok(job)).await.is_err() {
                        break 'batches;
                    }
                }
            }
        });
    }

    // Consumer: drains jobs FIFO, awaiting each pool response under the
    // watchdog, merging cached + loaded blobs, and populating the cache.
    tokio::spawn(async move {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = job_rx.recv() => match job {
                    Some(j) => j,
                    None => break,
                },
            };

            let job = match job {
                Ok(j) => j,
                Err(e) => {
                    let _ = artifact_tx.send(Err(e)).await;
                    break;
                }
            };

            let mut blob_map = job.cached;
            if let Some(response_rx) = job.response_rx {
                let missing = job.missing.clone();
                let pool = pool.clone();
                let result = watchdog
                    .await_inflight("blob_batch", &pool, response_rx, || {
                        let (resp_tx, resp_rx) = oneshot::channel();
                        let pool_tx = pool.pool_sender();
                        let hashes = missing.clone();
                        tokio::spawn(async move {
                            let _ = pool_tx
                                .send(PoolRequest::BlobBatch {
                                    hashes,
                                    respond_to: resp_tx,
                                })
                                .await;
                        });
                        resp_rx
                    })
                    .await;

                match result {
                    Ok(blobs) => {
                        for (hash, maybe_bytes) in job.missing.iter().zip(blobs) {
                            if let Some(bytes) = maybe_bytes {
                                let cached_blob = CachedBlob::new(*hash, bytes);
                                if let Some(cache) = &blob_cache {
                                    cache.put(*hash, Some(cached_blob.clone()));
                                }
                                blob_map.insert(*hash, cached_blob);
                            }
                        }
                    }
                    Err(e) => {
                        let _ = artifact_tx.send(Err(e)).await;
                        break;
                    }
                }
            }

            let artifact = BlobArtifact {
                commit: job.commit,
                index: job.index,
                changes: job.changes,
                blob_map,
                error: None,
            };
            if artifact_tx.send(Ok(artifact)).await.is_err() {
                break;
            }
        }
    });

    artifact_rx
}
