//! Stage two: `BlobArtifact`s in, `CommitArtifact`s out. For every `Modify`
//! change whose old/new blobs are both present and non-binary, request a
//! textual diff from the pool; on a pool error, fall back to a local Myers
//! diff (a generalization of the teacher's `Diff::compute_line_operations`
//! onto this pipeline's `(old_hash, new_hash)` request/cache model).

use std::collections::HashMap;
use std::sync::Arc;

use similar::{Algorithm, ChangeTag, TextDiff};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::artifact::{BlobArtifact, CommitArtifact};
use crate::cache::DiffCache;
use crate::diff_types::{DiffOp, DiffOpKind, FileDiffResult};
use crate::errors::CoreError;
use crate::hash::ObjectHash;
use crate::store::{ChangeAction, ObjectStore};
use crate::watchdog::Watchdog;
use crate::worker::{PoolRequest, WorkerPool};

struct PendingJob {
    blob: BlobArtifact,
    /// `(path, old_hash, new_hash)` for every pair that needs a remote diff.
    requested: Vec<(String, ObjectHash, ObjectHash)>,
    /// Results already available without a pool round trip (cache hits or
    /// unchanged-content short circuits).
    resolved: HashMap<String, FileDiffResult>,
    response_rx: Option<
        oneshot::Receiver<Result<Vec<Result<FileDiffResult, CoreError>>, CoreError>>,
    >,
}

/// Start the diff pipeline. Consumes `blob_rx` (from the blob pipeline) and
/// returns a receiver of `CommitArtifact`s in the same order.
pub fn spawn_diff_pipeline<S: ObjectStore + 'static>(
    mut blob_rx: mpsc::Receiver<Result<BlobArtifact, CoreError>>,
    pool: Arc<WorkerPool<S>>,
    watchdog: Arc<Watchdog>,
    diff_cache: Option<Arc<DiffCache>>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<CommitArtifact, CoreError>> {
    let (job_tx, mut job_rx) = mpsc::channel::<Result<PendingJob, CoreError>>(buffer_size.max(1));
    let (out_tx, out_rx) = mpsc::channel(buffer_size.max(1));

    {
        let pool = pool.clone();
        let diff_cache = diff_cache.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let blob = tokio::select! {
                    _ = cancel.cancelled() => break,
                    blob = blob_rx.recv() => match blob {
                        Some(Ok(b)) => b,
                        Some(Err(e)) => {
                            let _ = job_tx.send(Err(e)).await;
                            break;
                        }
                        None => break,
                    },
                };

                let mut resolved = HashMap::new();
                let mut pairs = Vec::new();
                let mut paths = Vec::new();

                for change in &blob.changes {
                    if change.action != ChangeAction::Modify {
                        continue;
                    }
                    let (Some(old_blob), Some(new_blob)) = (
                        blob.blob_map.get(&change.from.hash),
                        blob.blob_map.get(&change.to.hash),
                    ) else {
                        continue;
                    };
                    if old_blob.is_binary() || new_blob.is_binary() {
                        continue;
                    }

                    if let Some(cache) = &diff_cache {
                        if let Some(hit) = cache.get(&change.from.hash, &change.to.hash) {
                            resolved.insert(change.to.path.clone(), hit);
                            continue;
                        }
                    }

                    paths.push(change.to.path.clone());
                    pairs.push((change.from.hash, change.to.hash));
                }

                let response_rx = if pairs.is_empty() {
                    None
                } else {
                    let (resp_tx, resp_rx) = oneshot::channel();
                    if pool
                        .pool_sender()
                        .send(PoolRequest::DiffBatch {
                            pairs: pairs.clone(),
                            respond_to: resp_tx,
                        })
                        .await
                        .is_err()
                    {
                        let _ = job_tx
                            .send(Err(CoreError::ObjectStore("pool channel closed".into())))
                            .await;
                        break;
                    }
                    Some(resp_rx)
                };

                let requested = paths
                    .into_iter()
                    .zip(pairs)
                    .map(|(path, (old, new))| (path, old, new))
                    .collect();

                let job = PendingJob {
                    blob,
                    requested,
                    resolved,
                    response_rx,
                };
                if job_tx.send(Ok(job)).await.is_err() {
                    break;
                }
            }
        });
    }

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
                    let _ = out_tx.send(Err(e)).await;
                    break;
                }
            };

            let mut file_diffs = job.resolved;

            if let Some(response_rx) = job.response_rx {
                let requested = job.requested.clone();
                let pool_for_resend = pool.clone();
                let pairs: Vec<(ObjectHash, ObjectHash)> =
                    requested.iter().map(|(_, o, n)| (*o, *n)).collect();
                let result = watchdog
                    .await_inflight("diff_batch", &pool, response_rx, move || {
                        let (resp_tx, resp_rx) = oneshot::channel();
                        let pool_tx = pool_for_resend.pool_sender();
                        let pairs = pairs.clone();
                        tokio::spawn(async move {
                            let _ = pool_tx
                                .send(PoolRequest::DiffBatch {
                                    pairs,
                                    respond_to: resp_tx,
                                })
                                .await;
                        });
                        resp_rx
                    })
                    .await;

                match result {
                    Ok(results) => {
                        for ((path, old_hash, new_hash), outcome) in
                            job.requested.iter().zip(results)
                        {
                            let resolved = match outcome {
                                Ok(diff) => diff,
                                Err(_) => local_fallback_diff(
                                    job.blob.blob_map.get(old_hash),
                                    job.blob.blob_map.get(new_hash),
                                ),
                            };
                            if let Some(cache) = &diff_cache {
                                cache.put(*old_hash, *new_hash, resolved.clone());
                            }
                            file_diffs.insert(path.clone(), resolved);
                        }
                    }
                    Err(_) => {
                        // Pool exhausted its stall budget: fall back locally
                        // for every still-outstanding path rather than
                        // failing the whole commit.
                        for (path, old_hash, new_hash) in &job.requested {
                            let resolved = local_fallback_diff(
                                job.blob.blob_map.get(old_hash),
                                job.blob.blob_map.get(new_hash),
                            );
                            if let Some(cache) = &diff_cache {
                                cache.put(*old_hash, *new_hash, resolved.clone());
                            }
                            file_diffs.insert(path.clone(), resolved);
                        }
                    }
                }
            }

            let artifact = CommitArtifact::from_blob_artifact(job.blob, file_diffs);
            if out_tx.send(Ok(artifact)).await.is_err() {
                break;
            }
        }
    });

    out_rx
}

/// Line-based Myers diff computed locally when the pool request errors,
/// built the same way the teacher's `Diff::compute_line_operations` drives
/// `similar::TextDiff`, but folded into `FileDiffResult`'s run-length form.
fn local_fallback_diff(
    old_blob: Option<&crate::blob::CachedBlob>,
    new_blob: Option<&crate::blob::CachedBlob>,
) -> FileDiffResult {
    let old_lines = old_blob.map(|b| b.lines_lossy()).unwrap_or_default();
    let new_lines = new_blob.map(|b| b.lines_lossy()).unwrap_or_default();
    diff_lines(&old_lines, &new_lines)
}

/// Run a Myers line diff and fold consecutive same-tag changes into runs.
pub fn diff_lines(old_lines: &[String], new_lines: &[String]) -> FileDiffResult {
    let old_refs: Vec<&str> = old_lines.iter().map(String::as_str).collect();
    let new_refs: Vec<&str> = new_lines.iter().map(String::as_str).collect();

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_slices(&old_refs, &new_refs);

    let mut ops: Vec<DiffOp> = Vec::new();
    for change in diff.iter_all_changes() {
        let kind = match change.tag() {
            ChangeTag::Equal => DiffOpKind::Equal,
            ChangeTag::Delete => DiffOpKind::Delete,
            ChangeTag::Insert => DiffOpKind::Insert,
        };
        match ops.last_mut() {
            Some(last) if last.kind == kind => last.line_count += 1,
            _ => ops.push(DiffOp { kind, line_count: 1 }),
        }
    }

    FileDiffResult {
        old_line_count: old_lines.len(),
        new_line_count: new_lines.len(),
        ops,
    }
}
