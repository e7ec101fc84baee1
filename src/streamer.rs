//! The commit streamer: turns a commit walk into an ordered, back-pressured
//! sequence of fixed-size batches.
//!
//! Takes either of `ObjectStore`'s two input modes — `stream_commits` drives
//! the lazy `log_stream` iterator, filling batches as items arrive without
//! ever materializing the whole walk; `stream_commit_list` takes an
//! already-materialized ordered sequence directly (used by the streaming
//! session, which needs the full list up front anyway for chunk planning).
//! Either way this module is the seam where commits get cut into batches and
//! handed to the rest of the pipeline through a bounded channel, so the
//! producer can run ahead of a slow consumer by at most `buffer_size`
//! batches (the "lookahead").

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::CoreError;
use crate::store::{CommitRef, LogOptions, ObjectStore};

/// One fixed-size slice of the commit walk, tagged with its position in the
/// overall sequence so downstream stages can preserve order without relying
/// on channel delivery order alone.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub commits: Vec<CommitRef>,
    pub start_index: usize,
    pub batch_id: usize,
}

/// Start a streamer task over `handle`, returning the receiving end of a
/// bounded channel of batches.
///
/// Drives `S::log_stream`'s lazy commit iterator, filling a `batch_size`
/// buffer as items arrive and sending each batch as soon as it's full
/// (the final batch may be short). It stops early (dropping the sender)
/// when `cancel` fires or when the receiver is gone.
pub fn stream_commits<S: ObjectStore + 'static>(
    handle: S::Handle,
    opts: LogOptions,
    batch_size: usize,
    buffer_size: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<CommitBatch, CoreError>> {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));

    tokio::spawn(async move {
        let stream = match S::log_stream(&handle, &opts).await {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        emit_from_stream(stream, 0, batch_size, tx, cancel).await;
    });

    rx
}

/// Like `stream_commits`, but over an already-resolved slice of commits
/// (no `S::log` call), tagging batches starting at `start_index` instead of
/// zero. Used by the chunked streaming session to stream one chunk's range
/// without re-walking the whole history.
pub fn stream_commit_list(
    commits: Vec<CommitRef>,
    start_index: usize,
    batch_size: usize,
    buffer_size: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<CommitBatch, CoreError>> {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    tokio::spawn(async move {
        emit_batches(commits, start_index, batch_size, tx, cancel).await;
    });
    rx
}

async fn emit_batches(
    commits: Vec<CommitRef>,
    base_index: usize,
    batch_size: usize,
    tx: mpsc::Sender<Result<CommitBatch, CoreError>>,
    cancel: CancellationToken,
) {
    let mut start_index = base_index;
    let mut batch_id = 0;
    for chunk in commits.chunks(batch_size.max(1)) {
        if cancel.is_cancelled() {
            return;
        }
        let batch = CommitBatch {
            commits: chunk.to_vec(),
            start_index,
            batch_id,
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            send_result = tx.send(Ok(batch)) => {
                if send_result.is_err() {
                    return;
                }
            }
        }
        start_index += chunk.len();
        batch_id += 1;
    }
}

/// Drain `stream` into `batch_size`-sized batches, sending each as soon as
/// it fills rather than waiting for the whole walk — the lazy counterpart to
/// `emit_batches`, which already has the full sequence in hand.
async fn emit_from_stream(
    mut stream: BoxStream<'_, Result<CommitRef, CoreError>>,
    base_index: usize,
    batch_size: usize,
    tx: mpsc::Sender<Result<CommitBatch, CoreError>>,
    cancel: CancellationToken,
) {
    let batch_size = batch_size.max(1);
    let mut buffer = Vec::with_capacity(batch_size);
    let mut start_index = base_index;
    let mut batch_id = 0;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };

        match next {
            Some(Ok(commit)) => {
                buffer.push(commit);
                if buffer.len() < batch_size {
                    continue;
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
            None => {
                if buffer.is_empty() {
                    return;
                }
            }
        }

        let batch = CommitBatch {
            commits: std::mem::take(&mut buffer),
            start_index,
            batch_id,
        };
        let sent_len = batch.commits.len();
        tokio::select! {
            _ = cancel.cancelled() => return,
            send_result = tx.send(Ok(batch)) => {
                if send_result.is_err() {
                    return;
                }
            }
        }
        start_index += sent_len;
        batch_id += 1;

        if sent_len < batch_size {
            // That was the trailing short batch from `None` above.
            return;
        }
    }
}
