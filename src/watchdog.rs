//! Per-request stall detection: wrap a pool request in a timeout, and on
//! stall replace the worker that was serving it and retry with exponential
//! backoff (`spec.md` §4.9).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::errors::CoreError;
use crate::store::ObjectStore;
use crate::worker::WorkerPool;

/// Backoff schedule: attempt 1 immediate, attempt 2 after 1s, attempt 3
/// after 4s. Exhausting all three surfaces `CoreError::Stalled`.
const BACKOFFS: [Duration; 3] = [Duration::ZERO, Duration::from_secs(1), Duration::from_secs(4)];

#[derive(Debug, Default)]
pub struct WatchdogStats {
    pub stalls_detected: u64,
    pub workers_recreated: u64,
}

/// Wraps pool requests in a timeout and drives the replace-and-retry
/// protocol. `None` timeout disables the watchdog entirely (requests run
/// with no deadline and can never stall-retry).
pub struct Watchdog {
    timeout: Option<Duration>,
    stalls_detected: AtomicU64,
    workers_recreated: AtomicU64,
}

impl Watchdog {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            stalls_detected: AtomicU64::new(0),
            workers_recreated: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> WatchdogStats {
        WatchdogStats {
            stalls_detected: self.stalls_detected.load(Ordering::Relaxed),
            workers_recreated: self.workers_recreated.load(Ordering::Relaxed),
        }
    }

    /// Run `make_request` under the watchdog. `make_request` is called once
    /// per attempt; each invocation must issue a fresh request (the stuck
    /// one is abandoned, never retried directly).
    pub async fn call<S, F, Fut, T>(
        &self,
        request_kind: &'static str,
        pool: &WorkerPool<S>,
        mut make_request: F,
    ) -> Result<T, CoreError>
    where
        S: ObjectStore + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let Some(timeout) = self.timeout else {
            return make_request().await;
        };

        for (attempt, backoff) in BACKOFFS.iter().enumerate() {
            if !backoff.is_zero() {
                tokio::time::sleep(*backoff).await;
            }
            match tokio::time::timeout(timeout, make_request()).await {
                Ok(result) => return result,
                Err(_) => {
                    self.stalls_detected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(request_kind, attempt, "worker.stall_detected");
                    pool.spawn_pool_worker().await?;
                    self.workers_recreated.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(request_kind, "worker.recreated");
                }
            }
        }

        Err(CoreError::Stalled {
            request_kind,
            retries: BACKOFFS.len() as u32,
        })
    }

    /// Like `call`, but for a response that is already in flight on a
    /// oneshot channel (the blob/diff pipelines submit the pool request
    /// before enqueuing the job, so the "request" for the first attempt has
    /// already been sent). `resend` is only invoked for retries; the
    /// original stuck receiver is simply dropped, never polled again.
    ///
    /// `T` is the worker's own success payload — the channel always carries
    /// `Result<T, CoreError>` (the worker's own failure alongside the
    /// channel's), and this unwraps both layers into a single `Result`
    /// before returning, so callers never have to peel an extra `Result`.
    pub async fn await_inflight<S, T, R>(
        &self,
        request_kind: &'static str,
        pool: &WorkerPool<S>,
        first: oneshot::Receiver<Result<T, CoreError>>,
        mut resend: R,
    ) -> Result<T, CoreError>
    where
        S: ObjectStore + 'static,
        R: FnMut() -> oneshot::Receiver<Result<T, CoreError>>,
    {
        let Some(timeout) = self.timeout else {
            return first
                .await
                .map_err(|_| CoreError::ObjectStore("worker dropped response channel".into()))
                .and_then(|r| r);
        };

        let mut rx = Some(first);
        for (attempt, backoff) in BACKOFFS.iter().enumerate() {
            if attempt > 0 {
                if !backoff.is_zero() {
                    tokio::time::sleep(*backoff).await;
                }
                rx = Some(resend());
            }
            let current = rx.take().expect("rx is set at the start of every iteration");
            match tokio::time::timeout(timeout, current).await {
                Ok(Ok(Ok(value))) => return Ok(value),
                Ok(Ok(Err(e))) => return Err(e),
                Ok(Err(_)) => {
                    return Err(CoreError::ObjectStore(
                        "worker dropped response channel".into(),
                    ))
                }
                Err(_) => {
                    self.stalls_detected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(request_kind, attempt, "worker.stall_detected");
                    pool.spawn_pool_worker().await?;
                    self.workers_recreated.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(request_kind, "worker.recreated");
                }
            }
        }

        Err(CoreError::Stalled {
            request_kind,
            retries: BACKOFFS.len() as u32,
        })
    }
}

/// Initializes a terse stdout subscriber for watchdog tests, since the
/// stall/recreate path is otherwise silent. Safe to call from multiple
/// tests — repeat `try_init` calls are no-ops.
#[cfg(test)]
pub(crate) fn init_test_logger() {
    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_target(false)
        .without_time()
        .with_max_level(tracing::Level::DEBUG)
        .finish()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn recovers_after_one_stall_then_success() {
        init_test_logger();
        let pool = WorkerPool::<MemoryStore>::new("/tmp/fixture", 1, 4, CancellationToken::new())
            .await
            .unwrap();
        let watchdog = Watchdog::new(Some(Duration::from_millis(50)));

        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_inner = call_count.clone();

        let result: Result<u32, CoreError> = watchdog
            .call("blob_batch", &pool, move || {
                let call_count = call_count_inner.clone();
                async move {
                    let n = call_count.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        // First attempt: never resolves before the timeout.
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(0)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        let stats = watchdog.stats();
        assert_eq!(stats.stalls_detected, 1);
        assert_eq!(stats.workers_recreated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_all_attempts_surfaces_stalled_error() {
        let pool = WorkerPool::<MemoryStore>::new("/tmp/fixture", 1, 4, CancellationToken::new())
            .await
            .unwrap();
        let watchdog = Watchdog::new(Some(Duration::from_millis(10)));

        let result: Result<u32, CoreError> = watchdog
            .call("diff_batch", &pool, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(0)
            })
            .await;

        match result {
            Err(CoreError::Stalled { request_kind, retries }) => {
                assert_eq!(request_kind, "diff_batch");
                assert_eq!(retries, 3);
            }
            other => panic!("expected Stalled, got {other:?}"),
        }
        assert_eq!(watchdog.stats().stalls_detected, 3);
    }

    #[tokio::test]
    async fn disabled_watchdog_runs_request_with_no_deadline() {
        let pool = WorkerPool::<MemoryStore>::new("/tmp/fixture", 1, 4, CancellationToken::new())
            .await
            .unwrap();
        let watchdog = Watchdog::new(None);
        let result: Result<u32, CoreError> = watchdog.call("noop", &pool, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
