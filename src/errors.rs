//! Error types for the streaming analysis core.
//!
//! This module defines a unified error enumeration used across the probabilistic
//! sets, the blob/diff caches, the pipeline stages, the worker pool/watchdog, the
//! coordinator, the runner, and the checkpoint manager. It integrates with
//! `thiserror` to provide rich `Display` implementations and error source
//! chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Variants cover configuration, object-store, stall, checkpoint, analyzer,
//!   cancellation, and binary-detection failures.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the streaming analysis core.
///
/// - Used across probabilistic sets, caches, pipelines, the worker pool, and
///   the checkpoint manager.
/// - Implements `std::error::Error` via `thiserror`.
pub enum CoreError {
    /// Unparseable size, negative GC percent, or a memory budget below the
    /// minimum chunk requirement.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A path passed to `ObjectStore::open` looked like a remote URI.
    #[error("remote repositories are not supported: {0}")]
    RemoteNotSupported(String),

    /// Opaque wrap of an object-store failure.
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// The watchdog exceeded its retry budget for a request kind.
    #[error(
        "worker stalled on {request_kind} after {retries} retries; check repository integrity"
    )]
    Stalled {
        request_kind: &'static str,
        retries: u32,
    },

    /// Checkpoint manifest mismatch, schema skew, or missing analyzer state.
    #[error("invalid checkpoint: {0}")]
    CheckpointInvalid(String),

    /// Cancellation was observed; callers should treat this as graceful
    /// shutdown, not failure.
    #[error("pipeline canceled")]
    PipelineCanceled,

    /// An analyzer's `consume` or `finalize` raised an error.
    #[error("analyzer `{name}` failed: {cause}")]
    AnalyzerFailure { name: String, cause: String },

    /// Raised by `CachedBlob::count_lines` on binary blobs. Caught and
    /// handled inside the diff pipeline; never expected to escape it.
    #[error("blob is binary")]
    Binary,

    /// I/O error from the checkpoint directory or another local resource.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint manifest (de)serialization error.
    #[error("manifest (de)serialization error: {0}")]
    Manifest(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
