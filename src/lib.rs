//! repomine-core is the streaming analysis engine underneath a
//! repository-history mining tool: it turns an ordered commit sequence into
//! fully-hydrated per-commit artifacts (tree diffs, blob bytes, line-level
//! diffs) and feeds them to pluggable analyzers under a memory budget.
//!
//! Callers supply a concrete [`store::ObjectStore`] over their repository
//! backend; this crate owns everything from there: batching, blob/diff
//! caching, the worker pool and stall watchdog, chunked streaming, analyzer
//! scheduling (including fork/merge for data-parallel leaves), and
//! checkpoint/resume.

pub mod analyzer;
pub mod artifact;
pub mod blob;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod diff_types;
pub mod errors;
pub mod hash;
pub mod pipeline;
pub mod planner;
pub mod prob;
pub mod runner;
pub mod session;
pub mod store;
pub mod streamer;
pub mod watchdog;
pub mod worker;

pub use analyzer::{Analyzer, AnalyzerCapabilities};
pub use artifact::{BlobArtifact, CommitArtifact};
pub use checkpoint::{CheckpointManager, Manifest};
pub use config::Config;
pub use coordinator::{Coordinator, PipelineStats};
pub use errors::{CoreError, CoreResult};
pub use hash::ObjectHash;
pub use planner::{Chunk, PipelineOverhead, StreamingPlanner};
pub use runner::Runner;
pub use session::Session;
pub use store::{Change, ChangeAction, CommitRef, LogOptions, ObjectStore};
