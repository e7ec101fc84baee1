//! The three-stage back-pressured pipeline: commit batches flow through a
//! blob-loading stage and then a textual-diff stage, each a producer/consumer
//! pair connected by an internal bounded queue.

pub mod blob_pipeline;
pub mod diff_pipeline;

pub use blob_pipeline::spawn_blob_pipeline;
pub use diff_pipeline::spawn_diff_pipeline;
