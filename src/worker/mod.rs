//! The worker pool: a sequential tree-diff worker plus an N-task pool for
//! blob/diff batch requests.

pub mod pool;

pub use pool::{PoolRequest, SequentialRequest, WorkerPool};
