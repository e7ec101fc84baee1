//! The abstract object-store collaborator (`spec.md` §6) and the commit/change
//! types that flow out of it.
//!
//! This crate never implements a concrete repository backend — callers supply
//! one via the `ObjectStore` trait. Tests implement a minimal in-memory
//! double (see `store::tests::MemoryStore`) the same way the pack tests in
//! this crate's lineage build fixture objects directly rather than opening a
//! real repository.

use async_trait::async_trait;

use crate::errors::CoreError;
use crate::hash::ObjectHash;

/// One of the three kinds of change a tree diff can report for a path.
/// A rename is encoded as `Modify` with `from.path != to.path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Insert,
    Modify,
    Delete,
}

/// One side of a `Change`: a logical path and the blob hash at that path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PathHash {
    pub path: String,
    pub hash: ObjectHash,
}

/// A single file-level change between two commit trees.
///
/// For `Insert`, `from` is unused (defaulted); for `Delete`, `to` is unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub action: ChangeAction,
    pub from: PathHash,
    pub to: PathHash,
}

impl Change {
    pub fn insert(to: PathHash) -> Self {
        Self {
            action: ChangeAction::Insert,
            from: PathHash::default(),
            to,
        }
    }

    pub fn delete(from: PathHash) -> Self {
        Self {
            action: ChangeAction::Delete,
            from,
            to: PathHash::default(),
        }
    }

    pub fn modify(from: PathHash, to: PathHash) -> Self {
        Self {
            action: ChangeAction::Modify,
            from,
            to,
        }
    }

    /// Whether this change is a rename (a `Modify` with differing paths).
    pub fn is_rename(&self) -> bool {
        self.action == ChangeAction::Modify && self.from.path != self.to.path
    }

    /// Every blob hash this change references (`spec.md` §3: Insert → `to.hash`,
    /// Delete → `from.hash`, Modify → both).
    pub fn referenced_hashes(&self) -> Vec<ObjectHash> {
        match self.action {
            ChangeAction::Insert => vec![self.to.hash],
            ChangeAction::Delete => vec![self.from.hash],
            ChangeAction::Modify => vec![self.from.hash, self.to.hash],
        }
    }
}

/// A reference to one commit in the walked sequence.
///
/// Produced by the object store's commit iterator; borrowed by the pipeline;
/// released after the last analyzer has consumed it for its chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRef {
    pub hash: ObjectHash,
    pub parent_count: usize,
    pub committer_timestamp: i64,
}

/// One path + blob hash entry as listed by `CommitRef`'s file iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub hash: ObjectHash,
}

/// Walk filters accepted by `ObjectStore::log`.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub since: Option<i64>,
    pub limit: Option<usize>,
    pub head_only: bool,
    pub first_parent: bool,
}

/// The repository-object collaborator this core consumes.
///
/// Implementors own repository handles; this crate only ever calls through
/// the trait, never reaches into a concrete backend. Every method may be
/// called concurrently from multiple worker tasks on distinct handles.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Handle type returned by `open`, held by the sequential worker, each
    /// pool worker, and each prefetch task.
    type Handle: Send + Sync;

    /// Open a repository handle at `path`. Paths that look like remote URIs
    /// (`http(s)://`, `git@...:`) must be rejected with `RemoteNotSupported`.
    async fn open(path: &str) -> Result<Self::Handle, CoreError>;

    /// List commits reachable under `opts`, in the order the caller should
    /// process them, fully materialized. Used wherever the caller needs the
    /// total count or random-access slicing up front (chunk planning,
    /// resuming into the middle of a range).
    async fn log(handle: &Self::Handle, opts: &LogOptions) -> Result<Vec<CommitRef>, CoreError>;

    /// Like `log`, but as a lazy commit iterator instead of a materialized
    /// `Vec` — the commit streamer's other supported input mode, for callers
    /// that don't need the total count up front and want the walk to start
    /// producing batches before the whole history is resolved.
    ///
    /// The default forwards to `log` and replays it as a stream, which is
    /// correct but not actually lazy; a backend whose underlying walk is
    /// naturally iterator-shaped should override this directly instead of
    /// materializing first.
    async fn log_stream<'a>(
        handle: &'a Self::Handle,
        opts: &LogOptions,
    ) -> Result<futures::stream::BoxStream<'a, Result<CommitRef, CoreError>>, CoreError> {
        let commits = Self::log(handle, opts).await?;
        Ok(Box::pin(futures::stream::iter(commits.into_iter().map(Ok))))
    }

    /// List the files present in a commit's tree.
    async fn files(handle: &Self::Handle, commit: &ObjectHash) -> Result<Vec<FileEntry>, CoreError>;

    /// Diff `commit` against `prev_tree` (the previous commit's tree, if any,
    /// reused by the sequential worker for amortized gains across
    /// consecutive commits). Returns the changes and the new tree handle.
    async fn tree_diff(
        handle: &Self::Handle,
        prev_tree: Option<&ObjectHash>,
        commit: &ObjectHash,
    ) -> Result<(Vec<Change>, ObjectHash), CoreError>;

    /// Load a batch of blobs by hash, 1-to-1 with the request, `None` for any
    /// hash unknown to the store.
    async fn blob_batch(
        handle: &Self::Handle,
        hashes: &[ObjectHash],
    ) -> Result<Vec<Option<Vec<u8>>>, CoreError>;

    /// Compute line-level textual diffs for a batch of `(old, new)` blob hash
    /// pairs, in the same order as the request.
    async fn diff_batch(
        handle: &Self::Handle,
        pairs: &[(ObjectHash, ObjectHash)],
    ) -> Result<Vec<Result<crate::diff_types::FileDiffResult, CoreError>>, CoreError>;
}

/// Reject paths that look like a remote URI, per `spec.md` §6.
pub fn reject_remote_path(path: &str) -> Result<(), CoreError> {
    let lower = path.trim();
    if lower.starts_with("http://")
        || lower.starts_with("https://")
        || (lower.contains('@') && lower.contains(':') && !lower.starts_with('/'))
    {
        return Err(CoreError::RemoteNotSupported(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    /// Path-keyed fixtures for `MemoryStore::open`. Real `ObjectStore`
    /// implementors open an actual repository at `path`; tests that need the
    /// opened handle to carry pre-populated commits/blobs install one here
    /// under a path unique to that test before constructing a `WorkerPool`.
    static FIXTURES: OnceLock<Mutex<HashMap<String, std::sync::Arc<MemoryStore>>>> =
        OnceLock::new();

    /// Register `store` to be returned by `MemoryStore::open(path)`. Pick a
    /// path unique to the calling test to avoid collisions with other tests
    /// running concurrently in the same process.
    pub fn install_fixture(path: &str, store: MemoryStore) -> std::sync::Arc<MemoryStore> {
        let arc = std::sync::Arc::new(store);
        FIXTURES
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .unwrap()
            .insert(path.to_string(), arc.clone());
        arc
    }

    /// A minimal in-memory `ObjectStore` double used across this crate's
    /// unit and integration tests.
    pub struct MemoryStore {
        pub commits: Vec<CommitRef>,
        pub trees: HashMap<ObjectHash, Vec<FileEntry>>,
        pub tree_diffs: HashMap<ObjectHash, (Vec<Change>, ObjectHash)>,
        pub blobs: HashMap<ObjectHash, Vec<u8>>,
        pub diff_batch_calls: Mutex<usize>,
    }

    impl Default for MemoryStore {
        fn default() -> Self {
            Self {
                commits: Vec::new(),
                trees: HashMap::new(),
                tree_diffs: HashMap::new(),
                blobs: HashMap::new(),
                diff_batch_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        type Handle = std::sync::Arc<MemoryStore>;

        async fn open(path: &str) -> Result<Self::Handle, CoreError> {
            reject_remote_path(path)?;
            if let Some(fixtures) = FIXTURES.get() {
                if let Some(store) = fixtures.lock().unwrap().get(path) {
                    return Ok(store.clone());
                }
            }
            Ok(std::sync::Arc::new(MemoryStore::default()))
        }

        async fn log(
            handle: &Self::Handle,
            opts: &LogOptions,
        ) -> Result<Vec<CommitRef>, CoreError> {
            let mut commits = handle.commits.clone();
            if let Some(since) = opts.since {
                commits.retain(|c| c.committer_timestamp >= since);
            }
            if let Some(limit) = opts.limit {
                commits.truncate(limit);
            }
            Ok(commits)
        }

        async fn files(
            handle: &Self::Handle,
            commit: &ObjectHash,
        ) -> Result<Vec<FileEntry>, CoreError> {
            Ok(handle.trees.get(commit).cloned().unwrap_or_default())
        }

        async fn tree_diff(
            handle: &Self::Handle,
            _prev_tree: Option<&ObjectHash>,
            commit: &ObjectHash,
        ) -> Result<(Vec<Change>, ObjectHash), CoreError> {
            handle
                .tree_diffs
                .get(commit)
                .cloned()
                .ok_or_else(|| CoreError::ObjectStore(format!("no tree diff for {commit}")))
        }

        async fn blob_batch(
            handle: &Self::Handle,
            hashes: &[ObjectHash],
        ) -> Result<Vec<Option<Vec<u8>>>, CoreError> {
            Ok(hashes
                .iter()
                .map(|h| handle.blobs.get(h).cloned())
                .collect())
        }

        async fn diff_batch(
            handle: &Self::Handle,
            pairs: &[(ObjectHash, ObjectHash)],
        ) -> Result<Vec<Result<crate::diff_types::FileDiffResult, CoreError>>, CoreError> {
            *handle.diff_batch_calls.lock().unwrap() += 1;
            Ok(pairs
                .iter()
                .map(|_| Err(CoreError::ObjectStore("memory store has no diff backend".into())))
                .collect())
        }
    }

    #[test]
    fn rejects_http_and_ssh_like_paths() {
        assert!(reject_remote_path("https://example.com/repo.git").is_err());
        assert!(reject_remote_path("git@example.com:org/repo.git").is_err());
        assert!(reject_remote_path("/home/user/repo").is_ok());
        assert!(reject_remote_path("./relative/repo").is_ok());
    }

    #[test]
    fn change_referenced_hashes_match_action() {
        let from = PathHash {
            path: "a.txt".into(),
            hash: ObjectHash::new([1; 20]),
        };
        let to = PathHash {
            path: "a.txt".into(),
            hash: ObjectHash::new([2; 20]),
        };
        let modify = Change::modify(from.clone(), to.clone());
        assert_eq!(modify.referenced_hashes(), vec![from.hash, to.hash]);

        let insert = Change::insert(to.clone());
        assert_eq!(insert.referenced_hashes(), vec![to.hash]);

        let delete = Change::delete(from.clone());
        assert_eq!(delete.referenced_hashes(), vec![from.hash]);
    }

    #[test]
    fn rename_detection() {
        let from = PathHash {
            path: "old.txt".into(),
            hash: ObjectHash::new([1; 20]),
        };
        let to = PathHash {
            path: "new.txt".into(),
            hash: ObjectHash::new([1; 20]),
        };
        assert!(Change::modify(from, to).is_rename());
    }
}
