//! Intermediate and final per-commit artifacts passed between pipeline
//! stages and finally handed to analyzers.

use std::collections::HashMap;

use crate::blob::CachedBlob;
use crate::diff_types::FileDiffResult;
use crate::hash::ObjectHash;
use crate::store::{Change, CommitRef};

/// Intermediate artifact produced by the blob pipeline and consumed by the
/// diff pipeline.
#[derive(Debug, Clone)]
pub struct BlobArtifact {
    pub commit: CommitRef,
    pub index: usize,
    pub changes: Vec<Change>,
    pub blob_map: HashMap<ObjectHash, CachedBlob>,
    pub error: Option<String>,
}

impl BlobArtifact {
    pub fn new(commit: CommitRef, index: usize, changes: Vec<Change>) -> Self {
        Self {
            commit,
            index,
            changes,
            blob_map: HashMap::new(),
            error: None,
        }
    }
}

/// Final per-commit artifact emitted to analyzers: a `BlobArtifact` plus the
/// per-path textual diffs computed by the diff pipeline.
#[derive(Debug, Clone)]
pub struct CommitArtifact {
    pub commit: CommitRef,
    pub index: usize,
    pub changes: Vec<Change>,
    pub blob_map: HashMap<ObjectHash, CachedBlob>,
    pub file_diffs: HashMap<String, FileDiffResult>,
    pub error: Option<String>,
}

impl CommitArtifact {
    pub fn from_blob_artifact(blob: BlobArtifact, file_diffs: HashMap<String, FileDiffResult>) -> Self {
        Self {
            commit: blob.commit,
            index: blob.index,
            changes: blob.changes,
            blob_map: blob.blob_map,
            file_diffs,
            error: blob.error,
        }
    }
}
