//! `FileDiffResult`: the line-level diff result produced by the diff pipeline
//! and cached by `(old_hash, new_hash)`.

use serde::{Deserialize, Serialize};

/// A single run in a `FileDiffResult`'s op sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffOpKind {
    Equal,
    Insert,
    Delete,
}

/// One run of consecutive lines sharing the same op kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOp {
    pub kind: DiffOpKind,
    pub line_count: usize,
}

/// Result of a textual diff between two text blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiffResult {
    pub old_line_count: usize,
    pub new_line_count: usize,
    pub ops: Vec<DiffOp>,
}

impl FileDiffResult {
    /// An empty diff for two identical (or both-empty) files.
    pub fn unchanged(line_count: usize) -> Self {
        Self {
            old_line_count: line_count,
            new_line_count: line_count,
            ops: if line_count == 0 {
                Vec::new()
            } else {
                vec![DiffOp {
                    kind: DiffOpKind::Equal,
                    line_count,
                }]
            },
        }
    }
}
