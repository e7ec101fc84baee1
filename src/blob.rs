//! `CachedBlob`: owned, immutable blob bytes plus the cheap binary sniff and
//! line count used by the diff pipeline.

use bytes::Bytes;

use crate::errors::CoreError;
use crate::hash::ObjectHash;

/// How many leading bytes the binary sniff inspects.
const BINARY_SNIFF_WINDOW: usize = 8000;

/// Owned, immutable blob bytes plus the hash they were loaded under.
///
/// `data` is a refcounted `Bytes` so a clone detaches the blob from whatever
/// bulk-load arena produced it without copying bytes — the arena can then be
/// reset for the next batch while any clones already handed to the cache or
/// an analyzer keep their own reference.
#[derive(Debug, Clone)]
pub struct CachedBlob {
    pub hash: ObjectHash,
    data: Bytes,
}

impl CachedBlob {
    /// Wrap `data` loaded under `hash`. The bytes are moved into a `Bytes`,
    /// detaching them from any caller-owned arena.
    pub fn new(hash: ObjectHash, data: Vec<u8>) -> Self {
        Self {
            hash,
            data: Bytes::from(data),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cheap null-byte scan of the first `BINARY_SNIFF_WINDOW` bytes.
    pub fn is_binary(&self) -> bool {
        let window = &self.data[..self.data.len().min(BINARY_SNIFF_WINDOW)];
        window.contains(&0u8)
    }

    /// Count newline-delimited lines, failing with `Binary` if the sniff
    /// detected a null byte.
    pub fn count_lines(&self) -> Result<usize, CoreError> {
        if self.is_binary() {
            return Err(CoreError::Binary);
        }
        if self.data.is_empty() {
            return Ok(0);
        }
        let newlines = self.data.iter().filter(|&&b| b == b'\n').count();
        let trailing_partial = if self.data.last() == Some(&b'\n') { 0 } else { 1 };
        Ok(newlines + trailing_partial)
    }

    /// Split into `\n`-delimited lines as owned strings (lossy for non-UTF8
    /// content), used by the diff pipeline's local fallback.
    pub fn lines_lossy(&self) -> Vec<String> {
        if self.data.is_empty() {
            return Vec::new();
        }
        String::from_utf8_lossy(&self.data)
            .lines()
            .map(|s| s.to_string())
            .collect()
    }
}
