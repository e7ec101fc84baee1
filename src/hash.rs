//! The opaque 20-byte content address used as the primary key throughout the
//! pipeline, cache, and checkpoint layers.
//!
//! `ObjectHash` carries no knowledge of what produced it (blob, tree, or
//! commit) — it is a pure hash value, equal by byte comparison, with a hex
//! `Display`/`FromStr` pair for logs and checkpoint manifests.

use std::{fmt::Display, hash::Hash, io, str::FromStr};

use serde::{Deserialize, Serialize};

/// Byte length of an `ObjectHash`.
pub const HASH_BYTES: usize = 20;

/// Opaque 20-byte content address. Equality and ordering are plain byte
/// comparison; the hex string form is used for logging and checkpoint keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash(pub [u8; HASH_BYTES]);

impl ObjectHash {
    /// An all-zero hash, used as a sentinel for "no object" (e.g. the `from`
    /// side of an `Insert` change).
    pub const ZERO: ObjectHash = ObjectHash([0u8; HASH_BYTES]);

    /// Build an `ObjectHash` directly from a byte array.
    pub const fn new(bytes: [u8; HASH_BYTES]) -> Self {
        ObjectHash(bytes)
    }

    /// Whether this hash is the all-zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_BYTES]
    }

    /// Parse a hash from exactly `HASH_BYTES` raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != HASH_BYTES {
            return Err(format!("expected {HASH_BYTES} bytes, got {}", bytes.len()));
        }
        let mut buf = [0u8; HASH_BYTES];
        buf.copy_from_slice(bytes);
        Ok(ObjectHash(buf))
    }

    /// Read a hash from a stream of exactly `HASH_BYTES` bytes.
    pub fn from_stream(reader: &mut impl io::Read) -> io::Result<Self> {
        let mut buf = [0u8; HASH_BYTES];
        reader.read_exact(&mut buf)?;
        Ok(ObjectHash(buf))
    }

    /// Hex-encoded form, always `2 * HASH_BYTES` characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_BYTES * 2 {
            return Err(format!(
                "expected a {}-character hex string, got {}",
                HASH_BYTES * 2,
                s.len()
            ));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_is_zero() {
        assert!(ObjectHash::ZERO.is_zero());
        assert!(!ObjectHash::new([1u8; HASH_BYTES]).is_zero());
    }

    #[test]
    fn hex_roundtrip() {
        let h = ObjectHash::new([0xab; HASH_BYTES]);
        let hex = h.to_string();
        assert_eq!(hex.len(), HASH_BYTES * 2);
        let parsed: ObjectHash = hex.parse().unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn from_str_rejects_wrong_length() {
        assert!("abcd".parse::<ObjectHash>().is_err());
    }

    #[test]
    fn equality_is_byte_comparison() {
        let a = ObjectHash::new([1u8; HASH_BYTES]);
        let b = ObjectHash::new([1u8; HASH_BYTES]);
        let c = ObjectHash::new([2u8; HASH_BYTES]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
