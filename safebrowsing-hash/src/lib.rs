//! Hash primitives for the Safe Browsing prefix database
//!
//! Every lookup key in the database is derived from the SHA-256 digest of a
//! `host + path` expression. The complete 32-byte digest is a [`FullHash`];
//! its first four bytes, read as a little-endian integer, form the
//! [`SbPrefix`] that host records and the Bloom filter actually store.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Length of a hash prefix in bytes
pub const PREFIX_LENGTH: usize = 4;

/// Length of a full SHA-256 hash in bytes
pub const FULL_HASH_LENGTH: usize = 32;

/// A 4-byte truncated SHA-256 hash, stored as the little-endian integer of
/// the first four digest bytes.
pub type SbPrefix = u32;

/// Error type for hash operations
#[derive(Debug, Error)]
pub enum HashError {
    /// Invalid hash length
    #[error("Invalid hash length: {0}, expected {FULL_HASH_LENGTH}")]
    InvalidLength(usize),

    /// Invalid hash format
    #[error("Invalid hash format: {0}")]
    InvalidFormat(String),
}

/// Result type for hash operations
pub type Result<T> = std::result::Result<T, HashError>;

/// Compute the SHA-256 digest of `bytes`.
pub fn sha256(bytes: &[u8]) -> FullHash {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; FULL_HASH_LENGTH];
    out.copy_from_slice(&digest);
    FullHash(out)
}

/// Compute the prefix of a `host + path` expression.
pub fn prefix_for(pattern: &str) -> SbPrefix {
    FullHash::from_pattern(pattern).prefix()
}

/// A full 32-byte SHA-256 hash of a `host + path` expression
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FullHash([u8; FULL_HASH_LENGTH]);

impl FullHash {
    /// Wrap raw digest bytes
    pub const fn new(bytes: [u8; FULL_HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Hash a pattern string
    pub fn from_pattern(pattern: &str) -> Self {
        sha256(pattern.as_bytes())
    }

    /// Create a full hash from a byte slice, which must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; FULL_HASH_LENGTH] = bytes
            .try_into()
            .map_err(|_| HashError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    /// A hash whose leading bytes encode `prefix` and whose remaining bytes are zero.
    ///
    /// Only the prefix of such a hash is meaningful; it is useful for probing
    /// prefix-only entries.
    pub fn with_prefix(prefix: SbPrefix) -> Self {
        let mut bytes = [0u8; FULL_HASH_LENGTH];
        bytes[..PREFIX_LENGTH].copy_from_slice(&prefix.to_le_bytes());
        Self(bytes)
    }

    /// The 4-byte prefix of this hash
    pub fn prefix(&self) -> SbPrefix {
        let mut bytes = [0u8; PREFIX_LENGTH];
        bytes.copy_from_slice(&self.0[..PREFIX_LENGTH]);
        SbPrefix::from_le_bytes(bytes)
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; FULL_HASH_LENGTH] {
        &self.0
    }

    /// Convert the hash to a hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hash from a 64-character hexadecimal string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| HashError::InvalidFormat(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl From<[u8; FULL_HASH_LENGTH]> for FullHash {
    fn from(bytes: [u8; FULL_HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for FullHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for FullHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FullHash({})", self.to_hex())
    }
}

impl fmt::Display for FullHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for FullHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FullHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_hash_from_pattern() {
        // SHA-256("abc")
        let hash = FullHash::from_pattern("abc");
        assert_eq!(
            hash.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_prefix_is_little_endian() {
        let hash = FullHash::from_pattern("abc");
        assert_eq!(hash.prefix(), 0xbf16_78ba);
        assert_eq!(prefix_for("abc"), hash.prefix());
    }

    #[test]
    fn test_with_prefix() {
        let hash = FullHash::with_prefix(0x0100_0000);
        assert_eq!(hash.prefix(), 0x0100_0000);
        assert_eq!(&hash.as_bytes()[..4], &[0, 0, 0, 1]);
        assert!(hash.as_bytes()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(matches!(
            FullHash::from_slice(&[1, 2, 3, 4]),
            Err(HashError::InvalidLength(4))
        ));
        assert!(FullHash::from_slice(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_hex() {
        let hash = FullHash::from_pattern("example.com/");
        let parsed = FullHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(parsed, hash);
        assert!(FullHash::from_hex("zz").is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = FullHash::from_pattern("abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: FullHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
