//! Bloom filter over 32-bit host keys
//!
//! Each key sets four bits. The bit positions come from one 32-bit value by
//! rotating it left by 8 bits before each round, so every byte of the key
//! leads one index.
//!
//! File layout (little-endian): `version: u32 | key_count: u32 |
//! key_count * 8 bytes of keys | byte_size: u32 | bit array`. This filter
//! uses no per-file keys, so `key_count` is always written as 0. A file whose
//! bit array is not exactly `byte_size` bytes long is rejected.

use crate::Result;
use bytes::{Buf, BufMut};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current filter file version
pub const BLOOM_FILTER_VERSION: u32 = 1;

const NUM_HASH_ROUNDS: usize = 4;
const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    bit_size: usize,
}

impl BloomFilter {
    /// A zeroed filter of at least `bit_size` bits
    pub fn new(bit_size: usize) -> Self {
        let byte_size = bit_size / 8 + 1;
        Self {
            data: vec![0; byte_size],
            bit_size: byte_size * 8,
        }
    }

    /// A filter sized for `keys` keys at `bits_per_key`, but never for fewer than `min_keys`
    pub fn with_capacity(keys: usize, min_keys: usize, bits_per_key: usize) -> Self {
        Self::new(keys.max(min_keys).saturating_mul(bits_per_key))
    }

    pub fn bit_size(&self) -> usize {
        self.bit_size
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn insert(&mut self, hash: u32) {
        for index in self.indices(hash) {
            self.data[index / 8] |= 1 << (index % 8);
        }
    }

    /// Whether all four bits for `hash` are set. Never false for an inserted key.
    pub fn exists(&self, hash: u32) -> bool {
        self.indices(hash)
            .into_iter()
            .all(|index| self.data[index / 8] & (1 << (index % 8)) != 0)
    }

    fn indices(&self, hash: u32) -> [usize; NUM_HASH_ROUNDS] {
        let mut h = hash;
        let mut out = [0; NUM_HASH_ROUNDS];
        for slot in &mut out {
            h = h.rotate_left(8);
            *slot = h as usize % self.bit_size;
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.data.len());
        buf.put_u32_le(BLOOM_FILTER_VERSION);
        buf.put_u32_le(0);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf
    }

    /// Parse a filter file. Anything but a well-formed current-version file is `None`.
    pub fn from_bytes(mut bytes: &[u8]) -> Option<Self> {
        if bytes.remaining() < HEADER_SIZE {
            return None;
        }
        let version = bytes.get_u32_le();
        let key_count = bytes.get_u32_le();
        let byte_size = bytes.get_u32_le() as usize;
        if version != BLOOM_FILTER_VERSION || key_count != 0 {
            return None;
        }
        if byte_size == 0 || bytes.len() != byte_size {
            return None;
        }
        Some(Self {
            data: bytes.to_vec(),
            bit_size: bytes.len() * 8,
        })
    }

    /// Load a filter file. A missing or unusable file yields `Ok(None)`.
    pub fn load_file(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No bloom filter file at {:?}", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let filter = Self::from_bytes(&bytes);
        if filter.is_none() {
            warn!("Ignoring unusable bloom filter file {:?}", path);
        }
        Ok(filter)
    }

    /// Write the filter, replacing any previous file atomically.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, self.to_bytes())?;
        std::fs::rename(&tmp, path)?;
        debug!("Wrote {} byte bloom filter to {:?}", self.data.len(), path);
        Ok(())
    }
}
