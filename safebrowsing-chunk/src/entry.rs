//! Per-host add/sub entries and their packed binary form
//!
//! On disk an entry is a 16-byte little-endian header
//! `list_id | chunk_id | type | prefix_count` followed by `prefix_count`
//! fixed-size slots whose size depends on the entry type.

use crate::{ChunkError, ChunkId, ListId, Result};
use bytes::{Buf, BufMut};
use safebrowsing_hash::{FullHash, SbPrefix, FULL_HASH_LENGTH, PREFIX_LENGTH};
use serde::{Deserialize, Serialize};

/// Size of the fixed entry header in bytes
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Discriminant stored in the entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EntryType {
    AddPrefix = 0,
    AddFullHash = 1,
    SubPrefix = 2,
    SubFullHash = 3,
}

impl EntryType {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::AddPrefix),
            1 => Ok(Self::AddFullHash),
            2 => Ok(Self::SubPrefix),
            3 => Ok(Self::SubFullHash),
            other => Err(ChunkError::UnknownEntryType(other)),
        }
    }

    pub fn is_add(self) -> bool {
        matches!(self, Self::AddPrefix | Self::AddFullHash)
    }

    /// Length of the hash stored in each slot
    pub fn hash_len(self) -> usize {
        match self {
            Self::AddPrefix | Self::SubPrefix => PREFIX_LENGTH,
            Self::AddFullHash | Self::SubFullHash => FULL_HASH_LENGTH,
        }
    }

    /// Size of one slot; sub slots carry a 4-byte add-chunk back-reference
    pub fn slot_size(self) -> usize {
        if self.is_add() {
            self.hash_len()
        } else {
            self.hash_len() + 4
        }
    }
}

/// A prefix retracted by a sub entry, tied to the add chunk it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubPrefix {
    pub add_chunk: ChunkId,
    pub prefix: SbPrefix,
}

/// A full hash retracted by a sub entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubFullHash {
    pub add_chunk: ChunkId,
    pub hash: FullHash,
}

/// The hashes carried by an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "hashes", rename_all = "snake_case")]
pub enum EntryPrefixes {
    AddPrefix(Vec<SbPrefix>),
    AddFullHash(Vec<FullHash>),
    SubPrefix(Vec<SubPrefix>),
    SubFullHash(Vec<SubFullHash>),
}

/// Comparable hash value of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotHash {
    Prefix(SbPrefix),
    Full(FullHash),
}

/// One add or sub chunk's contribution for one host key
///
/// For add entries `chunk_id` is the add chunk number. For sub entries
/// with no prefixes it is the add chunk being retracted as a whole; sub
/// entries with prefixes carry the add chunk per slot instead.
///
/// An add entry with no prefixes lists every path on its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbEntry {
    #[serde(default)]
    pub list_id: ListId,
    #[serde(default)]
    pub chunk_id: ChunkId,
    pub prefixes: EntryPrefixes,
}

impl SbEntry {
    pub fn new(list_id: ListId, chunk_id: ChunkId, prefixes: EntryPrefixes) -> Self {
        Self {
            list_id,
            chunk_id,
            prefixes,
        }
    }

    /// An add entry of 4-byte prefixes. An empty list blocks the whole host.
    pub fn add_prefixes(list_id: ListId, chunk_id: ChunkId, prefixes: Vec<SbPrefix>) -> Self {
        Self::new(list_id, chunk_id, EntryPrefixes::AddPrefix(prefixes))
    }

    pub fn add_full_hashes(list_id: ListId, chunk_id: ChunkId, hashes: Vec<FullHash>) -> Self {
        Self::new(list_id, chunk_id, EntryPrefixes::AddFullHash(hashes))
    }

    pub fn sub_prefixes(list_id: ListId, chunk_id: ChunkId, prefixes: Vec<SubPrefix>) -> Self {
        Self::new(list_id, chunk_id, EntryPrefixes::SubPrefix(prefixes))
    }

    pub fn sub_full_hashes(list_id: ListId, chunk_id: ChunkId, hashes: Vec<SubFullHash>) -> Self {
        Self::new(list_id, chunk_id, EntryPrefixes::SubFullHash(hashes))
    }

    /// A sub entry retracting everything `add_chunk` put on a host
    pub fn sub_whole_chunk(list_id: ListId, add_chunk: ChunkId) -> Self {
        Self::sub_prefixes(list_id, add_chunk, Vec::new())
    }

    pub fn entry_type(&self) -> EntryType {
        match self.prefixes {
            EntryPrefixes::AddPrefix(_) => EntryType::AddPrefix,
            EntryPrefixes::AddFullHash(_) => EntryType::AddFullHash,
            EntryPrefixes::SubPrefix(_) => EntryType::SubPrefix,
            EntryPrefixes::SubFullHash(_) => EntryType::SubFullHash,
        }
    }

    pub fn is_add(&self) -> bool {
        self.entry_type().is_add()
    }

    pub fn is_sub(&self) -> bool {
        !self.is_add()
    }

    pub fn prefix_count(&self) -> usize {
        match &self.prefixes {
            EntryPrefixes::AddPrefix(v) => v.len(),
            EntryPrefixes::AddFullHash(v) => v.len(),
            EntryPrefixes::SubPrefix(v) => v.len(),
            EntryPrefixes::SubFullHash(v) => v.len(),
        }
    }

    /// Encoded size: header plus one slot per prefix
    pub fn size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.prefix_count() * self.entry_type().slot_size()
    }

    /// The add chunk that slot `index` belongs to
    pub fn chunk_id_at_prefix(&self, index: usize) -> ChunkId {
        match &self.prefixes {
            EntryPrefixes::SubPrefix(v) => v[index].add_chunk,
            EntryPrefixes::SubFullHash(v) => v[index].add_chunk,
            EntryPrefixes::AddPrefix(_) | EntryPrefixes::AddFullHash(_) => self.chunk_id,
        }
    }

    fn slot_hash(&self, index: usize) -> SlotHash {
        match &self.prefixes {
            EntryPrefixes::AddPrefix(v) => SlotHash::Prefix(v[index]),
            EntryPrefixes::AddFullHash(v) => SlotHash::Full(v[index]),
            EntryPrefixes::SubPrefix(v) => SlotHash::Prefix(v[index].prefix),
            EntryPrefixes::SubFullHash(v) => SlotHash::Full(v[index].hash),
        }
    }

    /// Whether slot `index` of `self` cancels slot `other_index` of `other`.
    ///
    /// Only an add and a sub can cancel, and only when the hash lengths, the
    /// hashes and the add chunk they refer to are all equal.
    pub fn prefixes_match(&self, index: usize, other: &SbEntry, other_index: usize) -> bool {
        if self.is_add() == other.is_add() {
            return false;
        }
        if self.chunk_id_at_prefix(index) != other.chunk_id_at_prefix(other_index) {
            return false;
        }
        self.slot_hash(index) == other.slot_hash(other_index)
    }

    /// Remove the slot at `index`.
    pub fn remove_prefix(&mut self, index: usize) {
        match &mut self.prefixes {
            EntryPrefixes::AddPrefix(v) => {
                v.remove(index);
            }
            EntryPrefixes::AddFullHash(v) => {
                v.remove(index);
            }
            EntryPrefixes::SubPrefix(v) => {
                v.remove(index);
            }
            EntryPrefixes::SubFullHash(v) => {
                v.remove(index);
            }
        }
    }

    /// Append the packed form of this entry to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.list_id);
        buf.put_u32_le(self.chunk_id);
        buf.put_u32_le(self.entry_type() as u32);
        buf.put_u32_le(self.prefix_count() as u32);
        match &self.prefixes {
            EntryPrefixes::AddPrefix(v) => {
                for prefix in v {
                    buf.put_u32_le(*prefix);
                }
            }
            EntryPrefixes::AddFullHash(v) => {
                for hash in v {
                    buf.put_slice(hash.as_bytes());
                }
            }
            EntryPrefixes::SubPrefix(v) => {
                for sub in v {
                    buf.put_u32_le(sub.add_chunk);
                    buf.put_u32_le(sub.prefix);
                }
            }
            EntryPrefixes::SubFullHash(v) => {
                for sub in v {
                    buf.put_u32_le(sub.add_chunk);
                    buf.put_slice(sub.hash.as_bytes());
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.encode(&mut buf);
        buf
    }

    /// Read one entry from the front of `buf`, advancing it past the entry.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        ensure_remaining(buf, ENTRY_HEADER_SIZE)?;
        let list_id = buf.get_u32_le();
        let chunk_id = buf.get_u32_le();
        let entry_type = EntryType::from_u32(buf.get_u32_le())?;
        let count = buf.get_u32_le() as usize;

        let needed = count
            .checked_mul(entry_type.slot_size())
            .ok_or(ChunkError::Truncated {
                needed: usize::MAX,
                available: buf.remaining(),
            })?;
        ensure_remaining(buf, needed)?;

        let prefixes = match entry_type {
            EntryType::AddPrefix => {
                EntryPrefixes::AddPrefix((0..count).map(|_| buf.get_u32_le()).collect())
            }
            EntryType::AddFullHash => {
                EntryPrefixes::AddFullHash((0..count).map(|_| get_full_hash(buf)).collect())
            }
            EntryType::SubPrefix => EntryPrefixes::SubPrefix(
                (0..count)
                    .map(|_| SubPrefix {
                        add_chunk: buf.get_u32_le(),
                        prefix: buf.get_u32_le(),
                    })
                    .collect(),
            ),
            EntryType::SubFullHash => EntryPrefixes::SubFullHash(
                (0..count)
                    .map(|_| SubFullHash {
                        add_chunk: buf.get_u32_le(),
                        hash: get_full_hash(buf),
                    })
                    .collect(),
            ),
        };

        Ok(Self {
            list_id,
            chunk_id,
            prefixes,
        })
    }
}

fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(ChunkError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn get_full_hash<B: Buf>(buf: &mut B) -> FullHash {
    let mut bytes = [0u8; FULL_HASH_LENGTH];
    buf.copy_to_slice(&mut bytes);
    FullHash::new(bytes)
}
