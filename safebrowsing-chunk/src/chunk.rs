//! Decoded update chunks as handed over by the update fetcher

use crate::{ChunkId, ChunkRange, ListId, SbEntry};
use safebrowsing_hash::{FullHash, SbPrefix};
use serde::{Deserialize, Serialize};

/// One host key's contribution within a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbChunkHost {
    pub host: SbPrefix,
    pub entry: SbEntry,
}

/// An add or sub chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbChunk {
    pub chunk_number: ChunkId,
    /// Filled in by the database from the list name at insert time
    #[serde(default)]
    pub list_id: ListId,
    pub is_add: bool,
    #[serde(default)]
    pub hosts: Vec<SbChunkHost>,
}

impl SbChunk {
    pub fn new(chunk_number: ChunkId, is_add: bool) -> Self {
        Self {
            chunk_number,
            list_id: 0,
            is_add,
            hosts: Vec::new(),
        }
    }

    pub fn with_host(mut self, host: SbPrefix, entry: SbEntry) -> Self {
        self.hosts.push(SbChunkHost { host, entry });
        self
    }
}

/// Request to forget a set of add chunks (AddDel) or sub chunks (SubDel)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbChunkDelete {
    pub list_name: String,
    pub is_sub_del: bool,
    pub chunk_del: Vec<ChunkRange>,
}

/// One full hash returned by a GetHash request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbFullHashResult {
    pub hash: FullHash,
    pub list_name: String,
    pub add_chunk_id: ChunkId,
}

/// Chunks known locally for one list, as canonical range strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbListChunkRanges {
    pub name: String,
    pub adds: String,
    pub subs: String,
}
