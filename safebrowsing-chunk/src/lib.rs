//! Chunk model for the Safe Browsing prefix database
//!
//! Updates arrive as numbered add and sub chunks. Each chunk contributes one
//! [`SbEntry`] per host key, and all entries for one host key live together
//! in an [`SbHostInfo`] record whose merge rules reconcile adds and subs that
//! arrive in any order.

pub mod chunk;
pub mod chunk_range;
pub mod entry;
pub mod host_info;

pub use chunk::{SbChunk, SbChunkDelete, SbChunkHost, SbFullHashResult, SbListChunkRanges};
pub use chunk_range::{
    chunks_to_ranges, is_chunk_in_range, ranges_to_chunks, ranges_to_string, string_to_ranges,
    ChunkRange,
};
pub use entry::{EntryPrefixes, EntryType, SbEntry, SubFullHash, SubPrefix, ENTRY_HEADER_SIZE};
pub use host_info::{HostMatch, SbHostInfo};

use thiserror::Error;

/// Chunk numbers are positive; 0 is reserved as "unset"
pub type ChunkId = u32;

/// Small integer assigned to a list name by the database
pub type ListId = u32;

/// Malware list name
pub const MALWARE_LIST: &str = "goog-malware-shavar";

/// Phishing list name
pub const PHISHING_LIST: &str = "goog-phish-shavar";

/// Error type for chunk parsing and entry decoding
#[derive(Debug, Error)]
pub enum ChunkError {
    /// A chunk range or range list could not be parsed
    #[error("Invalid chunk range: {0}")]
    InvalidRange(String),

    /// A packed entry ended before all of its slots were read
    #[error("Truncated entry: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// Entry header carries an unknown type code
    #[error("Unknown entry type: {0}")]
    UnknownEntryType(u32),
}

/// Result type for chunk operations
pub type Result<T> = std::result::Result<T, ChunkError>;
