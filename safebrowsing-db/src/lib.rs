//! Prefix database for Safe Browsing
//!
//! This crate stores the add/sub chunk data delivered by the update service
//! and answers URL lookups against it. Host records live in a [`Store`]
//! ([`RedbStore`] on disk, [`MemoryStore`] in memory); a [`BloomFilter`] over
//! host keys lets most lookups skip the store entirely. [`BloomDatabase`]
//! drives ingestion in time-bounded slices so that a large update never
//! blocks lookups for long.

pub mod bloom;
pub mod database;
pub mod hash_cache;
pub mod memory_store;
pub mod redb;
pub mod store;

pub use bloom::BloomFilter;
pub use database::{filter_path_for, need_to_check_url, BloomDatabase, UrlCheck, WorkStatus};
pub use hash_cache::{CachedHash, HashCache};
pub use memory_store::MemoryStore;
pub use redb::RedbStore;
pub use store::{HostKeyScan, Store};

use safebrowsing_chunk::{SbChunk, SbChunkDelete, SbFullHashResult, SbListChunkRanges};
use safebrowsing_hash::SbPrefix;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Default longest stretch of ingestion work before yielding
pub const DEFAULT_MAX_SLICE: Duration = Duration::from_millis(100);

/// Default delay between the last update and writing the filter file
pub const DEFAULT_FILTER_WRITE_DELAY: Duration = Duration::from_secs(60);

/// Default pause in disk writes after a resume from sleep
pub const DEFAULT_RESUME_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Default Bloom filter bits per host key
pub const DEFAULT_BLOOM_SIZE_RATIO: usize = 25;

/// Default smallest number of host keys a Bloom filter is sized for
pub const DEFAULT_BLOOM_MIN_KEYS: usize = 250_000;

/// Error types for database operations
#[derive(thiserror::Error, Debug)]
pub enum DatabaseError {
    /// The store failed or returned malformed data; the database must be reset
    #[error("Database corrupt: {0}")]
    Corrupt(String),

    /// The store file is held open by another database instance
    #[error("Database already open: {0:?}")]
    AlreadyOpen(PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk error
    #[error("Chunk error: {0}")]
    Chunk(#[from] safebrowsing_chunk::ChunkError),

    /// Hash error
    #[error("Hash error: {0}")]
    Hash(#[from] safebrowsing_hash::HashError),
}

impl DatabaseError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Store location; `None` selects the default cache path
    pub path: Option<PathBuf>,

    /// Bloom filter bits per host key
    pub bloom_size_ratio: usize,

    /// The Bloom filter is never sized for fewer keys than this
    pub bloom_min_keys: usize,

    /// Longest stretch of ingestion work per slice
    pub max_slice: Duration,

    /// Debounce before the filter file is rewritten
    pub filter_write_delay: Duration,

    /// Pause in disk writes after [`Database::handle_resume`]
    pub resume_cooldown: Duration,

    /// Apply updates and write the filter before returning
    pub synchronous: bool,

    /// How long a cached full hash stays valid
    pub cache_staleness: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            bloom_size_ratio: DEFAULT_BLOOM_SIZE_RATIO,
            bloom_min_keys: DEFAULT_BLOOM_MIN_KEYS,
            max_slice: DEFAULT_MAX_SLICE,
            filter_write_delay: DEFAULT_FILTER_WRITE_DELAY,
            resume_cooldown: DEFAULT_RESUME_COOLDOWN,
            synchronous: false,
            cache_staleness: hash_cache::DEFAULT_CACHE_STALENESS,
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Host records in the store
    pub host_records: u64,

    /// Known add chunks across all lists
    pub add_chunks: usize,

    /// Known sub chunks across all lists
    pub sub_chunks: usize,

    /// Chunks waiting to be applied
    pub pending_chunks: usize,

    /// Delete commands and add-chunk retractions not yet applied
    pub pending_add_dels: usize,

    /// Size of the active Bloom filter, 0 if none is loaded
    pub bloom_bits: usize,

    /// Cached full hashes
    pub cached_full_hashes: usize,

    /// Prefixes known to have no full hashes
    pub missed_prefixes: usize,
}

impl fmt::Display for DatabaseStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Database stats: {} host records, {} add chunks, {} sub chunks, {} pending chunks, \
             {} pending deletes, {} filter bits, {} cached hashes, {} missed prefixes",
            self.host_records,
            self.add_chunks,
            self.sub_chunks,
            self.pending_chunks,
            self.pending_add_dels,
            self.bloom_bits,
            self.cached_full_hashes,
            self.missed_prefixes
        )
    }
}

/// Database interface for Safe Browsing
///
/// All methods are meant to be called from the single thread or task that
/// owns the database. Only the filter handle may be shared.
pub trait Database {
    /// Queue chunks for `list_name`. Chunks already known are skipped when
    /// their turn comes.
    fn insert_chunks(&mut self, list_name: &str, chunks: Vec<SbChunk>) -> Result<()>;

    /// Forget add chunks (retracting their prefixes) or sub chunks.
    fn delete_chunks(&mut self, deletes: Vec<SbChunkDelete>) -> Result<()>;

    /// Look up a URL. Never fails: store errors are recorded and reported
    /// by [`corruption_detected`](Database::corruption_detected).
    fn contains_url(&mut self, url: &str) -> UrlCheck;

    /// Cache a GetHash response for `requested` prefixes.
    fn cache_hash_results(&mut self, requested: &[SbPrefix], results: &[SbFullHashResult]);

    /// Chunk ranges known per list
    fn get_lists_info(&mut self) -> Result<Vec<SbListChunkRanges>>;

    fn update_started(&mut self) -> Result<()>;
    fn update_finished(&mut self, success: bool) -> Result<()>;

    /// The system resumed from sleep; hold off disk writes for a while.
    fn handle_resume(&mut self);

    /// Run one slice of queued work.
    fn process_pending(&mut self) -> Result<WorkStatus>;

    /// Delete all data and start over with an empty store and filter.
    fn reset(&mut self) -> Result<()>;

    /// Whether a lookup hit a store error since the last reset
    fn corruption_detected(&self) -> bool;

    /// Shared handle to the published filter snapshot
    fn filter_handle(&self) -> Arc<arc_swap::ArcSwapOption<BloomFilter>>;

    fn stats(&self) -> DatabaseStats;
}
