//! Cache of full-hash (GetHash) responses
//!
//! Responses are keyed by the prefix they were requested for. Each cached
//! hash expires after the staleness window unless the database was updated
//! within that window. Prefixes whose request came back empty are remembered
//! separately until the next update cycle.

use safebrowsing_chunk::{ChunkId, ListId};
use safebrowsing_hash::{FullHash, SbPrefix};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

/// Default staleness window for cached full hashes
pub const DEFAULT_CACHE_STALENESS: Duration = Duration::from_secs(45 * 60);

/// One cached full hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHash {
    pub full_hash: FullHash,
    pub list_id: ListId,
    pub add_chunk_id: ChunkId,
    pub received: SystemTime,
}

#[derive(Debug)]
pub struct HashCache {
    entries: HashMap<SbPrefix, Vec<CachedHash>>,
    misses: HashSet<SbPrefix>,
    staleness: Duration,
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_STALENESS)
    }
}

impl HashCache {
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            misses: HashSet::new(),
            staleness,
        }
    }

    /// Record a GetHash response.
    ///
    /// An empty response marks every requested prefix as a miss.
    pub fn insert_results(&mut self, requested: &[SbPrefix], results: Vec<CachedHash>) {
        if results.is_empty() {
            self.misses.extend(requested.iter().copied());
            return;
        }

        for result in results {
            let prefix = result.full_hash.prefix();
            let cached = self.entries.entry(prefix).or_default();
            cached.retain(|c| c.full_hash != result.full_hash || c.list_id != result.list_id);
            cached.push(result);
        }
    }

    /// Fresh cached hashes for `prefix`. Expired entries are evicted.
    pub fn lookup(
        &mut self,
        prefix: SbPrefix,
        last_update: Option<SystemTime>,
        now: SystemTime,
    ) -> Vec<CachedHash> {
        let Some(cached) = self.entries.get_mut(&prefix) else {
            return Vec::new();
        };

        let threshold = now.checked_sub(self.staleness).unwrap_or(SystemTime::UNIX_EPOCH);
        let recently_updated = last_update.is_some_and(|t| t > threshold);
        cached.retain(|c| recently_updated || c.received > threshold);

        let fresh = cached.clone();
        if cached.is_empty() {
            self.entries.remove(&prefix);
        }
        fresh
    }

    pub fn is_miss(&self, prefix: SbPrefix) -> bool {
        self.misses.contains(&prefix)
    }

    /// Forget every recorded miss, at the start of an update cycle.
    pub fn clear_misses(&mut self) {
        self.misses.clear();
    }

    /// Drop cached hashes that came from an add chunk that was deleted.
    pub fn remove_chunk(&mut self, list_id: ListId, add_chunk_id: ChunkId) {
        self.entries.retain(|_, cached| {
            cached.retain(|c| c.list_id != list_id || c.add_chunk_id != add_chunk_id);
            !cached.is_empty()
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.misses.clear();
    }

    /// Number of cached full hashes
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn miss_count(&self) -> usize {
        self.misses.len()
    }
}
