//! Bloom-filter fronted chunk database
//!
//! Chunks are queued on insert and applied host by host in slices bounded
//! by [`DatabaseConfig::max_slice`]. Each slice is one store transaction.
//! Once the queues drain, the filter file is rewritten after a debounce
//! delay; it is deleted as soon as new work arrives so that a crash mid-update
//! forces a rebuild from the store on the next open.

use crate::hash_cache::{CachedHash, HashCache};
use crate::store::HostKeyScan;
use crate::{
    BloomFilter, Database, DatabaseConfig, DatabaseStats, MemoryStore, RedbStore, Result, Store,
};
use arc_swap::ArcSwapOption;
use safebrowsing_chunk::{
    chunks_to_ranges, is_chunk_in_range, ranges_to_string, ChunkId, ChunkRange, ListId,
    SbChunk, SbChunkDelete, SbEntry, SbFullHashResult, SbHostInfo, SbListChunkRanges,
};
use safebrowsing_hash::SbPrefix;
use safebrowsing_url::{canonicalize_url, generate_full_hashes, generate_host_keys};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Suffix appended to the store path to name the filter file
pub const FILTER_FILE_SUFFIX: &str = " Filter 2";

/// Host keys read per pull while rebuilding the filter
const REBUILD_BATCH: usize = 256;

/// What the driving loop should do after [`Database::process_pending`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Nothing queued
    Idle,
    /// More work queued; call again after handling other requests
    Busy,
    /// Nothing to do before the given time
    WaitUntil(Instant),
}

/// Outcome of a URL lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlCheck {
    /// List of an authoritative match (full-hash or whole-host add)
    pub matching_list: Option<String>,
    /// Matching prefixes that need full-hash confirmation
    pub prefix_hits: Vec<SbPrefix>,
    /// Cached full hashes matching the URL
    pub full_hits: Vec<SbFullHashResult>,
    /// Time of the last completed update
    pub last_update: Option<SystemTime>,
}

impl UrlCheck {
    /// Whether the URL may be listed
    pub fn is_listed(&self) -> bool {
        self.matching_list.is_some() || !self.prefix_hits.is_empty()
    }
}

/// Filter file path for a store at `store_path`
pub fn filter_path_for(store_path: &Path) -> PathBuf {
    let mut name = store_path.with_extension("").into_os_string();
    name.push(FILTER_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Whether `url` might be listed according to a published filter.
///
/// Safe to call from any thread. Without a filter every URL needs checking.
pub fn need_to_check_url(filter: &ArcSwapOption<BloomFilter>, url: &str) -> bool {
    let Some(filter) = filter.load_full() else {
        return true;
    };
    match canonicalize_url(url) {
        Ok(canonical) => generate_host_keys(&canonical)
            .into_iter()
            .any(|key| filter.exists(key)),
        Err(e) => {
            debug!("Not checking unparseable URL {}: {}", url, e);
            false
        }
    }
}

struct PendingChunk {
    chunk: SbChunk,
    next_host: usize,
    started: bool,
}

struct PendingDelete {
    list_id: ListId,
    is_sub_del: bool,
    ranges: Vec<ChunkRange>,
}

struct PendingAddDel {
    list_id: ListId,
    chunk_id: ChunkId,
    hosts: Vec<SbPrefix>,
    next_host: usize,
}

/// Queued ingestion work, applied strictly in order
enum Pending {
    Chunk(PendingChunk),
    Delete(PendingDelete),
    AddDel(PendingAddDel),
}

struct Rebuild {
    filter: BloomFilter,
    scan: HostKeyScan,
}

/// Chunk database over a [`Store`], fronted by a Bloom filter of host keys
pub struct BloomDatabase<S> {
    store: S,
    config: DatabaseConfig,
    filter_path: Option<PathBuf>,

    /// Filter used by this database; complete for the store whenever set
    filter: Option<BloomFilter>,
    /// Snapshot shared with other threads, replaced wholesale
    published: Arc<ArcSwapOption<BloomFilter>>,
    publish_needed: bool,
    rebuild: Option<Rebuild>,

    pending: VecDeque<Pending>,

    list_names: HashMap<ListId, String>,
    hash_cache: HashCache,
    last_update: Option<SystemTime>,

    filter_write_needed: bool,
    filter_write_at: Option<Instant>,
    resume_until: Option<Instant>,
    deleted_since_update: bool,
    corrupt: bool,
}

impl BloomDatabase<RedbStore> {
    /// Open the on-disk database at `config.path`, or the default location.
    pub fn open_redb(config: DatabaseConfig) -> Result<Self> {
        let path = match &config.path {
            Some(path) => path.clone(),
            None => RedbStore::default_path()?,
        };
        let store = RedbStore::open(path)?;
        Self::open(store, config)
    }
}

impl BloomDatabase<MemoryStore> {
    pub fn in_memory(config: DatabaseConfig) -> Result<Self> {
        Self::open(MemoryStore::new(), config)
    }
}

impl<S: Store> BloomDatabase<S> {
    /// Wrap an opened store, loading the filter file or scheduling a rebuild.
    pub fn open(store: S, config: DatabaseConfig) -> Result<Self> {
        let filter_path = store.path().map(filter_path_for);
        let hash_cache = HashCache::new(config.cache_staleness);

        let mut db = Self {
            store,
            config,
            filter_path,
            filter: None,
            published: Arc::new(ArcSwapOption::empty()),
            publish_needed: false,
            rebuild: None,
            pending: VecDeque::new(),
            list_names: HashMap::new(),
            hash_cache,
            last_update: None,
            filter_write_needed: false,
            filter_write_at: None,
            resume_until: None,
            deleted_since_update: false,
            corrupt: false,
        };

        db.load_list_names()?;

        let loaded = match &db.filter_path {
            Some(path) => BloomFilter::load_file(path).unwrap_or_else(|e| {
                warn!("Failed to read bloom filter {:?}: {}", path, e);
                None
            }),
            None => None,
        };

        match loaded {
            Some(filter) => {
                info!("Loaded {} bit bloom filter", filter.bit_size());
                db.filter = Some(filter);
                db.publish_needed = true;
                db.publish();
            }
            None if db.store.host_count()? == 0 => {
                db.filter = Some(db.empty_filter());
                db.filter_write_needed = true;
                db.publish_needed = true;
                db.publish();
            }
            None => db.start_rebuild()?,
        }

        if db.config.synchronous {
            db.drain()?;
        }
        Ok(db)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn filter_path(&self) -> Option<&Path> {
        self.filter_path.as_deref()
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.last_update
    }

    pub fn has_pending_work(&self) -> bool {
        !self.pending.is_empty() || self.rebuild.is_some()
    }

    fn empty_filter(&self) -> BloomFilter {
        BloomFilter::with_capacity(0, self.config.bloom_min_keys, self.config.bloom_size_ratio)
    }

    fn load_list_names(&mut self) -> Result<()> {
        self.list_names = self
            .store
            .lists()?
            .into_iter()
            .map(|(name, id)| (id, name))
            .collect();
        Ok(())
    }

    fn list_name(&self, list_id: ListId) -> String {
        self.list_names
            .get(&list_id)
            .cloned()
            .unwrap_or_else(|| list_id.to_string())
    }

    fn resolve_list(&mut self, name: &str) -> Result<ListId> {
        let id = self.store.list_id(name)?;
        self.list_names.entry(id).or_insert_with(|| name.to_string());
        Ok(id)
    }

    fn publish(&mut self) {
        if !self.publish_needed {
            return;
        }
        self.published
            .store(self.filter.as_ref().map(|f| Arc::new(f.clone())));
        self.publish_needed = false;
    }

    /// Whether the filter proves `host` has no record
    fn filter_excludes(&self, host: SbPrefix) -> bool {
        self.filter.as_ref().is_some_and(|f| !f.exists(host))
    }

    fn note_host_key(&mut self, host: SbPrefix) {
        if let Some(filter) = &mut self.filter {
            if !filter.exists(host) {
                filter.insert(host);
                self.publish_needed = true;
            }
        }
        if let Some(rebuild) = &mut self.rebuild {
            rebuild.filter.insert(host);
        }
    }

    fn invalidate_filter_file(&mut self) {
        self.filter_write_needed = true;
        self.filter_write_at = None;
        if let Some(path) = &self.filter_path {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed bloom filter file {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove bloom filter file {:?}: {}", path, e),
            }
        }
    }

    fn write_filter(&mut self) -> Result<()> {
        if let (Some(path), Some(filter)) = (&self.filter_path, &self.filter) {
            filter.write_file(path)?;
            info!("Wrote bloom filter to {:?}", path);
        }
        self.filter_write_needed = false;
        self.filter_write_at = None;
        Ok(())
    }

    fn start_rebuild(&mut self) -> Result<()> {
        let keys = self.store.host_count()? as usize;
        info!("Rebuilding bloom filter for {} host records", keys);
        self.rebuild = Some(Rebuild {
            filter: BloomFilter::with_capacity(
                keys,
                self.config.bloom_min_keys,
                self.config.bloom_size_ratio,
            ),
            scan: HostKeyScan::new(REBUILD_BATCH),
        });
        Ok(())
    }

    /// Start a rebuild if the filter holds more keys than it was sized for.
    fn check_filter_capacity(&mut self) -> Result<()> {
        if self.rebuild.is_some() {
            return Ok(());
        }
        let Some(filter) = &self.filter else {
            return Ok(());
        };
        let capacity = filter.bit_size() / self.config.bloom_size_ratio.max(1);
        let keys = self.store.host_count()? as usize;
        if keys > capacity {
            info!(
                "Bloom filter sized for {} keys holds {}, resizing",
                capacity, keys
            );
            self.start_rebuild()?;
        }
        Ok(())
    }

    /// Read, merge and write back one host record.
    fn update_info(&mut self, host: SbPrefix, entry: SbEntry, persist: bool) -> Result<()> {
        let existing = if self.filter_excludes(host) {
            None
        } else {
            self.store.get_host(host)?
        };

        let mut info = match &existing {
            Some(bytes) => SbHostInfo::from_bytes(bytes).unwrap_or_else(|e| {
                warn!("Dropping invalid host record {:08x}: {}", host, e);
                SbHostInfo::new()
            }),
            None => SbHostInfo::new(),
        };

        if entry.is_add() {
            info.add_prefixes(entry);
        } else {
            info.remove_prefixes(entry, persist);
        }

        if info.is_empty() {
            if existing.is_some() {
                self.store.delete_host(host)?;
            }
        } else {
            self.store.put_host(host, &info.to_bytes())?;
            self.note_host_key(host);
        }
        Ok(())
    }

    /// Apply the next piece of a chunk. Returns true once the chunk is done.
    fn step_chunk(&mut self, pending: &mut PendingChunk) -> Result<bool> {
        let chunk = &pending.chunk;
        if !pending.started {
            pending.started = true;
            if chunk.chunk_number == 0 {
                warn!("Ignoring chunk with id 0");
                return Ok(true);
            }

            let known = if chunk.is_add {
                self.store.has_add_chunk(chunk.list_id, chunk.chunk_number)?
            } else {
                self.store.has_sub_chunk(chunk.list_id, chunk.chunk_number)?
            };
            if known {
                debug!(
                    "Skipping known {} chunk {} of list {}",
                    if chunk.is_add { "add" } else { "sub" },
                    chunk.chunk_number,
                    chunk.list_id
                );
                return Ok(true);
            }

            if chunk.is_add {
                let mut hosts: Vec<SbPrefix> = chunk.hosts.iter().map(|h| h.host).collect();
                hosts.sort_unstable();
                hosts.dedup();
                self.store
                    .put_add_chunk(chunk.list_id, chunk.chunk_number, &hosts)?;
            } else {
                self.store
                    .put_sub_chunk(chunk.list_id, chunk.chunk_number)?;
            }
        }

        if let Some(host) = pending.chunk.hosts.get(pending.next_host) {
            let (key, entry) = (host.host, host.entry.clone());
            pending.next_host += 1;
            self.update_info(key, entry, true)?;
        }
        Ok(pending.next_host >= pending.chunk.hosts.len())
    }

    fn step_add_del(&mut self, pending: &mut PendingAddDel) -> Result<bool> {
        if let Some(&host) = pending.hosts.get(pending.next_host) {
            pending.next_host += 1;
            let entry = SbEntry::sub_whole_chunk(pending.list_id, pending.chunk_id);
            self.update_info(host, entry, false)?;
        }
        Ok(pending.next_host >= pending.hosts.len())
    }

    /// Retract the stored chunks a delete command covers.
    ///
    /// Only chunk ids present in the store are visited, so a range may span
    /// any number of ids. The host retractions of deleted add chunks go to
    /// the front of the queue, ahead of anything queued after the delete.
    fn apply_delete(&mut self, delete: PendingDelete) -> Result<()> {
        let chunk_ids: Vec<ChunkId> = self
            .store
            .chunk_ids(delete.list_id, !delete.is_sub_del)?
            .into_iter()
            .filter(|id| is_chunk_in_range(*id, &delete.ranges))
            .collect();

        let mut add_dels = Vec::new();
        for &chunk_id in &chunk_ids {
            if delete.is_sub_del {
                self.store.delete_sub_chunk(delete.list_id, chunk_id)?;
                continue;
            }
            let Some(hosts) = self.store.add_chunk_hosts(delete.list_id, chunk_id)? else {
                continue;
            };
            self.store.delete_add_chunk(delete.list_id, chunk_id)?;
            self.hash_cache.remove_chunk(delete.list_id, chunk_id);
            add_dels.push(Pending::AddDel(PendingAddDel {
                list_id: delete.list_id,
                chunk_id,
                hosts,
                next_host: 0,
            }));
        }
        for add_del in add_dels.into_iter().rev() {
            self.pending.push_front(add_del);
        }

        debug!(
            "Deleted {} {} chunks {} of {}",
            chunk_ids.len(),
            if delete.is_sub_del { "sub" } else { "add" },
            ranges_to_string(&delete.ranges),
            self.list_name(delete.list_id)
        );
        Ok(())
    }

    /// Feed a batch of host keys into the rebuilding filter.
    fn step_rebuild(&mut self) -> Result<()> {
        let Some(rebuild) = &mut self.rebuild else {
            return Ok(());
        };
        for _ in 0..REBUILD_BATCH {
            match rebuild.scan.next_key(&self.store)? {
                Some(key) => rebuild.filter.insert(key),
                None => break,
            }
        }
        if rebuild.scan.is_done() {
            if let Some(rebuild) = self.rebuild.take() {
                info!(
                    "Bloom filter rebuild finished, {} bits",
                    rebuild.filter.bit_size()
                );
                self.filter = Some(rebuild.filter);
                self.publish_needed = true;
                self.filter_write_needed = true;
            }
        }
        Ok(())
    }

    /// Run one unit of queued work, in queue order.
    fn step(&mut self) -> Result<()> {
        match self.pending.pop_front() {
            Some(Pending::Chunk(mut chunk)) => {
                if !self.step_chunk(&mut chunk)? {
                    self.pending.push_front(Pending::Chunk(chunk));
                }
            }
            Some(Pending::Delete(delete)) => self.apply_delete(delete)?,
            Some(Pending::AddDel(mut add_del)) => {
                if !self.step_add_del(&mut add_del)? {
                    self.pending.push_front(Pending::AddDel(add_del));
                }
            }
            None if self.rebuild.is_some() => self.step_rebuild()?,
            None => {}
        }
        Ok(())
    }

    /// Work until the queues are empty or `deadline` passes, in one transaction.
    fn process_slice(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.store.begin()?;
        while self.has_pending_work() {
            self.step()?;
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
        }
        self.store.commit()?;
        self.publish();
        Ok(())
    }

    fn on_drained(&mut self, now: Instant) -> Result<()> {
        if !self.filter_write_needed {
            return Ok(());
        }
        if self.config.synchronous {
            self.write_filter()
        } else {
            let at = now + self.config.filter_write_delay;
            debug!("Bloom filter write scheduled in {:?}", self.config.filter_write_delay);
            self.filter_write_at = Some(at);
            Ok(())
        }
    }

    /// Apply everything queued right away.
    fn drain(&mut self) -> Result<()> {
        if self.has_pending_work() {
            self.process_slice(None)?;
        }
        self.on_drained(Instant::now())
    }

    /// One slice of work as of `now`.
    pub fn process_pending_at(&mut self, now: Instant) -> Result<WorkStatus> {
        if let Some(until) = self.resume_until {
            if now < until {
                return Ok(WorkStatus::WaitUntil(until));
            }
            self.resume_until = None;
        }

        if self.has_pending_work() {
            self.process_slice(Some(now + self.config.max_slice))?;
            if self.has_pending_work() {
                return Ok(WorkStatus::Busy);
            }
            debug!("Pending work drained");
            self.on_drained(now)?;
        }

        match self.filter_write_at {
            Some(at) if now >= at => {
                self.write_filter()?;
                Ok(WorkStatus::Idle)
            }
            Some(at) => Ok(WorkStatus::WaitUntil(at)),
            None => Ok(WorkStatus::Idle),
        }
    }

    pub fn handle_resume_at(&mut self, now: Instant) {
        let until = now + self.config.resume_cooldown;
        info!(
            "Resumed from sleep, pausing disk writes for {:?}",
            self.config.resume_cooldown
        );
        self.resume_until = Some(until);
    }

    /// Look up a URL as of `now`.
    pub fn contains_url_at(&mut self, url: &str, now: SystemTime) -> UrlCheck {
        let mut check = UrlCheck {
            last_update: self.last_update,
            ..UrlCheck::default()
        };

        let canonical = match canonicalize_url(url) {
            Ok(canonical) => canonical,
            Err(e) => {
                debug!("Not checking unparseable URL {}: {}", url, e);
                return check;
            }
        };
        let candidates = generate_full_hashes(&canonical);

        for host in generate_host_keys(&canonical) {
            if self.filter_excludes(host) {
                continue;
            }
            let bytes = match self.store.get_host(host) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    error!("Store error during lookup: {}", e);
                    self.corrupt = true;
                    return UrlCheck {
                        last_update: self.last_update,
                        ..UrlCheck::default()
                    };
                }
            };
            let info = match SbHostInfo::from_bytes(&bytes) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Ignoring invalid host record {:08x}: {}", host, e);
                    continue;
                }
            };

            let found = info.contains(&candidates);
            if let Some(list_id) = found.list_id {
                check.matching_list = Some(self.list_name(list_id));
                check.prefix_hits.clear();
                return check;
            }
            for prefix in found.prefix_hits {
                if !check.prefix_hits.contains(&prefix) {
                    check.prefix_hits.push(prefix);
                }
            }
        }

        if check
            .prefix_hits
            .iter()
            .all(|prefix| self.hash_cache.is_miss(*prefix))
        {
            check.prefix_hits.clear();
            return check;
        }

        for prefix in check.prefix_hits.clone() {
            for cached in self.hash_cache.lookup(prefix, self.last_update, now) {
                if candidates.contains(&cached.full_hash) {
                    check.full_hits.push(SbFullHashResult {
                        hash: cached.full_hash,
                        list_name: self.list_name(cached.list_id),
                        add_chunk_id: cached.add_chunk_id,
                    });
                }
            }
        }
        check
    }

    pub fn cache_hash_results_at(
        &mut self,
        requested: &[SbPrefix],
        results: &[SbFullHashResult],
        now: SystemTime,
    ) {
        let ids: HashMap<&str, ListId> = self
            .list_names
            .iter()
            .map(|(id, name)| (name.as_str(), *id))
            .collect();

        let cached: Vec<CachedHash> = results
            .iter()
            .filter_map(|result| match ids.get(result.list_name.as_str()) {
                Some(&list_id) => Some(CachedHash {
                    full_hash: result.hash,
                    list_id,
                    add_chunk_id: result.add_chunk_id,
                    received: now,
                }),
                None => {
                    debug!("Not caching full hash for unknown list {}", result.list_name);
                    None
                }
            })
            .collect();

        if cached.is_empty() && !results.is_empty() {
            return;
        }
        self.hash_cache.insert_results(requested, cached);
    }

    fn stats_inner(&self) -> Result<DatabaseStats> {
        let pending_chunks = self
            .pending
            .iter()
            .filter(|p| matches!(p, Pending::Chunk(_)))
            .count();
        let mut stats = DatabaseStats {
            host_records: self.store.host_count()?,
            pending_chunks,
            pending_add_dels: self.pending.len() - pending_chunks,
            bloom_bits: self.filter.as_ref().map_or(0, BloomFilter::bit_size),
            cached_full_hashes: self.hash_cache.len(),
            missed_prefixes: self.hash_cache.miss_count(),
            ..DatabaseStats::default()
        };
        for (_, list_id) in self.store.lists()? {
            stats.add_chunks += self.store.chunk_ids(list_id, true)?.len();
            stats.sub_chunks += self.store.chunk_ids(list_id, false)?.len();
        }
        Ok(stats)
    }
}

impl<S: Store> Database for BloomDatabase<S> {
    fn insert_chunks(&mut self, list_name: &str, chunks: Vec<SbChunk>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let list_id = self.resolve_list(list_name)?;
        debug!("Queueing {} chunks for {}", chunks.len(), list_name);

        self.invalidate_filter_file();
        for mut chunk in chunks {
            chunk.list_id = list_id;
            for host in &mut chunk.hosts {
                host.entry.list_id = list_id;
                if chunk.is_add {
                    host.entry.chunk_id = chunk.chunk_number;
                }
            }
            self.pending.push_back(Pending::Chunk(PendingChunk {
                chunk,
                next_host: 0,
                started: false,
            }));
        }

        if self.config.synchronous {
            self.drain()?;
        }
        Ok(())
    }

    fn delete_chunks(&mut self, deletes: Vec<SbChunkDelete>) -> Result<()> {
        if deletes.is_empty() {
            return Ok(());
        }
        self.invalidate_filter_file();

        for delete in deletes {
            let list_id = self.resolve_list(&delete.list_name)?;
            debug!(
                "Queueing {} chunk delete {} for {}",
                if delete.is_sub_del { "sub" } else { "add" },
                ranges_to_string(&delete.chunk_del),
                delete.list_name
            );
            self.pending.push_back(Pending::Delete(PendingDelete {
                list_id,
                is_sub_del: delete.is_sub_del,
                ranges: delete.chunk_del,
            }));
        }
        self.deleted_since_update = true;

        if self.config.synchronous {
            self.drain()?;
        }
        Ok(())
    }

    fn contains_url(&mut self, url: &str) -> UrlCheck {
        self.contains_url_at(url, SystemTime::now())
    }

    fn cache_hash_results(&mut self, requested: &[SbPrefix], results: &[SbFullHashResult]) {
        self.cache_hash_results_at(requested, results, SystemTime::now());
    }

    fn get_lists_info(&mut self) -> Result<Vec<SbListChunkRanges>> {
        let mut infos = Vec::new();
        for (name, list_id) in self.store.lists()? {
            let mut adds: BTreeSet<ChunkId> =
                self.store.chunk_ids(list_id, true)?.into_iter().collect();
            let mut subs: BTreeSet<ChunkId> =
                self.store.chunk_ids(list_id, false)?.into_iter().collect();

            // Report the state the queue will leave behind.
            for pending in &self.pending {
                match pending {
                    Pending::Chunk(p) if p.chunk.list_id == list_id && p.chunk.chunk_number != 0 => {
                        if p.chunk.is_add {
                            adds.insert(p.chunk.chunk_number);
                        } else {
                            subs.insert(p.chunk.chunk_number);
                        }
                    }
                    Pending::Delete(d) if d.list_id == list_id => {
                        let known = if d.is_sub_del { &mut subs } else { &mut adds };
                        known.retain(|id| !is_chunk_in_range(*id, &d.ranges));
                    }
                    _ => {}
                }
            }

            let adds: Vec<ChunkId> = adds.into_iter().collect();
            let subs: Vec<ChunkId> = subs.into_iter().collect();
            infos.push(SbListChunkRanges {
                name,
                adds: ranges_to_string(&chunks_to_ranges(&adds)),
                subs: ranges_to_string(&chunks_to_ranges(&subs)),
            });
        }
        Ok(infos)
    }

    fn update_started(&mut self) -> Result<()> {
        info!("Update started");
        self.hash_cache.clear_misses();
        self.deleted_since_update = false;
        Ok(())
    }

    fn update_finished(&mut self, success: bool) -> Result<()> {
        info!("Update finished, success: {}", success);
        if success {
            self.last_update = Some(SystemTime::now());
        }
        if self.deleted_since_update {
            self.deleted_since_update = false;
            if self.rebuild.is_none() {
                self.start_rebuild()?;
            }
        } else {
            self.check_filter_capacity()?;
        }

        if self.config.synchronous {
            self.drain()?;
        }
        Ok(())
    }

    fn handle_resume(&mut self) {
        self.handle_resume_at(Instant::now());
    }

    fn process_pending(&mut self) -> Result<WorkStatus> {
        self.process_pending_at(Instant::now())
    }

    fn reset(&mut self) -> Result<()> {
        error!("Resetting safe browsing database");
        self.pending.clear();
        self.rebuild = None;
        self.hash_cache.clear();
        self.list_names.clear();
        self.resume_until = None;
        self.deleted_since_update = false;
        self.corrupt = false;

        self.store.reset()?;
        self.invalidate_filter_file();
        self.filter = Some(self.empty_filter());
        self.publish_needed = true;
        self.publish();
        Ok(())
    }

    fn corruption_detected(&self) -> bool {
        self.corrupt
    }

    fn filter_handle(&self) -> Arc<ArcSwapOption<BloomFilter>> {
        Arc::clone(&self.published)
    }

    fn stats(&self) -> DatabaseStats {
        self.stats_inner().unwrap_or_else(|e| {
            warn!("Failed to collect database stats: {}", e);
            DatabaseStats::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safebrowsing_chunk::{ChunkRange, SubPrefix, MALWARE_LIST, PHISHING_LIST};
    use safebrowsing_hash::{prefix_for, FullHash};
    use safebrowsing_url::host_key;
    use std::time::Duration;

    fn test_config() -> DatabaseConfig {
        DatabaseConfig {
            bloom_min_keys: 1000,
            synchronous: true,
            ..DatabaseConfig::default()
        }
    }

    fn add_chunk(number: ChunkId, host: &str, patterns: &[&str]) -> SbChunk {
        SbChunk::new(number, true).with_host(
            host_key(host),
            SbEntry::add_prefixes(0, 0, patterns.iter().map(|p| prefix_for(p)).collect()),
        )
    }

    fn add_del(list: &str, range: &str) -> SbChunkDelete {
        SbChunkDelete {
            list_name: list.to_string(),
            is_sub_del: false,
            chunk_del: safebrowsing_chunk::string_to_ranges(range).unwrap(),
        }
    }

    #[test]
    fn test_add_chunk_prefix_hit() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        db.insert_chunks(
            MALWARE_LIST,
            vec![add_chunk(1, "evil.example", &["evil.example/bad.html"])],
        )
        .unwrap();

        let check = db.contains_url("http://evil.example/bad.html");
        assert!(check.is_listed());
        assert_eq!(check.matching_list, None);
        assert_eq!(check.prefix_hits, vec![prefix_for("evil.example/bad.html")]);

        assert!(!db.contains_url("http://evil.example/good.html").is_listed());
        assert!(!db.contains_url("http://other.example/bad.html").is_listed());
    }

    #[test]
    fn test_duplicate_chunk_is_skipped() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        let chunk = add_chunk(1, "evil.example", &["evil.example/"]);
        db.insert_chunks(MALWARE_LIST, vec![chunk.clone()]).unwrap();
        let record = db.store.get_host(host_key("evil.example")).unwrap();

        db.insert_chunks(MALWARE_LIST, vec![chunk]).unwrap();
        assert_eq!(db.store.get_host(host_key("evil.example")).unwrap(), record);
    }

    #[test]
    fn test_whole_host_chunk_and_add_del() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        db.insert_chunks(PHISHING_LIST, vec![add_chunk(4, "phish.example", &[])])
            .unwrap();

        let check = db.contains_url("http://www.phish.example/any/path?x=1");
        assert_eq!(check.matching_list.as_deref(), Some(PHISHING_LIST));

        db.delete_chunks(vec![add_del(PHISHING_LIST, "4")]).unwrap();
        assert!(!db.contains_url("http://phish.example/").is_listed());
        assert_eq!(db.store.host_count().unwrap(), 0);
        assert_eq!(db.get_lists_info().unwrap()[0].adds, "");
    }

    #[test]
    fn test_sub_before_add() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        let sub = SbChunk::new(9, false).with_host(
            host_key("evil.example"),
            SbEntry::sub_prefixes(
                0,
                0,
                vec![SubPrefix {
                    add_chunk: 2,
                    prefix: prefix_for("evil.example/a.html"),
                }],
            ),
        );
        db.insert_chunks(MALWARE_LIST, vec![sub]).unwrap();
        db.insert_chunks(
            MALWARE_LIST,
            vec![add_chunk(
                2,
                "evil.example",
                &["evil.example/a.html", "evil.example/b.html"],
            )],
        )
        .unwrap();

        assert!(!db.contains_url("http://evil.example/a.html").is_listed());
        assert!(db.contains_url("http://evil.example/b.html").is_listed());
    }

    #[test]
    fn test_lists_info() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        let chunks = [1, 2, 3, 7]
            .into_iter()
            .map(|n| add_chunk(n, "a.example", &["a.example/"]))
            .chain([SbChunk::new(5, false)])
            .collect();
        db.insert_chunks(MALWARE_LIST, chunks).unwrap();

        let info = db.get_lists_info().unwrap();
        assert_eq!(
            info,
            vec![SbListChunkRanges {
                name: MALWARE_LIST.to_string(),
                adds: "1-3,7".to_string(),
                subs: "5".to_string(),
            }]
        );

        db.delete_chunks(vec![SbChunkDelete {
            list_name: MALWARE_LIST.to_string(),
            is_sub_del: true,
            chunk_del: vec![ChunkRange::single(5).unwrap()],
        }])
        .unwrap();
        assert_eq!(db.get_lists_info().unwrap()[0].subs, "");
    }

    #[test]
    fn test_full_hash_cache() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        db.insert_chunks(
            MALWARE_LIST,
            vec![add_chunk(1, "evil.example", &["evil.example/bad.html"])],
        )
        .unwrap();

        let url = "http://evil.example/bad.html";
        let check = db.contains_url(url);
        assert!(check.full_hits.is_empty());

        let result = SbFullHashResult {
            hash: FullHash::from_pattern("evil.example/bad.html"),
            list_name: MALWARE_LIST.to_string(),
            add_chunk_id: 1,
        };
        db.cache_hash_results(&check.prefix_hits, &[result.clone()]);
        assert_eq!(db.contains_url(url).full_hits, vec![result]);
    }

    #[test]
    fn test_missed_prefixes_are_not_reported() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        db.insert_chunks(
            MALWARE_LIST,
            vec![add_chunk(1, "evil.example", &["evil.example/bad.html"])],
        )
        .unwrap();

        let url = "http://evil.example/bad.html";
        let hits = db.contains_url(url).prefix_hits;
        db.cache_hash_results(&hits, &[]);
        assert!(!db.contains_url(url).is_listed());

        db.update_started().unwrap();
        assert!(db.contains_url(url).is_listed());
    }

    #[test]
    fn test_slices_and_debounced_write() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: Some(dir.path().join("Safe Browsing.redb")),
            bloom_min_keys: 1000,
            max_slice: Duration::ZERO,
            ..DatabaseConfig::default()
        };
        let mut db = BloomDatabase::open_redb(config).unwrap();
        let filter_path = db.filter_path().unwrap().to_path_buf();
        assert_eq!(
            filter_path.file_name().unwrap().to_str().unwrap(),
            "Safe Browsing Filter 2"
        );

        let chunks = (1..=3)
            .map(|n| add_chunk(n, &format!("host{n}.example"), &[]))
            .collect();
        db.insert_chunks(MALWARE_LIST, chunks).unwrap();
        assert!(!filter_path.exists());

        let start = Instant::now();
        let mut slices = 0;
        while db.process_pending_at(start).unwrap() == WorkStatus::Busy {
            slices += 1;
        }
        assert!(slices >= 2);
        assert!(db.contains_url("http://host2.example/").is_listed());

        let delay = db.config().filter_write_delay;
        assert_eq!(
            db.process_pending_at(start).unwrap(),
            WorkStatus::WaitUntil(start + delay)
        );
        assert!(!filter_path.exists());
        assert_eq!(
            db.process_pending_at(start + delay).unwrap(),
            WorkStatus::Idle
        );
        assert!(filter_path.exists());
    }

    #[test]
    fn test_resume_cooldown_blocks_writes() {
        let mut db = BloomDatabase::in_memory(DatabaseConfig {
            bloom_min_keys: 1000,
            ..DatabaseConfig::default()
        })
        .unwrap();
        db.insert_chunks(MALWARE_LIST, vec![add_chunk(1, "a.example", &[])])
            .unwrap();

        let now = Instant::now();
        db.handle_resume_at(now);
        let until = now + db.config().resume_cooldown;
        assert_eq!(
            db.process_pending_at(now).unwrap(),
            WorkStatus::WaitUntil(until)
        );
        assert_eq!(db.stats().pending_chunks, 1);

        db.process_pending_at(until).unwrap();
        assert_eq!(db.stats().pending_chunks, 0);
    }

    #[test]
    fn test_filter_is_loaded_or_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sb.redb");
        let config = DatabaseConfig {
            path: Some(path.clone()),
            ..test_config()
        };

        {
            let mut db = BloomDatabase::open_redb(config.clone()).unwrap();
            db.insert_chunks(MALWARE_LIST, vec![add_chunk(1, "evil.example", &[])])
                .unwrap();
        }

        let filter_path = filter_path_for(&path);
        assert!(filter_path.exists());
        let db = BloomDatabase::open_redb(config.clone()).unwrap();
        assert!(need_to_check_url(&db.filter_handle(), "http://evil.example/"));
        drop(db);

        std::fs::remove_file(&filter_path).unwrap();
        let mut db = BloomDatabase::open_redb(config).unwrap();
        assert!(need_to_check_url(&db.filter_handle(), "http://evil.example/"));
        assert!(!need_to_check_url(&db.filter_handle(), "http://fine.example/"));
        assert!(db.contains_url("http://evil.example/x").is_listed());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        db.insert_chunks(MALWARE_LIST, vec![add_chunk(1, "evil.example", &[])])
            .unwrap();
        db.reset().unwrap();

        assert!(!db.contains_url("http://evil.example/").is_listed());
        assert!(db.get_lists_info().unwrap().is_empty());
        assert!(!need_to_check_url(&db.filter_handle(), "http://evil.example/"));
    }

    #[test]
    fn test_rebuild_after_deletes() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        db.update_started().unwrap();
        db.insert_chunks(
            MALWARE_LIST,
            vec![
                add_chunk(1, "a.example", &[]),
                add_chunk(2, "b.example", &[]),
            ],
        )
        .unwrap();
        db.delete_chunks(vec![add_del(MALWARE_LIST, "1")]).unwrap();
        assert!(need_to_check_url(&db.filter_handle(), "http://a.example/"));

        db.update_finished(true).unwrap();
        assert!(!need_to_check_url(&db.filter_handle(), "http://a.example/"));
        assert!(need_to_check_url(&db.filter_handle(), "http://b.example/"));
        assert!(db.last_update().is_some());
    }
    fn run_until_idle(db: &mut BloomDatabase<MemoryStore>) {
        let now = Instant::now();
        while db.process_pending_at(now).unwrap() == WorkStatus::Busy {}
    }

    #[test]
    fn test_deletes_apply_after_queued_chunks() {
        let mut db = BloomDatabase::in_memory(DatabaseConfig {
            bloom_min_keys: 1000,
            max_slice: Duration::ZERO,
            ..DatabaseConfig::default()
        })
        .unwrap();

        db.insert_chunks(
            MALWARE_LIST,
            vec![add_chunk(5, "evil.example", &[]), SbChunk::new(7, false)],
        )
        .unwrap();
        db.delete_chunks(vec![
            add_del(MALWARE_LIST, "5"),
            SbChunkDelete {
                list_name: MALWARE_LIST.to_string(),
                is_sub_del: true,
                chunk_del: vec![ChunkRange::single(7).unwrap()],
            },
        ])
        .unwrap();

        let stats = db.stats();
        assert_eq!(stats.pending_chunks, 2);
        assert_eq!(stats.pending_add_dels, 2);
        let info = &db.get_lists_info().unwrap()[0];
        assert_eq!((info.adds.as_str(), info.subs.as_str()), ("", ""));

        run_until_idle(&mut db);
        assert!(!db.contains_url("http://evil.example/").is_listed());
        assert_eq!(db.store.host_count().unwrap(), 0);
        let info = &db.get_lists_info().unwrap()[0];
        assert_eq!((info.adds.as_str(), info.subs.as_str()), ("", ""));
        assert_eq!(db.stats().pending_add_dels, 0);
    }

    #[test]
    fn test_chunk_readded_after_delete_is_kept() {
        let mut db = BloomDatabase::in_memory(DatabaseConfig {
            bloom_min_keys: 1000,
            max_slice: Duration::ZERO,
            ..DatabaseConfig::default()
        })
        .unwrap();

        db.insert_chunks(MALWARE_LIST, vec![add_chunk(5, "old.example", &[])])
            .unwrap();
        db.delete_chunks(vec![add_del(MALWARE_LIST, "5")]).unwrap();
        db.insert_chunks(MALWARE_LIST, vec![add_chunk(5, "new.example", &[])])
            .unwrap();

        run_until_idle(&mut db);
        assert!(!db.contains_url("http://old.example/").is_listed());
        assert!(db.contains_url("http://new.example/").is_listed());
        assert_eq!(db.get_lists_info().unwrap()[0].adds, "5");
    }

    #[test]
    fn test_delete_range_spanning_every_chunk_id() {
        let mut db = BloomDatabase::in_memory(test_config()).unwrap();
        db.insert_chunks(
            MALWARE_LIST,
            vec![
                add_chunk(1, "a.example", &[]),
                add_chunk(70_000, "b.example", &[]),
            ],
        )
        .unwrap();

        db.delete_chunks(vec![SbChunkDelete {
            list_name: MALWARE_LIST.to_string(),
            is_sub_del: false,
            chunk_del: vec![ChunkRange::new(1, ChunkId::MAX).unwrap()],
        }])
        .unwrap();

        assert_eq!(db.store.host_count().unwrap(), 0);
        assert_eq!(db.get_lists_info().unwrap()[0].adds, "");
        assert!(!db.contains_url("http://b.example/").is_listed());
    }
}
