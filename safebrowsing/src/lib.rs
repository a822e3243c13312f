//! # Safe Browsing prefix database for Rust
//!
//! This crate keeps a local copy of Safe Browsing chunk data and answers
//! "might this URL be listed?" without a network round trip. The update
//! transport lives elsewhere: it feeds decoded chunks and GetHash responses in
//! through [`SafeBrowser`], and asks for the chunk ranges it already holds.
//!
//! ## Features
//!
//! - One background task owns the database; ingestion runs in short slices
//!   so lookups stay responsive during large updates
//! - Persistent redb storage or an ephemeral in-memory store
//! - A Bloom filter over host keys, readable from any thread
//! - A 45 minute cache of full-hash responses
//!
//! ## Example
//!
//! ```rust,no_run
//! use safebrowsing::{Config, DatabaseType, SafeBrowser, SbChunk, SbEntry, MALWARE_LIST};
//! use safebrowsing::safebrowsing_url::host_key;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         database_type: DatabaseType::Redb,
//!         ..Default::default()
//!     };
//!
//!     let mut sb = SafeBrowser::new(config).await?;
//!
//!     // Chunk 1 lists every URL on evil.example.
//!     let chunk = SbChunk::new(1, true)
//!         .with_host(host_key("evil.example"), SbEntry::add_prefixes(0, 0, Vec::new()));
//!     sb.update_started().await?;
//!     sb.insert_chunks(MALWARE_LIST, vec![chunk]).await?;
//!     sb.update_finished(true).await?;
//!
//!     let urls = vec!["http://evil.example/download.exe"];
//!     for (url, check) in urls.iter().zip(sb.lookup_urls(&urls).await?) {
//!         if check.is_listed() {
//!             println!("{} may be unsafe: {:?}", url, check);
//!         } else {
//!             println!("{} is safe", url);
//!         }
//!     }
//!
//!     sb.close().await?;
//!     Ok(())
//! }
//! ```

// Re-export crates from workspace
pub use safebrowsing_chunk;
pub use safebrowsing_db;
pub use safebrowsing_hash;
pub use safebrowsing_url;

pub mod error;
mod worker;

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

pub use crate::error::{Error, Result};
pub use safebrowsing_chunk::{
    ChunkRange, SbChunk, SbChunkDelete, SbChunkHost, SbEntry, SbFullHashResult,
    SbListChunkRanges, MALWARE_LIST, PHISHING_LIST,
};
pub use safebrowsing_db::{
    BloomDatabase, BloomFilter, Database, DatabaseConfig, DatabaseStats, MemoryStore, RedbStore,
    UrlCheck,
};
pub use safebrowsing_hash::{FullHash, SbPrefix};
pub use safebrowsing_url::{canonicalize_url, compare_full_hashes, validate_url};

use crate::worker::{Command, Worker};

/// Default capacity of the request queue to the database worker
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Type of database to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseType {
    /// In-memory store, discarded on close
    Memory,

    /// Persistent redb store
    #[default]
    Redb,
}

/// Configuration for the Safe Browsing service
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage backend
    pub database_type: DatabaseType,

    /// Database settings, including the store path
    pub database: DatabaseConfig,

    /// Requests that may queue up before callers wait
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::default(),
            database: DatabaseConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Statistics about Safe Browsing operations
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Lookups answered by the Bloom filter alone
    pub queries_by_filter: u64,

    /// Lookups that reached the database
    pub queries_by_database: u64,

    /// Lookups that reported a possible listing
    pub queries_listed: u64,

    /// Database resets after corruption or on request
    pub resets: u64,
}

/// Safe Browsing service
///
/// Owns a background task that holds the database. All methods except
/// [`need_to_check_url`](SafeBrowser::need_to_check_url) are requests to that
/// task.
pub struct SafeBrowser {
    config: Config,
    commands: mpsc::Sender<Command>,
    filter: Arc<ArcSwapOption<BloomFilter>>,
    stats: Arc<Mutex<Stats>>,
    worker_task: Option<tokio::task::JoinHandle<()>>,
    shutdown_sender: Option<oneshot::Sender<()>>,
}

impl SafeBrowser {
    /// Open the configured database and start the worker
    pub async fn new(config: Config) -> Result<Self> {
        let database = match config.database_type {
            DatabaseType::Memory => {
                Box::new(BloomDatabase::in_memory(config.database.clone())?)
                    as Box<dyn Database + Send>
            }
            DatabaseType::Redb => {
                let db_config = config.database.clone();
                let database = tokio::task::spawn_blocking(move || {
                    BloomDatabase::open_redb(db_config)
                })
                .await
                .map_err(|e| Error::Internal(format!("Database open task failed: {e}")))??;
                Box::new(database) as Box<dyn Database + Send>
            }
        };

        Self::with_database(config, database)
    }

    /// Start the service over an already opened database
    pub fn with_database(config: Config, database: Box<dyn Database + Send>) -> Result<Self> {
        if config.channel_capacity == 0 {
            return Err(Error::Configuration(
                "Channel capacity must be positive".to_string(),
            ));
        }

        let (commands, receiver) = mpsc::channel(config.channel_capacity);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let filter = database.filter_handle();
        let stats = Arc::new(Mutex::new(Stats::default()));

        let worker = Worker::new(database, Arc::clone(&stats));
        let worker_task = tokio::spawn(worker.run(receiver, shutdown_receiver));
        info!("Safe Browsing database worker started");

        Ok(Self {
            config,
            commands,
            filter,
            stats,
            worker_task: Some(worker_task),
            shutdown_sender: Some(shutdown_sender),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether `url` might be listed, from the Bloom filter alone.
    ///
    /// Safe to call from any thread without waiting for the worker. A `true`
    /// answer needs confirming with [`contains_url`](SafeBrowser::contains_url).
    pub fn need_to_check_url(&self, url: &str) -> bool {
        safebrowsing_db::need_to_check_url(&self.filter, url)
    }

    /// Shared handle to the published Bloom filter
    pub fn filter_handle(&self) -> Arc<ArcSwapOption<BloomFilter>> {
        Arc::clone(&self.filter)
    }

    /// Queue chunks for a list
    pub async fn insert_chunks(&self, list_name: &str, chunks: Vec<SbChunk>) -> Result<()> {
        let list_name = list_name.to_string();
        self.request(|reply| Command::InsertChunks {
            list_name,
            chunks,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Apply AddDel/SubDel commands
    pub async fn delete_chunks(&self, deletes: Vec<SbChunkDelete>) -> Result<()> {
        self.request(|reply| Command::DeleteChunks { deletes, reply })
            .await??;
        Ok(())
    }

    /// Look up one URL in the database
    pub async fn contains_url(&self, url: &str) -> Result<UrlCheck> {
        let url = url.to_string();
        let check = self
            .request(|reply| Command::ContainsUrl { url, reply })
            .await?;

        let mut stats = self.stats.lock().await;
        stats.queries_by_database += 1;
        if check.is_listed() {
            stats.queries_listed += 1;
        }
        Ok(check)
    }

    /// Check several URLs, skipping the database for filter misses
    pub async fn lookup_urls(&self, urls: &[impl AsRef<str>]) -> Result<Vec<UrlCheck>> {
        let mut results = Vec::with_capacity(urls.len());

        for url in urls {
            let url_str = url.as_ref();
            if !validate_url(url_str) {
                return Err(Error::InvalidUrl(url_str.to_string()));
            }

            if self.need_to_check_url(url_str) {
                results.push(self.contains_url(url_str).await?);
            } else {
                debug!("Bloom filter excludes {}", url_str);
                self.stats.lock().await.queries_by_filter += 1;
                results.push(UrlCheck::default());
            }
        }

        Ok(results)
    }

    /// Cache a GetHash response for the requested prefixes
    pub async fn cache_hash_results(
        &self,
        requested: &[SbPrefix],
        results: &[SbFullHashResult],
    ) -> Result<()> {
        let requested = requested.to_vec();
        let results = results.to_vec();
        self.request(|reply| Command::CacheHashResults {
            requested,
            results,
            reply,
        })
        .await
    }

    /// Chunk ranges held per list
    pub async fn get_lists_info(&self) -> Result<Vec<SbListChunkRanges>> {
        Ok(self
            .request(|reply| Command::GetListsInfo { reply })
            .await??)
    }

    pub async fn update_started(&self) -> Result<()> {
        self.request(|reply| Command::UpdateStarted { reply })
            .await??;
        Ok(())
    }

    pub async fn update_finished(&self, success: bool) -> Result<()> {
        self.request(|reply| Command::UpdateFinished { success, reply })
            .await??;
        Ok(())
    }

    /// Tell the database the system just resumed from sleep
    pub async fn handle_resume(&self) -> Result<()> {
        self.request(|reply| Command::HandleResume { reply }).await
    }

    /// Delete all stored data
    pub async fn reset(&self) -> Result<()> {
        self.request(|reply| Command::Reset { reply }).await??;
        Ok(())
    }

    /// Get current statistics
    pub async fn stats(&self) -> Stats {
        self.stats.lock().await.clone()
    }

    /// Get database statistics
    pub async fn database_stats(&self) -> Result<DatabaseStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop the worker and wait for it to exit
    pub async fn close(&mut self) -> Result<()> {
        if let Some(sender) = self.shutdown_sender.take() {
            let _ = sender.send(());
        }

        if let Some(task) = self.worker_task.take() {
            task.await
                .map_err(|e| Error::Internal(format!("Worker task error: {e}")))?;
        }

        Ok(())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::WorkerStopped)?;
        response.await.map_err(|_| Error::WorkerStopped)
    }
}

impl Drop for SafeBrowser {
    fn drop(&mut self) {
        if self.worker_task.is_some() {
            warn!("SafeBrowser dropped without calling close()");
        }
    }
}

impl std::fmt::Debug for SafeBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeBrowser")
            .field("config", &self.config)
            .field("stats", &"<stats>")
            .field("filter", &"<filter>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safebrowsing_hash::prefix_for;
    use safebrowsing_url::host_key;

    fn memory_config() -> Config {
        Config {
            database_type: DatabaseType::Memory,
            database: DatabaseConfig {
                bloom_min_keys: 1000,
                synchronous: true,
                ..DatabaseConfig::default()
            },
            ..Config::default()
        }
    }

    fn whole_host(number: u32, host: &str) -> SbChunk {
        SbChunk::new(number, true).with_host(host_key(host), SbEntry::add_prefixes(0, 0, Vec::new()))
    }

    #[tokio::test]
    async fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.database_type, DatabaseType::Redb);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert!(!config.database.synchronous);
    }

    #[tokio::test]
    async fn test_zero_channel_capacity_is_rejected() {
        let config = Config {
            channel_capacity: 0,
            ..memory_config()
        };
        let result = SafeBrowser::new(config).await;
        assert!(matches!(result.unwrap_err(), Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let mut sb = SafeBrowser::new(memory_config()).await.unwrap();
        sb.update_started().await.unwrap();
        sb.insert_chunks(MALWARE_LIST, vec![whole_host(1, "evil.example")])
            .await
            .unwrap();
        sb.update_finished(true).await.unwrap();

        assert!(sb.need_to_check_url("http://evil.example/x"));
        let checks = sb
            .lookup_urls(&["http://evil.example/x", "http://fine.example/"])
            .await
            .unwrap();
        assert_eq!(checks[0].matching_list.as_deref(), Some(MALWARE_LIST));
        assert!(!checks[1].is_listed());

        let stats = sb.stats().await;
        assert_eq!(stats.queries_by_database, 1);
        assert_eq!(stats.queries_by_filter, 1);
        assert_eq!(stats.queries_listed, 1);

        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let mut sb = SafeBrowser::new(memory_config()).await.unwrap();
        let result = sb.lookup_urls(&["not a url"]).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidUrl(_)));
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_lists_info_and_deletes() {
        let mut sb = SafeBrowser::new(memory_config()).await.unwrap();
        sb.insert_chunks(
            PHISHING_LIST,
            vec![whole_host(1, "a.example"), whole_host(2, "b.example")],
        )
        .await
        .unwrap();

        let info = sb.get_lists_info().await.unwrap();
        assert_eq!(info[0].name, PHISHING_LIST);
        assert_eq!(info[0].adds, "1-2");

        sb.delete_chunks(vec![SbChunkDelete {
            list_name: PHISHING_LIST.to_string(),
            is_sub_del: false,
            chunk_del: vec![ChunkRange::single(1).unwrap()],
        }])
        .await
        .unwrap();
        assert_eq!(sb.get_lists_info().await.unwrap()[0].adds, "2");
        assert!(!sb.contains_url("http://a.example/").await.unwrap().is_listed());

        let stats = sb.database_stats().await.unwrap();
        assert_eq!(stats.host_records, 1);
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_of_queued_chunk_in_background_mode() {
        let config = Config {
            database_type: DatabaseType::Memory,
            database: DatabaseConfig {
                bloom_min_keys: 1000,
                max_slice: std::time::Duration::ZERO,
                ..DatabaseConfig::default()
            },
            ..Config::default()
        };
        let mut sb = SafeBrowser::new(config).await.unwrap();

        sb.update_started().await.unwrap();
        sb.insert_chunks(
            MALWARE_LIST,
            vec![whole_host(5, "evil.example"), whole_host(6, "other.example")],
        )
        .await
        .unwrap();
        sb.delete_chunks(vec![SbChunkDelete {
            list_name: MALWARE_LIST.to_string(),
            is_sub_del: false,
            chunk_del: vec![ChunkRange::single(5).unwrap()],
        }])
        .await
        .unwrap();
        sb.update_finished(true).await.unwrap();

        for _ in 0..1000 {
            let stats = sb.database_stats().await.unwrap();
            if stats.pending_chunks == 0 && stats.pending_add_dels == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let checks = sb
            .lookup_urls(&["http://evil.example/", "http://other.example/"])
            .await
            .unwrap();
        assert!(!checks[0].is_listed());
        assert!(checks[1].is_listed());
        assert_eq!(sb.get_lists_info().await.unwrap()[0].adds, "6");
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_hash_results_are_cached() {
        let mut sb = SafeBrowser::new(memory_config()).await.unwrap();
        let pattern = "evil.example/bad.html";
        let chunk = SbChunk::new(3, true).with_host(
            host_key("evil.example"),
            SbEntry::add_prefixes(0, 0, vec![prefix_for(pattern)]),
        );
        sb.insert_chunks(MALWARE_LIST, vec![chunk]).await.unwrap();

        let url = "http://evil.example/bad.html";
        let check = sb.contains_url(url).await.unwrap();
        assert_eq!(check.prefix_hits, vec![prefix_for(pattern)]);

        let result = SbFullHashResult {
            hash: FullHash::from_pattern(pattern),
            list_name: MALWARE_LIST.to_string(),
            add_chunk_id: 3,
        };
        sb.cache_hash_results(&check.prefix_hits, &[result.clone()])
            .await
            .unwrap();
        let check = sb.contains_url(url).await.unwrap();
        assert_eq!(check.full_hits, vec![result.clone()]);

        let canonical = canonicalize_url(url).unwrap();
        assert_eq!(compare_full_hashes(&canonical, [&result.hash]), Some(0));
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_and_resume() {
        let mut sb = SafeBrowser::new(memory_config()).await.unwrap();
        sb.insert_chunks(MALWARE_LIST, vec![whole_host(1, "evil.example")])
            .await
            .unwrap();
        sb.handle_resume().await.unwrap();
        sb.reset().await.unwrap();

        assert!(!sb.need_to_check_url("http://evil.example/"));
        assert!(sb.get_lists_info().await.unwrap().is_empty());
        assert_eq!(sb.stats().await.resets, 1);
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_close_fail() {
        let mut sb = SafeBrowser::new(memory_config()).await.unwrap();
        sb.close().await.unwrap();
        let result = sb.contains_url("http://example.com/").await;
        assert!(matches!(result.unwrap_err(), Error::WorkerStopped));
    }
}
