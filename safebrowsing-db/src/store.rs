//! Storage backend interface
//!
//! The store is the authoritative copy of the prefix data: host records
//! keyed by host key, the host keys each add chunk touched, the known sub
//! chunks and the list-name table. The Bloom filter is always rebuildable
//! from it.

use crate::Result;
use safebrowsing_chunk::{ChunkId, ListId};
use safebrowsing_hash::SbPrefix;
use std::collections::VecDeque;
use std::path::Path;

/// Storage schema version; stores written with another version are reset
pub const SCHEMA_VERSION: u64 = 2;

/// Key-value storage used by the database
///
/// Writes between [`begin`](Store::begin) and [`commit`](Store::commit) are
/// applied atomically. Writes outside an explicit transaction are committed
/// immediately.
pub trait Store: Send {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;

    fn get_host(&self, host: SbPrefix) -> Result<Option<Vec<u8>>>;
    fn put_host(&mut self, host: SbPrefix, record: &[u8]) -> Result<()>;
    fn delete_host(&mut self, host: SbPrefix) -> Result<()>;
    fn host_count(&self) -> Result<u64>;

    /// Up to `limit` host keys in ascending order, strictly after `cursor`
    fn host_keys_after(&self, cursor: Option<SbPrefix>, limit: usize) -> Result<Vec<SbPrefix>>;

    /// Host keys recorded for an add chunk, or `None` if the chunk is unknown
    fn add_chunk_hosts(&self, list_id: ListId, chunk_id: ChunkId) -> Result<Option<Vec<SbPrefix>>>;
    fn put_add_chunk(&mut self, list_id: ListId, chunk_id: ChunkId, hosts: &[SbPrefix])
        -> Result<()>;
    fn delete_add_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()>;

    fn has_sub_chunk(&self, list_id: ListId, chunk_id: ChunkId) -> Result<bool>;
    fn put_sub_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()>;
    fn delete_sub_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()>;

    /// Known add or sub chunk ids of a list, ascending
    fn chunk_ids(&self, list_id: ListId, is_add: bool) -> Result<Vec<ChunkId>>;

    /// The id of `name`, assigning the next free id if the list is new
    fn list_id(&mut self, name: &str) -> Result<ListId>;

    /// All known lists as `(name, id)`, ordered by id
    fn lists(&self) -> Result<Vec<(String, ListId)>>;

    /// Drop all data and recreate an empty schema.
    fn reset(&mut self) -> Result<()>;

    /// Backing file, if the store is persistent
    fn path(&self) -> Option<&Path>;

    fn has_add_chunk(&self, list_id: ListId, chunk_id: ChunkId) -> Result<bool> {
        Ok(self.add_chunk_hosts(list_id, chunk_id)?.is_some())
    }
}

/// Restartable walk over every host key in a store
///
/// The scan only remembers the last key it returned, so the store can be
/// modified between pulls. Keys written behind the cursor after the scan
/// started are not revisited.
#[derive(Debug, Clone)]
pub struct HostKeyScan {
    cursor: Option<SbPrefix>,
    buffered: VecDeque<SbPrefix>,
    batch_size: usize,
    done: bool,
}

impl HostKeyScan {
    pub fn new(batch_size: usize) -> Self {
        Self::from_cursor(None, batch_size)
    }

    /// Resume a scan after `cursor`
    pub fn from_cursor(cursor: Option<SbPrefix>, batch_size: usize) -> Self {
        Self {
            cursor,
            buffered: VecDeque::new(),
            batch_size: batch_size.max(1),
            done: false,
        }
    }

    /// The last key handed out
    pub fn cursor(&self) -> Option<SbPrefix> {
        self.cursor
    }

    pub fn is_done(&self) -> bool {
        self.done && self.buffered.is_empty()
    }

    /// Pull the next host key, or `None` once the store is exhausted.
    pub fn next_key<S: Store + ?Sized>(&mut self, store: &S) -> Result<Option<SbPrefix>> {
        if self.buffered.is_empty() && !self.done {
            let keys = store.host_keys_after(self.cursor, self.batch_size)?;
            if keys.len() < self.batch_size {
                self.done = true;
            }
            self.buffered.extend(keys);
        }
        let key = self.buffered.pop_front();
        if key.is_some() {
            self.cursor = key;
        }
        Ok(key)
    }

    /// Borrow the scan as an iterator over `store`.
    pub fn iter<'a, S: Store + ?Sized>(&'a mut self, store: &'a S) -> HostKeys<'a, S> {
        HostKeys { scan: self, store }
    }
}

/// Iterator returned by [`HostKeyScan::iter`]
pub struct HostKeys<'a, S: ?Sized> {
    scan: &'a mut HostKeyScan,
    store: &'a S,
}

impl<S: Store + ?Sized> Iterator for HostKeys<'_, S> {
    type Item = Result<SbPrefix>;

    fn next(&mut self) -> Option<Self::Item> {
        self.scan.next_key(self.store).transpose()
    }
}
