use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use safebrowsing_chunk::{ChunkId, ListId};
use safebrowsing_hash::SbPrefix;
use tracing::debug;

use crate::{Result, Store};

/// In-memory store
///
/// Keeps everything in ordered maps. Nothing survives the process, which
/// makes it suitable for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryStore {
    hosts: BTreeMap<SbPrefix, Vec<u8>>,
    add_chunks: BTreeMap<(ListId, ChunkId), Vec<SbPrefix>>,
    sub_chunks: BTreeSet<(ListId, ChunkId)>,
    lists: BTreeMap<String, ListId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_host(&self, host: SbPrefix) -> Result<Option<Vec<u8>>> {
        Ok(self.hosts.get(&host).cloned())
    }

    fn put_host(&mut self, host: SbPrefix, record: &[u8]) -> Result<()> {
        self.hosts.insert(host, record.to_vec());
        Ok(())
    }

    fn delete_host(&mut self, host: SbPrefix) -> Result<()> {
        self.hosts.remove(&host);
        Ok(())
    }

    fn host_count(&self) -> Result<u64> {
        Ok(self.hosts.len() as u64)
    }

    fn host_keys_after(&self, cursor: Option<SbPrefix>, limit: usize) -> Result<Vec<SbPrefix>> {
        let keys = match cursor {
            Some(c) => self
                .hosts
                .range((std::ops::Bound::Excluded(c), std::ops::Bound::Unbounded))
                .map(|(k, _)| *k)
                .take(limit)
                .collect(),
            None => self.hosts.keys().copied().take(limit).collect(),
        };
        Ok(keys)
    }

    fn add_chunk_hosts(&self, list_id: ListId, chunk_id: ChunkId) -> Result<Option<Vec<SbPrefix>>> {
        Ok(self.add_chunks.get(&(list_id, chunk_id)).cloned())
    }

    fn put_add_chunk(
        &mut self,
        list_id: ListId,
        chunk_id: ChunkId,
        hosts: &[SbPrefix],
    ) -> Result<()> {
        self.add_chunks.insert((list_id, chunk_id), hosts.to_vec());
        Ok(())
    }

    fn delete_add_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()> {
        self.add_chunks.remove(&(list_id, chunk_id));
        Ok(())
    }

    fn has_sub_chunk(&self, list_id: ListId, chunk_id: ChunkId) -> Result<bool> {
        Ok(self.sub_chunks.contains(&(list_id, chunk_id)))
    }

    fn put_sub_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()> {
        self.sub_chunks.insert((list_id, chunk_id));
        Ok(())
    }

    fn delete_sub_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()> {
        self.sub_chunks.remove(&(list_id, chunk_id));
        Ok(())
    }

    fn chunk_ids(&self, list_id: ListId, is_add: bool) -> Result<Vec<ChunkId>> {
        let ids = if is_add {
            self.add_chunks
                .range((list_id, 0)..=(list_id, ChunkId::MAX))
                .map(|((_, chunk), _)| *chunk)
                .collect()
        } else {
            self.sub_chunks
                .range((list_id, 0)..=(list_id, ChunkId::MAX))
                .map(|(_, chunk)| *chunk)
                .collect()
        };
        Ok(ids)
    }

    fn list_id(&mut self, name: &str) -> Result<ListId> {
        if let Some(id) = self.lists.get(name) {
            return Ok(*id);
        }
        let id = self.lists.values().max().map_or(0, |max| max + 1);
        debug!("Assigned list id {} to {}", id, name);
        self.lists.insert(name.to_string(), id);
        Ok(id)
    }

    fn lists(&self) -> Result<Vec<(String, ListId)>> {
        let mut lists: Vec<(String, ListId)> =
            self.lists.iter().map(|(n, id)| (n.clone(), *id)).collect();
        lists.sort_by_key(|(_, id)| *id);
        Ok(lists)
    }

    fn reset(&mut self) -> Result<()> {
        *self = Self::default();
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}
