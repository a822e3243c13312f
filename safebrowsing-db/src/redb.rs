//! Redb-backed persistent store
//!
//! Host records, chunk bookkeeping and list ids live in one redb file. The
//! database keeps at most one write transaction open, spanning one slice of
//! ingestion work; reads inside that slice go through the same transaction
//! so they see its uncommitted writes.

use crate::store::SCHEMA_VERSION;
use crate::{DatabaseError, Result, Store};
use bytes::{Buf, BufMut};
use redb::backends::InMemoryBackend;
use redb::{
    Database as RedbDb, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use safebrowsing_chunk::{ChunkId, ListId};
use safebrowsing_hash::SbPrefix;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Table definitions for redb storage
const HOSTS_TABLE: TableDefinition<u32, &[u8]> = TableDefinition::new("hosts");
const ADD_CHUNKS_TABLE: TableDefinition<(u32, u32), &[u8]> = TableDefinition::new("add_chunks");
const SUB_CHUNKS_TABLE: TableDefinition<(u32, u32), ()> = TableDefinition::new("sub_chunks");
const LISTS_TABLE: TableDefinition<&str, u32> = TableDefinition::new("lists");
const METADATA_TABLE: TableDefinition<&str, u64> = TableDefinition::new("metadata");

/// Metadata keys
const VERSION_KEY: &str = "version";

fn corrupt<E: Display>(what: &'static str) -> impl FnOnce(E) -> DatabaseError {
    move |e| DatabaseError::Corrupt(format!("Failed to {what}: {e}"))
}

/// Run `$body` with `$table` opened from the active write transaction, or
/// from a fresh read transaction when none is open.
macro_rules! with_table {
    ($self:ident, $def:expr, |$table:ident| $body:expr) => {
        match &$self.txn {
            Some(txn) => {
                let $table = txn.open_table($def).map_err(corrupt("open table"))?;
                let out = $body;
                out
            }
            None => {
                let read_txn = $self
                    .db
                    .begin_read()
                    .map_err(corrupt("begin read transaction"))?;
                let $table = read_txn.open_table($def).map_err(corrupt("open table"))?;
                let out = $body;
                out
            }
        }
    };
}

fn pack_hosts(hosts: &[SbPrefix]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(hosts.len() * 4);
    for host in hosts {
        buf.put_u32_le(*host);
    }
    buf
}

fn unpack_hosts(mut bytes: &[u8]) -> Result<Vec<SbPrefix>> {
    if bytes.len() % 4 != 0 {
        return Err(DatabaseError::Corrupt(format!(
            "add chunk host list has {} bytes",
            bytes.len()
        )));
    }
    let mut hosts = Vec::with_capacity(bytes.len() / 4);
    while bytes.has_remaining() {
        hosts.push(bytes.get_u32_le());
    }
    Ok(hosts)
}

/// Persistent store in a single redb file
pub struct RedbStore {
    db: RedbDb,
    txn: Option<WriteTransaction>,
    path: PathBuf,
}

impl RedbStore {
    /// Open the store at `path`, creating it if needed.
    ///
    /// An unreadable file or one written with another schema version is
    /// replaced by an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path.exists() {
            info!("Opening existing store at {:?}", path);
            match RedbDb::create(&path) {
                Ok(db) => db,
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(DatabaseError::AlreadyOpen(path));
                }
                Err(e) => {
                    warn!("Store at {:?} is unreadable ({}), recreating", path, e);
                    std::fs::remove_file(&path)?;
                    RedbDb::create(&path).map_err(corrupt("create store"))?
                }
            }
        } else {
            info!("Creating new store at {:?}", path);
            RedbDb::create(&path).map_err(corrupt("create store"))?
        };

        let mut store = Self {
            db,
            txn: None,
            path,
        };

        match store.init_schema()? {
            Some(version) if version != SCHEMA_VERSION => {
                warn!(
                    "Store schema version {} does not match {}, resetting",
                    version, SCHEMA_VERSION
                );
                store.reset()?;
            }
            _ => {}
        }

        Ok(store)
    }

    /// Get the default store path in the system cache directory
    pub fn default_path() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir().ok_or_else(|| {
            DatabaseError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Failed to get cache directory",
            ))
        })?;

        Ok(cache_dir.join("safebrowsing").join("Safe Browsing.redb"))
    }

    /// Create all tables. Returns the schema version found before, if any.
    fn init_schema(&mut self) -> Result<Option<u64>> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(corrupt("begin write transaction"))?;
        let previous = {
            write_txn
                .open_table(HOSTS_TABLE)
                .map_err(corrupt("create hosts table"))?;
            write_txn
                .open_table(ADD_CHUNKS_TABLE)
                .map_err(corrupt("create add_chunks table"))?;
            write_txn
                .open_table(SUB_CHUNKS_TABLE)
                .map_err(corrupt("create sub_chunks table"))?;
            write_txn
                .open_table(LISTS_TABLE)
                .map_err(corrupt("create lists table"))?;

            let mut metadata = write_txn
                .open_table(METADATA_TABLE)
                .map_err(corrupt("create metadata table"))?;
            let previous = metadata
                .get(VERSION_KEY)
                .map_err(corrupt("read schema version"))?
                .map(|v| v.value());
            if previous.is_none() {
                metadata
                    .insert(VERSION_KEY, SCHEMA_VERSION)
                    .map_err(corrupt("write schema version"))?;
            }
            previous
        };
        write_txn.commit().map_err(corrupt("commit schema"))?;
        Ok(previous)
    }

    /// Run `f` in the active write transaction, or in its own committed one.
    fn write<T>(&mut self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        if let Some(txn) = &self.txn {
            return f(txn);
        }
        let txn = self
            .db
            .begin_write()
            .map_err(corrupt("begin write transaction"))?;
        let out = f(&txn)?;
        txn.commit().map_err(corrupt("commit transaction"))?;
        Ok(out)
    }
}

impl Store for RedbStore {
    fn begin(&mut self) -> Result<()> {
        if self.txn.is_none() {
            let txn = self
                .db
                .begin_write()
                .map_err(corrupt("begin write transaction"))?;
            self.txn = Some(txn);
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            txn.commit().map_err(corrupt("commit transaction"))?;
        }
        Ok(())
    }

    fn get_host(&self, host: SbPrefix) -> Result<Option<Vec<u8>>> {
        with_table!(self, HOSTS_TABLE, |table| {
            Ok(table
                .get(host)
                .map_err(corrupt("read host record"))?
                .map(|v| v.value().to_vec()))
        })
    }

    fn put_host(&mut self, host: SbPrefix, record: &[u8]) -> Result<()> {
        self.write(|txn| {
            let mut table = txn.open_table(HOSTS_TABLE).map_err(corrupt("open table"))?;
            table
                .insert(host, record)
                .map_err(corrupt("write host record"))?;
            Ok(())
        })
    }

    fn delete_host(&mut self, host: SbPrefix) -> Result<()> {
        self.write(|txn| {
            let mut table = txn.open_table(HOSTS_TABLE).map_err(corrupt("open table"))?;
            table.remove(host).map_err(corrupt("delete host record"))?;
            Ok(())
        })
    }

    fn host_count(&self) -> Result<u64> {
        with_table!(self, HOSTS_TABLE, |table| {
            table.len().map_err(corrupt("count host records"))
        })
    }

    fn host_keys_after(&self, cursor: Option<SbPrefix>, limit: usize) -> Result<Vec<SbPrefix>> {
        with_table!(self, HOSTS_TABLE, |table| {
            let range = match cursor {
                Some(c) => table.range((std::ops::Bound::Excluded(c), std::ops::Bound::Unbounded)),
                None => table.range::<u32>(..),
            }
            .map_err(corrupt("scan host records"))?;

            let mut keys = Vec::with_capacity(limit);
            for item in range.take(limit) {
                let (key, _) = item.map_err(corrupt("scan host records"))?;
                keys.push(key.value());
            }
            Ok(keys)
        })
    }

    fn add_chunk_hosts(&self, list_id: ListId, chunk_id: ChunkId) -> Result<Option<Vec<SbPrefix>>> {
        let packed = with_table!(self, ADD_CHUNKS_TABLE, |table| {
            table
                .get((list_id, chunk_id))
                .map_err(corrupt("read add chunk"))?
                .map(|v| v.value().to_vec())
        });
        packed.map(|bytes| unpack_hosts(&bytes)).transpose()
    }

    fn put_add_chunk(
        &mut self,
        list_id: ListId,
        chunk_id: ChunkId,
        hosts: &[SbPrefix],
    ) -> Result<()> {
        let packed = pack_hosts(hosts);
        self.write(|txn| {
            let mut table = txn
                .open_table(ADD_CHUNKS_TABLE)
                .map_err(corrupt("open table"))?;
            table
                .insert((list_id, chunk_id), packed.as_slice())
                .map_err(corrupt("write add chunk"))?;
            Ok(())
        })
    }

    fn delete_add_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()> {
        self.write(|txn| {
            let mut table = txn
                .open_table(ADD_CHUNKS_TABLE)
                .map_err(corrupt("open table"))?;
            table
                .remove((list_id, chunk_id))
                .map_err(corrupt("delete add chunk"))?;
            Ok(())
        })
    }

    fn has_sub_chunk(&self, list_id: ListId, chunk_id: ChunkId) -> Result<bool> {
        with_table!(self, SUB_CHUNKS_TABLE, |table| {
            Ok(table
                .get((list_id, chunk_id))
                .map_err(corrupt("read sub chunk"))?
                .is_some())
        })
    }

    fn put_sub_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()> {
        self.write(|txn| {
            let mut table = txn
                .open_table(SUB_CHUNKS_TABLE)
                .map_err(corrupt("open table"))?;
            table
                .insert((list_id, chunk_id), ())
                .map_err(corrupt("write sub chunk"))?;
            Ok(())
        })
    }

    fn delete_sub_chunk(&mut self, list_id: ListId, chunk_id: ChunkId) -> Result<()> {
        self.write(|txn| {
            let mut table = txn
                .open_table(SUB_CHUNKS_TABLE)
                .map_err(corrupt("open table"))?;
            table
                .remove((list_id, chunk_id))
                .map_err(corrupt("delete sub chunk"))?;
            Ok(())
        })
    }

    fn chunk_ids(&self, list_id: ListId, is_add: bool) -> Result<Vec<ChunkId>> {
        let bounds = (list_id, 0)..=(list_id, ChunkId::MAX);
        let mut ids = Vec::new();
        if is_add {
            with_table!(self, ADD_CHUNKS_TABLE, |table| {
                for item in table.range(bounds).map_err(corrupt("scan add chunks"))? {
                    let (key, _) = item.map_err(corrupt("scan add chunks"))?;
                    ids.push(key.value().1);
                }
            });
        } else {
            with_table!(self, SUB_CHUNKS_TABLE, |table| {
                for item in table.range(bounds).map_err(corrupt("scan sub chunks"))? {
                    let (key, _) = item.map_err(corrupt("scan sub chunks"))?;
                    ids.push(key.value().1);
                }
            });
        }
        Ok(ids)
    }

    fn list_id(&mut self, name: &str) -> Result<ListId> {
        self.write(|txn| {
            let mut table = txn.open_table(LISTS_TABLE).map_err(corrupt("open table"))?;
            let existing = table
                .get(name)
                .map_err(corrupt("read list"))?
                .map(|v| v.value());
            if let Some(id) = existing {
                return Ok(id);
            }

            let mut next = 0;
            for item in table.iter().map_err(corrupt("scan lists"))? {
                let (_, id) = item.map_err(corrupt("scan lists"))?;
                next = next.max(id.value() + 1);
            }
            table.insert(name, next).map_err(corrupt("write list"))?;
            debug!("Assigned list id {} to {}", next, name);
            Ok(next)
        })
    }

    fn lists(&self) -> Result<Vec<(String, ListId)>> {
        let mut lists = Vec::new();
        with_table!(self, LISTS_TABLE, |table| {
            for item in table.iter().map_err(corrupt("scan lists"))? {
                let (name, id) = item.map_err(corrupt("scan lists"))?;
                lists.push((name.value().to_string(), id.value()));
            }
        });
        lists.sort_by_key(|(_, id)| *id);
        Ok(lists)
    }

    fn reset(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = txn.abort() {
                warn!("Failed to abort write transaction during reset: {}", e);
            }
        }

        // Release the file before deleting it.
        let placeholder = RedbDb::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(corrupt("create placeholder store"))?;
        drop(std::mem::replace(&mut self.db, placeholder));

        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!("Recreating store at {:?}", self.path);
        self.db = RedbDb::create(&self.path).map_err(corrupt("create store"))?;
        self.init_schema()?;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_host_records_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Safe Browsing.redb");

        {
            let mut store = RedbStore::open(&path).unwrap();
            store.put_host(7, &[1, 2, 3]).unwrap();
            store.put_host(3, &[4]).unwrap();
            store.put_add_chunk(0, 1, &[7, 3]).unwrap();
            store.put_sub_chunk(0, 2).unwrap();
            assert_eq!(store.list_id("goog-malware-shavar").unwrap(), 0);
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get_host(7).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.host_count().unwrap(), 2);
        assert_eq!(store.host_keys_after(None, 10).unwrap(), vec![3, 7]);
        assert_eq!(store.host_keys_after(Some(3), 10).unwrap(), vec![7]);
        assert_eq!(store.add_chunk_hosts(0, 1).unwrap(), Some(vec![7, 3]));
        assert!(store.has_sub_chunk(0, 2).unwrap());
        assert_eq!(store.chunk_ids(0, true).unwrap(), vec![1]);
        assert_eq!(
            store.lists().unwrap(),
            vec![("goog-malware-shavar".to_string(), 0)]
        );
    }

    #[test]
    fn test_transaction_reads_own_writes() {
        let dir = tempdir().unwrap();
        let mut store = RedbStore::open(dir.path().join("db.redb")).unwrap();

        store.begin().unwrap();
        store.put_host(1, &[9]).unwrap();
        assert_eq!(store.get_host(1).unwrap(), Some(vec![9]));
        store.delete_host(1).unwrap();
        assert_eq!(store.get_host(1).unwrap(), None);
        store.put_host(2, &[8]).unwrap();
        store.commit().unwrap();

        assert_eq!(store.get_host(2).unwrap(), Some(vec![8]));
    }

    #[test]
    fn test_reset_recreates_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.redb");
        let mut store = RedbStore::open(&path).unwrap();
        store.put_host(1, &[1]).unwrap();
        store.begin().unwrap();
        store.put_host(2, &[2]).unwrap();

        store.reset().unwrap();
        assert_eq!(store.host_count().unwrap(), 0);
        assert!(path.exists());

        store.put_host(3, &[3]).unwrap();
        assert_eq!(store.get_host(3).unwrap(), Some(vec![3]));
    }

    #[test]
    fn test_unreadable_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.redb");
        std::fs::write(&path, b"definitely not a redb file").unwrap();

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.host_count().unwrap(), 0);
    }

    #[test]
    fn test_schema_version_mismatch_resets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.redb");
        {
            let mut store = RedbStore::open(&path).unwrap();
            store.put_host(1, &[1]).unwrap();
            let txn = store.db.begin_write().unwrap();
            {
                let mut meta = txn.open_table(METADATA_TABLE).unwrap();
                meta.insert(VERSION_KEY, SCHEMA_VERSION + 1).unwrap();
            }
            txn.commit().unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.host_count().unwrap(), 0);
    }
}
