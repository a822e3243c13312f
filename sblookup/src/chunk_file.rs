//! JSON chunk files
//!
//! A chunk file holds decoded update data in readable form: hosts and
//! `host/path` expressions instead of hash prefixes.
//!
//! ```json
//! {
//!   "chunks": [
//!     {"list": "goog-malware-shavar", "chunk": 1, "hosts": [
//!       {"host": "evil.example", "paths": ["evil.example/bad.html"]}
//!     ]},
//!     {"list": "goog-malware-shavar", "chunk": 2, "add": false, "hosts": [
//!       {"host": "evil.example", "add_chunk": 1}
//!     ]}
//!   ],
//!   "deletes": [{"list": "goog-malware-shavar", "add": "5-7"}]
//! }
//! ```
//!
//! A host without paths lists (or for a sub, retracts) the whole host.

use safebrowsing_chunk::{
    string_to_ranges, ChunkId, SbChunk, SbChunkDelete, SbEntry, SubPrefix,
};
use safebrowsing_hash::prefix_for;
use safebrowsing_url::host_key;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct ChunkFile {
    #[serde(default)]
    pub chunks: Vec<ChunkRecord>,
    #[serde(default)]
    pub deletes: Vec<DeleteRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkRecord {
    pub list: String,
    pub chunk: ChunkId,
    #[serde(default = "default_add")]
    pub add: bool,
    #[serde(default)]
    pub hosts: Vec<HostRecord>,
}

#[derive(Debug, Deserialize)]
pub struct HostRecord {
    pub host: String,
    #[serde(default)]
    pub paths: Vec<String>,
    /// Add chunk a sub entry retracts from
    pub add_chunk: Option<ChunkId>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRecord {
    pub list: String,
    pub add: Option<String>,
    pub sub: Option<String>,
}

fn default_add() -> bool {
    true
}

impl ChunkFile {
    pub fn parse(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Invalid chunk file: {e}"))
    }

    /// Chunks grouped into runs of the same list, in file order
    pub fn chunks_by_list(&self) -> Result<Vec<(String, Vec<SbChunk>)>, String> {
        let mut runs: Vec<(String, Vec<SbChunk>)> = Vec::new();
        for record in &self.chunks {
            let chunk = record.to_chunk()?;
            match runs.last_mut() {
                Some((list, chunks)) if *list == record.list => chunks.push(chunk),
                _ => runs.push((record.list.clone(), vec![chunk])),
            }
        }
        Ok(runs)
    }

    pub fn chunk_deletes(&self) -> Result<Vec<SbChunkDelete>, String> {
        let mut deletes = Vec::new();
        for record in &self.deletes {
            for (ranges, is_sub_del) in [(&record.add, false), (&record.sub, true)] {
                if let Some(ranges) = ranges {
                    deletes.push(chunk_delete(&record.list, ranges, is_sub_del)?);
                }
            }
        }
        Ok(deletes)
    }
}

impl ChunkRecord {
    fn to_chunk(&self) -> Result<SbChunk, String> {
        let mut chunk = SbChunk::new(self.chunk, self.add);
        for host in &self.hosts {
            let entry = if self.add {
                let prefixes = host.paths.iter().map(|p| prefix_for(p)).collect();
                SbEntry::add_prefixes(0, 0, prefixes)
            } else {
                let add_chunk = host.add_chunk.ok_or_else(|| {
                    format!(
                        "Sub chunk {} host {} needs an add_chunk",
                        self.chunk, host.host
                    )
                })?;
                if host.paths.is_empty() {
                    SbEntry::sub_whole_chunk(0, add_chunk)
                } else {
                    let prefixes = host
                        .paths
                        .iter()
                        .map(|p| SubPrefix {
                            add_chunk,
                            prefix: prefix_for(p),
                        })
                        .collect();
                    SbEntry::sub_prefixes(0, add_chunk, prefixes)
                }
            };
            chunk = chunk.with_host(host_key(&host.host), entry);
        }
        Ok(chunk)
    }
}

/// Build a delete command from a range string such as `1-3,7`
pub fn chunk_delete(list: &str, ranges: &str, is_sub_del: bool) -> Result<SbChunkDelete, String> {
    let chunk_del = string_to_ranges(ranges).map_err(|e| format!("Invalid ranges {ranges:?}: {e}"))?;
    Ok(SbChunkDelete {
        list_name: list.to_string(),
        is_sub_del,
        chunk_del,
    })
}
