//! Per-host-key record and the add/sub merge rules
//!
//! Adds and subs for the same host key may arrive in either order. A sub
//! that finds nothing to cancel can be kept in the record so that the add it
//! refers to is cancelled on arrival. Both orders converge to the same
//! record.

use crate::{ChunkError, EntryPrefixes, ListId, Result, SbEntry};
use bytes::Buf;
use safebrowsing_hash::{FullHash, SbPrefix};

/// Result of matching candidate hashes against one host record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMatch {
    /// Set for an authoritative match: a full-hash add or a whole-host add
    pub list_id: Option<ListId>,
    /// Prefix adds that matched; these need full-hash confirmation
    pub prefix_hits: Vec<SbPrefix>,
}

impl HostMatch {
    pub fn is_match(&self) -> bool {
        self.list_id.is_some() || !self.prefix_hits.is_empty()
    }
}

/// All entries stored under one host key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SbHostInfo {
    entries: Vec<SbEntry>,
}

impl SbHostInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unpack a stored record. Fails if the bytes do not split into whole entries.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        while bytes.has_remaining() {
            entries.push(SbEntry::decode(&mut bytes)?);
        }
        Ok(Self { entries })
    }

    /// Structural check of a stored record
    pub fn is_valid(bytes: &[u8]) -> bool {
        Self::from_bytes(bytes).is_ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        for entry in &self.entries {
            entry.encode(&mut buf);
        }
        buf
    }

    /// Packed size in bytes
    pub fn size(&self) -> usize {
        self.entries.iter().map(SbEntry::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SbEntry] {
        &self.entries
    }

    /// Merge an add entry into the record.
    pub fn add_prefixes(&mut self, mut add: SbEntry) {
        debug_assert!(add.is_add());

        // A stored whole-chunk sub already retracted everything in this add.
        if let Some(pos) = self.entries.iter().position(|e| {
            e.is_sub()
                && e.list_id == add.list_id
                && e.prefix_count() == 0
                && e.chunk_id == add.chunk_id
        }) {
            self.entries.remove(pos);
            return;
        }

        let original_count = add.prefix_count();
        let mut touched = Vec::new();
        let mut i = add.prefix_count();
        while i > 0 {
            i -= 1;
            if let Some((sub_idx, slot)) = self.find_match(&add, i) {
                add.remove_prefix(i);
                self.entries[sub_idx].remove_prefix(slot);
                touched.push(sub_idx);
            }
        }
        self.drop_emptied(touched);

        // An add with no prefixes left would read as a whole-host block.
        if original_count > 0 && add.prefix_count() == 0 {
            return;
        }
        self.entries.push(add);
    }

    /// Apply a sub entry to the record.
    ///
    /// With `persist`, whatever the sub could not cancel is kept for adds
    /// that have not arrived yet.
    pub fn remove_prefixes(&mut self, mut sub: SbEntry, persist: bool) {
        debug_assert!(sub.is_sub());

        if sub.prefix_count() == 0 {
            let before = self.entries.len();
            self.entries.retain(|e| {
                !(e.is_add() && e.list_id == sub.list_id && e.chunk_id == sub.chunk_id)
            });
            let already_stored = self.entries.contains(&sub);
            if self.entries.len() == before && persist && !already_stored {
                self.entries.push(sub);
            }
            return;
        }

        let mut touched = Vec::new();
        let mut i = sub.prefix_count();
        while i > 0 {
            i -= 1;
            if let Some((add_idx, slot)) = self.find_match(&sub, i) {
                sub.remove_prefix(i);
                self.entries[add_idx].remove_prefix(slot);
                touched.push(add_idx);
            }
        }
        self.drop_emptied(touched);

        if persist && sub.prefix_count() > 0 {
            self.entries.push(sub);
        }
    }

    /// Match candidate full hashes against the adds in this record.
    pub fn contains(&self, candidates: &[FullHash]) -> HostMatch {
        let mut result = HostMatch::default();
        for entry in self.entries.iter().filter(|e| e.is_add()) {
            if entry.prefix_count() == 0 {
                return HostMatch {
                    list_id: Some(entry.list_id),
                    prefix_hits: Vec::new(),
                };
            }
            match &entry.prefixes {
                EntryPrefixes::AddPrefix(prefixes) => {
                    for prefix in prefixes {
                        let hit = candidates.iter().any(|c| c.prefix() == *prefix);
                        if hit && !result.prefix_hits.contains(prefix) {
                            result.prefix_hits.push(*prefix);
                        }
                    }
                }
                EntryPrefixes::AddFullHash(hashes) => {
                    if hashes.iter().any(|h| candidates.contains(h)) {
                        result.list_id = Some(entry.list_id);
                    }
                }
                _ => {}
            }
        }
        result
    }

    /// Find an entry of the same list with a slot cancelling `entry`'s slot `index`.
    fn find_match(&self, entry: &SbEntry, index: usize) -> Option<(usize, usize)> {
        self.entries.iter().enumerate().find_map(|(idx, other)| {
            if other.list_id != entry.list_id || other.is_add() == entry.is_add() {
                return None;
            }
            (0..other.prefix_count())
                .find(|&slot| entry.prefixes_match(index, other, slot))
                .map(|slot| (idx, slot))
        })
    }

    /// Remove entries that lost their last prefix through cancellation.
    fn drop_emptied(&mut self, mut touched: Vec<usize>) {
        touched.sort_unstable();
        touched.dedup();
        for idx in touched.into_iter().rev() {
            if self.entries[idx].prefix_count() == 0 {
                self.entries.remove(idx);
            }
        }
    }
}

impl TryFrom<&[u8]> for SbHostInfo {
    type Error = ChunkError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubPrefix;

    fn sub(list_id: ListId, chunk_id: u32, pairs: &[(u32, SbPrefix)]) -> SbEntry {
        SbEntry::sub_prefixes(
            list_id,
            chunk_id,
            pairs
                .iter()
                .map(|&(add_chunk, prefix)| SubPrefix { add_chunk, prefix })
                .collect(),
        )
    }

    #[test]
    fn test_add_then_sub_prefix() {
        let mut info = SbHostInfo::new();
        info.add_prefixes(SbEntry::add_prefixes(0, 1, vec![0xa, 0xb]));
        info.remove_prefixes(sub(0, 5, &[(1, 0xa)]), true);

        assert_eq!(info.entries(), &[SbEntry::add_prefixes(0, 1, vec![0xb])]);
    }

    #[test]
    fn test_sub_emptying_add_drops_it() {
        let mut info = SbHostInfo::new();
        info.add_prefixes(SbEntry::add_prefixes(0, 1, vec![0xa]));
        info.remove_prefixes(sub(0, 5, &[(1, 0xa)]), true);
        assert!(info.is_empty());
        assert_eq!(info.size(), 0);
    }

    #[test]
    fn test_sub_before_add_cancels_on_arrival() {
        let mut info = SbHostInfo::new();
        info.remove_prefixes(sub(0, 5, &[(1, 0xa)]), true);
        assert_eq!(info.entries().len(), 1);

        info.add_prefixes(SbEntry::add_prefixes(0, 1, vec![0xa, 0xb]));
        assert_eq!(info.entries(), &[SbEntry::add_prefixes(0, 1, vec![0xb])]);
    }

    #[test]
    fn test_unpersisted_sub_is_forgotten() {
        let mut info = SbHostInfo::new();
        info.remove_prefixes(sub(0, 5, &[(1, 0xa)]), false);
        assert!(info.is_empty());

        info.remove_prefixes(SbEntry::sub_whole_chunk(0, 1), false);
        assert!(info.is_empty());
    }

    #[test]
    fn test_whole_chunk_sub_marker() {
        let mut info = SbHostInfo::new();
        info.remove_prefixes(SbEntry::sub_whole_chunk(0, 3), true);
        info.remove_prefixes(SbEntry::sub_whole_chunk(0, 3), true);
        assert_eq!(info.entries().len(), 1);

        info.add_prefixes(SbEntry::add_prefixes(0, 3, vec![0xa]));
        assert!(info.is_empty());
    }

    #[test]
    fn test_lists_do_not_cancel_each_other() {
        let mut info = SbHostInfo::new();
        info.add_prefixes(SbEntry::add_prefixes(0, 1, vec![0xa]));
        info.remove_prefixes(sub(1, 5, &[(1, 0xa)]), false);
        info.remove_prefixes(SbEntry::sub_whole_chunk(1, 1), false);
        assert_eq!(info.entries(), &[SbEntry::add_prefixes(0, 1, vec![0xa])]);
    }

    #[test]
    fn test_contains() {
        let path = FullHash::from_pattern("evil.com/");
        let other = FullHash::from_pattern("evil.com/ok.html");

        let mut info = SbHostInfo::new();
        info.add_prefixes(SbEntry::add_prefixes(0, 1, vec![path.prefix()]));
        let m = info.contains(&[path, other]);
        assert_eq!(m.list_id, None);
        assert_eq!(m.prefix_hits, vec![path.prefix()]);
        assert!(!info.contains(&[other]).is_match());

        info.add_prefixes(SbEntry::add_full_hashes(1, 2, vec![other]));
        let m = info.contains(&[other]);
        assert_eq!(m.list_id, Some(1));
        assert!(m.prefix_hits.is_empty());
    }

    #[test]
    fn test_whole_host_add() {
        let mut info = SbHostInfo::new();
        info.add_prefixes(SbEntry::add_prefixes(1, 4, Vec::new()));
        let m = info.contains(&[FullHash::from_pattern("anything.com/at/all")]);
        assert_eq!(m.list_id, Some(1));

        info.remove_prefixes(SbEntry::sub_whole_chunk(1, 4), false);
        assert!(!info.contains(&[FullHash::from_pattern("anything.com/")]).is_match());
    }

    #[test]
    fn test_bytes_round_trip_and_validation() {
        let mut info = SbHostInfo::new();
        info.add_prefixes(SbEntry::add_prefixes(0, 1, vec![1, 2]));
        info.remove_prefixes(sub(0, 9, &[(7, 3)]), true);
        info.add_prefixes(SbEntry::add_full_hashes(1, 2, vec![FullHash::from_pattern("a/")]));

        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), info.size());
        assert!(SbHostInfo::is_valid(&bytes));
        assert_eq!(SbHostInfo::from_bytes(&bytes).unwrap(), info);

        assert!(!SbHostInfo::is_valid(&bytes[..bytes.len() - 3]));
        assert!(SbHostInfo::is_valid(&[]));
    }
}
