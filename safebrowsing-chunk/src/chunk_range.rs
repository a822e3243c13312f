//! Compact chunk-id range lists such as `"1-10,15-17"`

use crate::{ChunkError, ChunkId, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// An inclusive range of chunk ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkRange {
    start: ChunkId,
    stop: ChunkId,
}

impl ChunkRange {
    /// Create a range. Chunk ids are positive and `start <= stop`.
    pub fn new(start: ChunkId, stop: ChunkId) -> Result<Self> {
        if start == 0 || start > stop {
            return Err(ChunkError::InvalidRange(format!("{start}-{stop}")));
        }
        Ok(Self { start, stop })
    }

    /// A range covering exactly one chunk
    pub fn single(chunk: ChunkId) -> Result<Self> {
        Self::new(chunk, chunk)
    }

    pub fn start(&self) -> ChunkId {
        self.start
    }

    pub fn stop(&self) -> ChunkId {
        self.stop
    }

    pub fn contains(&self, chunk: ChunkId) -> bool {
        self.start <= chunk && chunk <= self.stop
    }

    /// Iterate over every chunk id in the range
    pub fn chunks(&self) -> impl Iterator<Item = ChunkId> {
        self.start..=self.stop
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.stop {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.stop)
        }
    }
}

impl FromStr for ChunkRange {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parse = |n: &str| {
            n.trim()
                .parse::<ChunkId>()
                .map_err(|_| ChunkError::InvalidRange(s.to_string()))
        };
        match s.split_once('-') {
            Some((start, stop)) => Self::new(parse(start)?, parse(stop)?),
            None => Self::single(parse(s)?),
        }
    }
}

impl Serialize for ChunkRange {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChunkRange {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Collapse a list of chunk ids into ranges.
///
/// The input does not need to be sorted; duplicates are merged and the
/// sentinel id 0 is ignored.
pub fn chunks_to_ranges(chunks: &[ChunkId]) -> Vec<ChunkRange> {
    let mut sorted: Vec<ChunkId> = chunks.iter().copied().filter(|&c| c != 0).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<ChunkRange> = Vec::new();
    for chunk in sorted {
        match ranges.last_mut() {
            Some(last) if last.stop + 1 == chunk => last.stop = chunk,
            _ => ranges.push(ChunkRange {
                start: chunk,
                stop: chunk,
            }),
        }
    }
    ranges
}

/// Expand ranges into the chunk ids they cover, in range order.
pub fn ranges_to_chunks(ranges: &[ChunkRange]) -> Vec<ChunkId> {
    ranges.iter().flat_map(ChunkRange::chunks).collect()
}

/// Format ranges as a comma separated list, e.g. `"1-10,15"`.
pub fn ranges_to_string(ranges: &[ChunkRange]) -> String {
    ranges
        .iter()
        .map(ChunkRange::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma separated range list. An empty string is an empty list.
pub fn string_to_ranges(s: &str) -> Result<Vec<ChunkRange>> {
    if s.trim().is_empty() {
        return Ok(Vec::new());
    }
    s.split(',').map(str::parse).collect()
}

/// Whether `chunk` falls in any of `ranges`, which must be sorted and disjoint.
pub fn is_chunk_in_range(chunk: ChunkId, ranges: &[ChunkRange]) -> bool {
    ranges
        .binary_search_by(|range| {
            if range.stop < chunk {
                std::cmp::Ordering::Less
            } else if range.start > chunk {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn range(start: ChunkId, stop: ChunkId) -> ChunkRange {
        ChunkRange::new(start, stop).unwrap()
    }

    #[test]
    fn test_chunks_to_ranges() {
        let ranges = chunks_to_ranges(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 15, 16, 17]);
        assert_eq!(ranges, vec![range(1, 10), range(15, 17)]);
        assert_eq!(ranges_to_string(&ranges), "1-10,15-17");

        let ranges = chunks_to_ranges(&[7, 3, 5, 4, 3]);
        assert_eq!(ranges, vec![range(3, 5), range(7, 7)]);
        assert_eq!(ranges_to_string(&ranges), "3-5,7");

        assert!(chunks_to_ranges(&[]).is_empty());
    }

    #[test]
    fn test_string_to_ranges() {
        let ranges = string_to_ranges("1-100,398,415,1138-2001,2019").unwrap();
        assert_eq!(
            ranges,
            vec![
                range(1, 100),
                range(398, 398),
                range(415, 415),
                range(1138, 2001),
                range(2019, 2019),
            ]
        );
        assert_eq!(ranges_to_string(&ranges), "1-100,398,415,1138-2001,2019");
        assert!(string_to_ranges("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_strings_fail_cleanly() {
        assert!(string_to_ranges("x-y").is_err());
        assert!(string_to_ranges("1-").is_err());
        assert!(string_to_ranges("5-2").is_err());
        assert!(string_to_ranges("1,,2").is_err());
        assert!(string_to_ranges("0").is_err());
    }

    #[test]
    fn test_is_chunk_in_range() {
        let ranges = string_to_ranges("1-5,10,20-30").unwrap();
        assert!(is_chunk_in_range(1, &ranges));
        assert!(is_chunk_in_range(5, &ranges));
        assert!(is_chunk_in_range(10, &ranges));
        assert!(is_chunk_in_range(25, &ranges));
        assert!(!is_chunk_in_range(6, &ranges));
        assert!(!is_chunk_in_range(31, &ranges));
        assert!(!is_chunk_in_range(0, &ranges));
    }

    #[test]
    fn test_serde_as_strings() {
        let ranges = vec![range(1, 3), range(9, 9)];
        let json = serde_json::to_string(&ranges).unwrap();
        assert_eq!(json, r#"["1-3","9"]"#);
        let back: Vec<ChunkRange> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ranges);
    }

    proptest! {
        #[test]
        fn prop_chunks_round_trip(set in proptest::collection::btree_set(1u32..5000, 0..200)) {
            let chunks: Vec<ChunkId> = set.into_iter().collect();
            prop_assert_eq!(ranges_to_chunks(&chunks_to_ranges(&chunks)), chunks);
        }

        #[test]
        fn prop_string_round_trip(set in proptest::collection::btree_set(1u32..5000, 0..200)) {
            let chunks: Vec<ChunkId> = set.into_iter().collect();
            let ranges = chunks_to_ranges(&chunks);
            let parsed = string_to_ranges(&ranges_to_string(&ranges)).unwrap();
            prop_assert_eq!(parsed, ranges);
        }
    }
}
