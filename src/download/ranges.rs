// Chunkload - Resumable Encrypted Chunked Transfers
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Byte range algebra
//!
//! A [`RangeSet`] is an ordered list of half-open `[start, end)` ranges that
//! never overlap and never touch. A transfer keeps one set for bytes that are
//! still missing (not-loaded), one for bytes nobody asked for yet
//! (not-requested) and, for CDN sessions, one for bytes not yet verified.
//!
//! # Persisted form
//! Big-endian `i32 count` followed by `count × (i64 start, i64 end)`.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};

/// Half-open byte interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Sorted, disjoint, non-adjacent set of ranges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding a single range (empty if `start >= end`)
    pub fn full(start: u64, end: u64) -> Self {
        let mut set = Self::new();
        set.insert(start, end);
        set
    }

    /// Build a normalized set from arbitrary, possibly overlapping ranges
    pub fn from_ranges<I: IntoIterator<Item = Range>>(ranges: I) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert(range.start, range.end);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.ranges.iter()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Sum of all range lengths
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(Range::len).sum()
    }

    pub fn first_start(&self) -> Option<u64> {
        self.ranges.first().map(|r| r.start)
    }

    /// Range containing `offset`, if any
    pub fn find(&self, offset: u64) -> Option<Range> {
        let idx = self.ranges.partition_point(|r| r.end <= offset);
        self.ranges.get(idx).filter(|r| r.start <= offset).copied()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.find(offset).is_some()
    }

    /// Smallest range start strictly greater than `offset`
    pub fn next_start_after(&self, offset: u64) -> Option<u64> {
        let idx = self.ranges.partition_point(|r| r.start <= offset);
        self.ranges.get(idx).map(|r| r.start)
    }

    /// Remove `[start, end)` from the set
    ///
    /// Covered ranges disappear, edge overlaps shrink a range and an interior
    /// overlap splits it in two. Returns true when the set changed.
    pub fn remove(&mut self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        let first = self.ranges.partition_point(|r| r.end <= start);
        let last = self.ranges.partition_point(|r| r.start < end);
        if first >= last {
            return false;
        }

        let mut replacement = Vec::with_capacity(2);
        let head = self.ranges[first];
        let tail = self.ranges[last - 1];
        if head.start < start {
            replacement.push(Range::new(head.start, start));
        }
        if tail.end > end {
            replacement.push(Range::new(end, tail.end));
        }
        self.ranges.splice(first..last, replacement);
        true
    }

    /// Add `[start, end)` to the set, merging overlapping and touching ranges
    ///
    /// Returns true when the set changed.
    pub fn insert(&mut self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        // Ranges touching or overlapping [start, end]
        let first = self.ranges.partition_point(|r| r.end < start);
        let last = self.ranges.partition_point(|r| r.start <= end);

        if first < last {
            let merged = Range::new(
                self.ranges[first].start.min(start),
                self.ranges[last - 1].end.max(end),
            );
            if last - first == 1 && self.ranges[first] == merged {
                return false;
            }
            self.ranges.splice(first..last, [merged]);
        } else {
            self.ranges.insert(first, Range::new(start, end));
        }
        true
    }

    /// Bytes available contiguously from `offset`, capped at `length`
    ///
    /// The set is read as "bytes still missing": an offset inside a range has
    /// nothing available, otherwise the run ends at the next range or at
    /// `total`.
    pub fn coverage_from(&self, offset: u64, length: u64, total: u64) -> u64 {
        if self.contains(offset) {
            return 0;
        }
        match self.next_start_after(offset) {
            Some(start) => length.min(start - offset),
            None => length.min(total.saturating_sub(offset)),
        }
    }

    /// Parts of the set inside `[start, end)`
    pub fn overlapping(&self, start: u64, end: u64) -> Vec<Range> {
        let first = self.ranges.partition_point(|r| r.end <= start);
        self.ranges[first..]
            .iter()
            .take_while(|r| r.start < end)
            .map(|r| Range::new(r.start.max(start), r.end.min(end)))
            .collect()
    }

    /// Serialize into the range file layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.ranges.len() * 16);
        out.extend_from_slice(&(self.ranges.len() as i32).to_be_bytes());
        for range in &self.ranges {
            out.extend_from_slice(&(range.start as i64).to_be_bytes());
            out.extend_from_slice(&(range.end as i64).to_be_bytes());
        }
        out
    }

    /// Parse a range file; ranges are clipped to `total` when it is known
    pub fn from_bytes(bytes: &[u8], total: u64) -> Result<Self> {
        if bytes.len() < 4 || bytes.len() % 16 != 4 {
            return Err(TransferError::invalid_data(format!(
                "range file has invalid length {}",
                bytes.len()
            )));
        }
        let count = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if count < 0 || (count as usize) * 16 + 4 != bytes.len() {
            return Err(TransferError::invalid_data(format!(
                "range file count {} does not match length {}",
                count,
                bytes.len()
            )));
        }

        let mut set = Self::new();
        for pair in bytes[4..].chunks_exact(16) {
            let start = read_i64(&pair[0..8]);
            let end = read_i64(&pair[8..16]);
            if start < 0 || end < start {
                return Err(TransferError::invalid_data(format!(
                    "range file holds invalid range [{}, {})",
                    start, end
                )));
            }
            let end = if total > 0 { (end as u64).min(total) } else { end as u64 };
            set.insert(start as u64, end);
        }
        Ok(set)
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    i64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_normalized(set: &RangeSet) {
        let ranges: Vec<_> = set.iter().copied().collect();
        for r in &ranges {
            assert!(r.start < r.end, "empty range {:?}", r);
        }
        for pair in ranges.windows(2) {
            assert!(pair[0].end < pair[1].start, "ranges touch or overlap: {:?}", pair);
        }
    }

    #[test]
    fn test_remove_splits_interior() {
        let mut set = RangeSet::full(0, 100);
        assert!(set.remove(40, 60));
        assert_eq!(
            set.iter().copied().collect::<Vec<_>>(),
            vec![Range::new(0, 40), Range::new(60, 100)]
        );
    }

    #[test]
    fn test_remove_edges_and_full() {
        let mut set = RangeSet::full(0, 100);
        assert!(set.remove(0, 30));
        assert_eq!(set.first_start(), Some(30));
        assert!(set.remove(90, 100));
        assert_eq!(set.total_len(), 60);
        assert!(set.remove(30, 90));
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_spanning_multiple_ranges() {
        let mut set = RangeSet::from_ranges([
            Range::new(0, 10),
            Range::new(20, 30),
            Range::new(40, 50),
        ]);
        assert!(set.remove(5, 45));
        assert_eq!(
            set.iter().copied().collect::<Vec<_>>(),
            vec![Range::new(0, 5), Range::new(45, 50)]
        );
    }

    #[test]
    fn test_reapplying_covered_range_is_noop() {
        let mut set = RangeSet::full(0, 100);
        assert!(set.remove(10, 20));
        let before = set.clone();
        assert!(!set.remove(10, 20));
        assert!(!set.remove(12, 18));
        assert_eq!(set, before);

        assert!(!set.insert(30, 40));
        assert_eq!(set, before);
    }

    #[test]
    fn test_insert_coalesces_touching() {
        let mut set = RangeSet::new();
        assert!(set.insert(0, 10));
        assert!(set.insert(20, 30));
        assert!(set.insert(10, 20));
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![Range::new(0, 30)]);

        assert!(set.insert(50, 60));
        assert!(set.insert(25, 55));
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![Range::new(0, 60)]);
    }

    #[test]
    fn test_closure_under_mixed_sequence() {
        let mut set = RangeSet::full(0, 1000);
        let ops: [(bool, u64, u64); 10] = [
            (false, 100, 200),
            (false, 150, 300),
            (true, 120, 180),
            (false, 0, 50),
            (true, 290, 310),
            (false, 500, 501),
            (true, 0, 20),
            (false, 990, 1000),
            (true, 200, 290),
            (false, 400, 600),
        ];
        for (insert, start, end) in ops {
            if insert {
                set.insert(start, end);
            } else {
                set.remove(start, end);
            }
            assert_normalized(&set);
        }
        assert_eq!(
            set.iter().copied().collect::<Vec<_>>(),
            vec![
                Range::new(0, 20),
                Range::new(50, 100),
                Range::new(120, 180),
                Range::new(200, 400),
                Range::new(600, 990),
            ]
        );
    }

    #[test]
    fn test_coverage_from() {
        let set = RangeSet::from_ranges([Range::new(100, 200), Range::new(300, 400)]);
        assert_eq!(set.coverage_from(0, 1000, 500), 100);
        assert_eq!(set.coverage_from(0, 50, 500), 50);
        assert_eq!(set.coverage_from(150, 10, 500), 0);
        assert_eq!(set.coverage_from(200, 1000, 500), 100);
        assert_eq!(set.coverage_from(400, 1000, 500), 100);
        assert_eq!(set.coverage_from(450, 1000, 500), 50);
    }

    #[test]
    fn test_persisted_layout() {
        let set = RangeSet::from_ranges([Range::new(1, 2), Range::new(0x0100, 0x0200)]);
        let bytes = set.to_bytes();
        assert_eq!(bytes.len(), 4 + 2 * 16);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 2]);
        assert_eq!(&bytes[4..12], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[28..36], &[0, 0, 0, 0, 0, 0, 2, 0]);

        let parsed = RangeSet::from_bytes(&bytes, 0).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(RangeSet::from_bytes(&[0, 0, 0], 0).is_err());
        assert!(RangeSet::from_bytes(&[0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], 0).is_err());
        let empty = RangeSet::from_bytes(&[0, 0, 0, 0], 0).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_overlapping_clips_to_window() {
        let set = RangeSet::from_ranges([Range::new(0, 100), Range::new(300, 400)]);
        assert_eq!(set.overlapping(50, 350), vec![Range::new(50, 100), Range::new(300, 350)]);
        assert!(set.overlapping(100, 300).is_empty());
    }
}
