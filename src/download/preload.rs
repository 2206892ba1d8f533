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


//! Video preload planner
//!
//! A preload downloads just enough of an MP4 file to start playback: the
//! leading bytes plus the `moov` box. Chunks are fetched one at a time while
//! the planner walks the top-level boxes; once `moov` is located the remaining
//! budget is fetched in parallel.
//!
//! # Box walk
//! - 4-byte big-endian size, 4-byte tag; size 1 means a 64-bit size follows
//! - size 0 ends the walk (box runs to end of file, nothing after it)
//! - a header cut by the chunk end is kept in a 16-byte buffer and completed
//!   from the next chunk
//! - a box running past the chunk makes the chunk holding the next header the
//!   next download
//!
//! # Budget
//! If `moov` sits in the first half of the file the preview needs about half
//! the preload budget plus the box itself, otherwise the whole budget, split
//! between the head and the tail of the file. These thresholds are empirical.

use crate::storage::formats::{encode_preload_record, PreloadFile, PRELOAD_RECORD_OVERHEAD};
use std::collections::{HashMap, HashSet};

/// Size of the rolling header buffer
pub const SCAN_BUFFER_LEN: usize = 16;

const TARGET_TAG: &[u8; 4] = b"moov";

/// Result of scanning one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Target box header found at `offset`
    Found { offset: u64, size: u64 },
    /// Next box header starts at `next_atom`; `carried` when part of it is
    /// buffered and the immediately following chunk is needed
    Continue { next_atom: u64, carried: bool },
    /// The walk cannot continue from this chunk
    Lost,
}

/// Incremental top-level box walker
#[derive(Debug, Clone, Default)]
pub struct BoxScanner {
    buffer: [u8; SCAN_BUFFER_LEN],
    carried: usize,
    next_atom: u64,
}

impl BoxScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next box header to read
    pub fn next_atom(&self) -> u64 {
        self.next_atom
    }

    /// Resume from a persisted walk position with the header bytes already seen
    pub fn resume(next_atom: u64, carried: &[u8]) -> Self {
        let mut scanner = Self {
            next_atom,
            ..Self::default()
        };
        let len = carried.len().min(SCAN_BUFFER_LEN);
        scanner.buffer[..len].copy_from_slice(&carried[..len]);
        scanner.carried = len;
        scanner
    }

    /// Walk the boxes whose headers fall inside `part`
    pub fn scan(&mut self, part_offset: u64, part: &[u8]) -> ScanOutcome {
        let part_end = part_offset + part.len() as u64;
        let mut atom = self.next_atom;

        loop {
            if atom >= part_end {
                return ScanOutcome::Lost;
            }
            if atom < part_offset && (self.carried == 0 || atom + self.carried as u64 != part_offset) {
                return ScanOutcome::Lost;
            }

            let available = (part_end - atom) as usize;
            if available < SCAN_BUFFER_LEN {
                let from = atom.max(part_offset) - part_offset;
                let bytes = &part[from as usize..];
                self.buffer[self.carried..self.carried + bytes.len()].copy_from_slice(bytes);
                self.carried += bytes.len();
                self.next_atom = atom;
                return ScanOutcome::Continue {
                    next_atom: atom,
                    carried: true,
                };
            }

            if self.carried > 0 {
                let need = SCAN_BUFFER_LEN - self.carried;
                self.buffer[self.carried..].copy_from_slice(&part[..need]);
                self.carried = 0;
            } else {
                let from = (atom - part_offset) as usize;
                self.buffer.copy_from_slice(&part[from..from + SCAN_BUFFER_LEN]);
            }

            let mut size = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as u64;
            if size == 0 {
                self.next_atom = 0;
                return ScanOutcome::Lost;
            }
            let header_len = if size == 1 {
                let mut ext = [0u8; 8];
                ext.copy_from_slice(&self.buffer[8..16]);
                size = u64::from_be_bytes(ext);
                16
            } else {
                8
            };
            // A box must at least hold its own header
            if size < header_len {
                self.next_atom = 0;
                return ScanOutcome::Lost;
            }
            if &self.buffer[4..8] == TARGET_TAG {
                self.next_atom = atom;
                return ScanOutcome::Found { offset: atom, size };
            }
            let Some(next) = atom.checked_add(size) else {
                self.next_atom = 0;
                return ScanOutcome::Lost;
            };
            if next >= part_end {
                self.next_atom = next;
                return ScanOutcome::Continue {
                    next_atom: next,
                    carried: false,
                };
            }
            atom = next;
        }
    }
}

/// Where the target box was found relative to the middle of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoovState {
    NotFound,
    BeforeMidpoint,
    AfterMidpoint,
}

/// Location of a preloaded chunk inside the preload file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadedRange {
    pub file_offset: u64,
    pub length: u64,
}

/// Record to append after a chunk was taken in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadStep {
    pub file_offset: u64,
    pub record: Vec<u8>,
    pub finished: bool,
}

/// Preload scheduling and scan state of one transfer
#[derive(Debug, Clone)]
pub struct PreloadPlanner {
    scanner: BoxScanner,
    chunk_size: u64,
    total: u64,
    max_bytes: u64,
    /// Next chunk to fetch while scanning; `None` once the box is found
    next_scan_offset: Option<u64>,
    found_size: i64,
    found_offset: Option<u64>,
    moov: MoovState,
    not_requested_budget: i64,
    total_preloaded: u64,
    preloaded: HashMap<u64, PreloadedRange>,
    requested: HashSet<u64>,
    file_end: u64,
    finished: bool,
}

impl PreloadPlanner {
    pub fn new(chunk_size: u64, total: u64, max_bytes: u64) -> Self {
        Self {
            scanner: BoxScanner::new(),
            chunk_size,
            total,
            max_bytes,
            next_scan_offset: Some(0),
            found_size: 0,
            found_offset: None,
            moov: MoovState::NotFound,
            not_requested_budget: 0,
            total_preloaded: 0,
            preloaded: HashMap::new(),
            requested: HashSet::new(),
            file_end: 1,
            finished: false,
        }
    }

    /// Rebuild the planner from a parsed preload file and its raw bytes
    pub fn restore(chunk_size: u64, total: u64, max_bytes: u64, file: &PreloadFile, raw: &[u8]) -> Self {
        let mut planner = Self::new(chunk_size, total, max_bytes);
        planner.file_end = file.end.max(1);
        planner.finished = file.finished;

        for record in &file.records {
            planner.preloaded.insert(
                record.source_offset,
                PreloadedRange {
                    file_offset: record.file_offset,
                    length: record.length,
                },
            );
            planner.requested.insert(record.source_offset);
            planner.total_preloaded += record.length;
        }

        if let Some(found) = file.records.iter().find(|r| r.next_scan_offset < 0) {
            planner.moov = if found.source_offset + chunk_size < total / 2 {
                MoovState::BeforeMidpoint
            } else {
                MoovState::AfterMidpoint
            };
            planner.found_offset = Some(found.next_atom_offset.max(0) as u64);
        }

        let Some(last) = file.records.last() else {
            return planner;
        };
        planner.found_size = last.found_size;
        if planner.moov != MoovState::NotFound && !planner.finished {
            planner.found_size -= chunk_size as i64;
        }
        planner.not_requested_budget = planner.found_size;
        planner.next_scan_offset = (last.next_scan_offset >= 0).then_some(last.next_scan_offset as u64);

        let next_atom = last.next_atom_offset.max(0) as u64;
        let carried = match planner.next_scan_offset {
            Some(scan) if next_atom < scan && scan - next_atom < SCAN_BUFFER_LEN as u64 => {
                planner.bytes_at(file, raw, next_atom, scan)
            }
            _ => Vec::new(),
        };
        planner.scanner = BoxScanner::resume(next_atom, &carried);
        planner
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn moov_state(&self) -> MoovState {
        self.moov
    }

    pub fn found_offset(&self) -> Option<u64> {
        self.found_offset
    }

    pub fn total_preloaded(&self) -> u64 {
        self.total_preloaded
    }

    pub fn has_preloaded(&self) -> bool {
        !self.preloaded.is_empty()
    }

    /// Chunk previously stored in the preload file
    pub fn preloaded_range(&self, offset: u64) -> Option<PreloadedRange> {
        self.preloaded.get(&offset).copied()
    }

    /// Stop further requests once the byte budget was requested
    pub fn budget_spent(&self, requested_bytes: u64) -> bool {
        requested_bytes > self.max_bytes
    }

    /// Parallel requests are allowed once the target box is known
    pub fn allows_parallel(&self) -> bool {
        self.moov != MoovState::NotFound
    }

    /// Pick the next chunk to fetch and mark it requested
    pub fn next_request_offset(&mut self) -> Option<u64> {
        if self.finished {
            return None;
        }
        if self.moov != MoovState::NotFound && self.not_requested_budget <= 0 {
            return None;
        }

        let offset = match self.next_scan_offset {
            Some(offset) => {
                if self.requested.contains(&offset) {
                    return None;
                }
                offset
            }
            None => {
                let mut tries = self.max_bytes / self.chunk_size + 2;
                let mut offset = 0u64;
                let mut picked = None;
                while tries > 0 {
                    if !self.requested.contains(&offset) {
                        picked = Some(offset);
                        break;
                    }
                    offset += self.chunk_size;
                    if offset > self.total {
                        break;
                    }
                    if self.moov == MoovState::AfterMidpoint && offset == self.chunk_size * 8 {
                        let tail = self.total.saturating_sub(self.max_bytes / 2);
                        offset = tail / self.chunk_size * self.chunk_size;
                    }
                    tries -= 1;
                }
                picked?
            }
        };

        if offset >= self.total {
            return None;
        }
        self.requested.insert(offset);
        self.not_requested_budget -= self.chunk_size as i64;
        Some(offset)
    }

    /// Forget that `offset` was requested, e.g. after its request was dropped
    pub fn release(&mut self, offset: u64) {
        if !self.preloaded.contains_key(&offset) {
            self.requested.remove(&offset);
            self.not_requested_budget += self.chunk_size as i64;
        }
    }

    /// Take in a received chunk and produce the record to append
    pub fn on_chunk(&mut self, offset: u64, bytes: &[u8]) -> PreloadStep {
        let file_offset = self.file_end;
        let len = bytes.len() as u64;
        self.preloaded.insert(
            offset,
            PreloadedRange {
                file_offset: file_offset + 16,
                length: len,
            },
        );
        self.requested.insert(offset);
        self.total_preloaded += len;

        let mut lost = false;
        let mut past_end = false;
        if self.moov == MoovState::NotFound {
            match self.scanner.scan(offset, bytes) {
                ScanOutcome::Found { offset: atom, size } => {
                    let next = offset + self.chunk_size;
                    if next < self.total / 2 {
                        self.found_size = (self.max_bytes / 2).saturating_add(size).min(i64::MAX as u64) as i64;
                        self.moov = MoovState::BeforeMidpoint;
                    } else {
                        self.found_size = self.max_bytes as i64;
                        self.moov = MoovState::AfterMidpoint;
                    }
                    self.not_requested_budget = self.found_size;
                    self.found_offset = Some(atom);
                    self.next_scan_offset = None;
                }
                ScanOutcome::Continue { next_atom, carried } => {
                    let next = if carried {
                        offset + len
                    } else {
                        next_atom / self.chunk_size * self.chunk_size
                    };
                    past_end = next_atom >= self.total || next >= self.total;
                    self.next_scan_offset = Some(next);
                }
                ScanOutcome::Lost => {
                    lost = true;
                    self.next_scan_offset = Some(0);
                }
            }
        }

        let next_atom = match self.found_offset {
            Some(found) => found,
            None => self.scanner.next_atom(),
        };
        let record = encode_preload_record(
            offset,
            bytes,
            self.found_size,
            self.next_scan_offset.map_or(-1, |o| o as i64),
            next_atom as i64,
        );
        self.file_end += len + PRELOAD_RECORD_OVERHEAD;

        let finished = lost
            || past_end
            || (self.moov != MoovState::NotFound && self.found_size < 0)
            || self.total_preloaded > self.max_bytes;
        if finished {
            self.finished = true;
        } else if self.moov != MoovState::NotFound {
            self.found_size -= self.chunk_size as i64;
        }

        PreloadStep {
            file_offset,
            record,
            finished,
        }
    }

    /// Reset scheduling state when switching to a full download
    pub fn clear_requests(&mut self) {
        self.requested = self.preloaded.keys().copied().collect();
    }

    fn bytes_at(&self, file: &PreloadFile, raw: &[u8], start: u64, end: u64) -> Vec<u8> {
        for record in &file.records {
            let source_end = record.source_offset + record.length;
            if record.source_offset <= start && end <= source_end {
                let payload = file.payload(raw, record);
                let from = (start - record.source_offset) as usize;
                let to = (end - record.source_offset) as usize;
                return payload[from..to].to_vec();
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(size: u32, tag: &[u8; 4]) -> Vec<u8> {
        let mut out = Vec::with_capacity(size as usize);
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(tag);
        out.resize(size as usize, 0xEE);
        out
    }

    /// ftyp (32) + free (988) + moov (200): moov starts at 1020
    fn sample_stream() -> Vec<u8> {
        let mut data = atom(32, b"ftyp");
        data.extend(atom(988, b"free"));
        data.extend(atom(200, b"moov"));
        data.resize(4096, 0);
        data
    }

    #[test]
    fn test_scan_single_chunk() {
        let data = sample_stream();
        let mut scanner = BoxScanner::new();
        assert_eq!(
            scanner.scan(0, &data),
            ScanOutcome::Found {
                offset: 1020,
                size: 200
            }
        );
    }

    #[test]
    fn test_scan_header_split_across_chunks() {
        // Box header starts 4 bytes before the 1024 boundary
        let data = sample_stream();
        let mut scanner = BoxScanner::new();
        assert_eq!(
            scanner.scan(0, &data[..1024]),
            ScanOutcome::Continue {
                next_atom: 1020,
                carried: true
            }
        );
        assert_eq!(
            scanner.scan(1024, &data[1024..2048]),
            ScanOutcome::Found {
                offset: 1020,
                size: 200
            }
        );
    }

    #[test]
    fn test_scan_box_past_chunk_and_extended_size() {
        let mut data = atom(16, b"ftyp");
        // 64-bit size mdat of 3000 bytes
        let mut mdat = Vec::new();
        mdat.extend_from_slice(&1u32.to_be_bytes());
        mdat.extend_from_slice(b"mdat");
        mdat.extend_from_slice(&3000u64.to_be_bytes());
        mdat.resize(3000, 0);
        data.extend(mdat);
        data.extend(atom(64, b"moov"));

        let mut scanner = BoxScanner::new();
        assert_eq!(
            scanner.scan(0, &data[..1024]),
            ScanOutcome::Continue {
                next_atom: 3016,
                carried: false
            }
        );
        assert_eq!(
            scanner.scan(3072, &data[3072..]),
            ScanOutcome::Lost,
            "header before the chunk without carried bytes cannot be read"
        );

        let mut scanner = BoxScanner::resume(3016, &[]);
        assert_eq!(
            scanner.scan(2048, &data[2048..]),
            ScanOutcome::Found {
                offset: 3016,
                size: 64
            }
        );
    }

    #[test]
    fn test_scan_zero_size_is_lost() {
        let mut data = atom(32, b"ftyp");
        data.extend_from_slice(&[0u8; 64]);
        assert_eq!(BoxScanner::new().scan(0, &data), ScanOutcome::Lost);
    }

    #[test]
    fn test_scan_zero_extended_size_is_lost() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.extend_from_slice(&0u64.to_be_bytes());
        data.resize(4096, 0);
        assert_eq!(BoxScanner::new().scan(0, &data), ScanOutcome::Lost);

        // 32-bit sizes smaller than the header
        let mut data = atom(32, b"ftyp");
        data.extend_from_slice(&7u32.to_be_bytes());
        data.extend_from_slice(b"skip");
        data.resize(4096, 0);
        assert_eq!(BoxScanner::new().scan(0, &data), ScanOutcome::Lost);
    }

    #[test]
    fn test_scan_oversized_extended_size_is_lost() {
        let mut data = atom(32, b"ftyp");
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&u64::MAX.to_be_bytes());
        data.resize(4096, 0);
        assert_eq!(BoxScanner::new().scan(0, &data), ScanOutcome::Lost);
    }

    // Budget constants are empirical
    #[test]
    fn test_planner_budget_before_midpoint() {
        let chunk = 1024u64;
        let total = 64 * 1024;
        let data = sample_stream();
        let mut planner = PreloadPlanner::new(chunk, total, 8 * 1024);

        assert_eq!(planner.next_request_offset(), Some(0));
        let step = planner.on_chunk(0, &data[..1024]);
        assert!(!step.finished);
        assert_eq!(step.file_offset, 1);
        assert_eq!(planner.next_request_offset(), Some(1024));

        let step = planner.on_chunk(1024, &data[1024..2048]);
        assert!(!step.finished);
        assert_eq!(step.file_offset, 1 + 1024 + PRELOAD_RECORD_OVERHEAD);
        assert_eq!(planner.moov_state(), MoovState::BeforeMidpoint);
        assert_eq!(planner.found_offset(), Some(1020));
        // 8 KiB / 2 + 200 bytes, minus the chunk just received
        assert_eq!(planner.found_size, 4 * 1024 + 200 - 1024);
        assert!(planner.allows_parallel());
        assert_eq!(planner.next_request_offset(), Some(2048));
    }

    #[test]
    fn test_planner_after_midpoint_jumps_to_tail() {
        let chunk = 1024u64;
        let total = 32 * 1024;
        let mut planner = PreloadPlanner::new(chunk, total, 16 * 1024);
        planner.moov = MoovState::AfterMidpoint;
        planner.next_scan_offset = None;
        planner.not_requested_budget = 16 * 1024;

        let offsets: Vec<u64> = std::iter::from_fn(|| planner.next_request_offset()).collect();
        assert_eq!(offsets.len(), 16);
        assert_eq!(&offsets[..8], &[0, 1024, 2048, 3072, 4096, 5120, 6144, 7168]);
        assert_eq!(offsets[8], 24 * 1024);
    }

    #[test]
    fn test_restore_resumes_carried_header() {
        let chunk = 1024u64;
        let total = 64 * 1024;
        let data = sample_stream();
        let mut planner = PreloadPlanner::new(chunk, total, 8 * 1024);
        planner.next_request_offset();
        let step = planner.on_chunk(0, &data[..1024]);

        let mut raw = vec![0u8];
        raw.extend(&step.record);
        let file = PreloadFile::parse(&raw, total, chunk);
        let mut restored = PreloadPlanner::restore(chunk, total, 8 * 1024, &file, &raw);
        assert_eq!(restored.total_preloaded(), 1024);
        assert_eq!(restored.preloaded_range(0).map(|r| r.file_offset), Some(17));
        assert_eq!(restored.next_request_offset(), Some(1024));

        restored.on_chunk(1024, &data[1024..2048]);
        assert_eq!(restored.found_offset(), Some(1020));
    }
}
