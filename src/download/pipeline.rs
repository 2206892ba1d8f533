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


//! Chunk request bookkeeping
//!
//! The pipeline owns every issued [`ChunkRequest`] until it is applied or
//! cancelled. It decides the next offset, bounds the number of outstanding
//! requests, parks completions that cannot be applied yet and tracks the
//! stream-priority fast lane.
//!
//! # Offset selection
//! 1. a chunk that has to be re-issued after a transient error
//! 2. with a not-requested set: the stream offset if it is still missing,
//!    else the first missing offset after it, else the lowest missing offset
//! 3. without one: the sequential request cursor

use crate::download::ranges::RangeSet;
use crate::transport::{ConnectionType, RequestToken};
use std::collections::{HashMap, VecDeque};

/// Bytes delivered for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    Direct(Vec<u8>),
    Web(Vec<u8>),
    Cdn(Vec<u8>),
    /// Served from the preload file instead of the network
    Preloaded(Vec<u8>),
}

impl ChunkPayload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ChunkPayload::Direct(b) | ChunkPayload::Web(b) | ChunkPayload::Cdn(b) | ChunkPayload::Preloaded(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ChunkPayload::Direct(b) | ChunkPayload::Web(b) | ChunkPayload::Cdn(b) | ChunkPayload::Preloaded(b) => b,
        }
    }

    pub fn is_cdn(&self) -> bool {
        matches!(self, ChunkPayload::Cdn(_))
    }
}

/// One issued chunk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub token: RequestToken,
    pub offset: u64,
    pub payload: Option<ChunkPayload>,
    pub completed: bool,
    /// Sent to a CDN session rather than the origin
    pub via_cdn: bool,
}

/// Everything released by [`ChunkRequestPipeline::clear`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Cleared {
    /// Requests still on the wire that must be cancelled
    pub cancelled: Vec<RequestToken>,
    /// Offsets of in-flight and delayed requests
    pub released: Vec<u64>,
}

impl Cleared {
    pub fn min_offset(&self) -> Option<u64> {
        self.released.iter().copied().min()
    }
}

#[derive(Debug)]
pub struct ChunkRequestPipeline {
    chunk_size: u64,
    max_in_flight: usize,
    in_flight: Vec<ChunkRequest>,
    delayed: Vec<ChunkRequest>,
    requested_bytes: u64,
    stream_start_offset: u64,
    priority_offset: Option<u64>,
    priority_token: Option<RequestToken>,
    sent: u64,
    retries: HashMap<u64, u32>,
    retry_queue: VecDeque<u64>,
}

impl ChunkRequestPipeline {
    pub fn new(chunk_size: u64, max_in_flight: usize) -> Self {
        Self {
            chunk_size,
            max_in_flight,
            in_flight: Vec::new(),
            delayed: Vec::new(),
            requested_bytes: 0,
            stream_start_offset: 0,
            priority_offset: None,
            priority_token: None,
            sent: 0,
            retries: HashMap::new(),
            retry_queue: VecDeque::new(),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// Requests issued and not yet applied
    pub fn outstanding(&self) -> usize {
        self.in_flight.len() + self.delayed.len()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    pub fn requested_bytes(&self) -> u64 {
        self.requested_bytes
    }

    pub fn set_requested_bytes(&mut self, bytes: u64) {
        self.requested_bytes = bytes;
    }

    /// Advance the sequential cursor past an issued chunk
    pub fn advance_cursor(&mut self) {
        self.requested_bytes += self.chunk_size;
    }

    /// Step the sequential cursor back over a withdrawn chunk
    pub fn rewind_cursor(&mut self) {
        self.requested_bytes = self.requested_bytes.saturating_sub(self.chunk_size);
    }

    /// A priority offset waits for its request
    pub fn has_priority_offset(&self) -> bool {
        self.priority_offset.is_some()
    }

    /// No new request may be issued without a pending priority offset
    pub fn is_saturated(&self) -> bool {
        self.priority_offset.is_none() && self.outstanding() >= self.max_in_flight
    }

    /// Number of requests to issue in one scheduling pass
    pub fn free_slots(&self) -> usize {
        self.max_in_flight.saturating_sub(self.in_flight.len())
    }

    pub fn stream_offset(&self) -> u64 {
        self.priority_offset.unwrap_or(self.stream_start_offset)
    }

    pub fn set_stream_start(&mut self, offset: u64) {
        self.stream_start_offset = offset / self.chunk_size * self.chunk_size;
    }

    /// Ask for `offset` ahead of everything else
    ///
    /// A priority request still in flight for another chunk is withdrawn and
    /// returned so the caller can cancel it and give its range back.
    pub fn set_priority(&mut self, offset: u64) -> Option<ChunkRequest> {
        let offset = offset / self.chunk_size * self.chunk_size;
        let mut withdrawn = None;
        if let Some(token) = self.priority_token {
            let stale = self
                .in_flight
                .iter()
                .position(|r| r.token == token && r.offset != offset);
            if let Some(idx) = stale {
                withdrawn = Some(self.in_flight.remove(idx));
                self.priority_token = None;
            }
        }
        if self.priority_token.is_none() {
            self.priority_offset = Some(offset);
        } else {
            self.stream_start_offset = offset;
        }
        withdrawn
    }

    /// Next offset to request, without marking it
    pub fn select_offset(&mut self, not_requested: Option<&RangeSet>) -> Option<u64> {
        if let (Some(priority), Some(set)) = (self.priority_offset, not_requested) {
            if set.contains(priority) {
                return Some(priority);
            }
        }
        if let Some(offset) = self.retry_queue.pop_front() {
            return Some(offset);
        }
        match not_requested {
            Some(set) => {
                let stream = self.stream_offset();
                if stream != 0 {
                    if set.contains(stream) {
                        return Some(stream);
                    }
                    if let Some(start) = set.next_start_after(stream) {
                        return Some(start);
                    }
                }
                set.first_start()
            }
            None => Some(self.requested_bytes),
        }
    }

    /// Connection for the next request; alternates between two download lanes
    pub fn next_connection(&self) -> ConnectionType {
        if self.sent % 2 == 0 {
            ConnectionType::Download
        } else {
            ConnectionType::Download2
        }
    }

    /// Register an issued request
    ///
    /// The first request issued while a priority offset is pending becomes
    /// the priority request.
    pub fn issue(&mut self, token: RequestToken, offset: u64, via_cdn: bool) {
        if self.priority_offset.take().is_some() {
            self.priority_token = Some(token);
        }
        self.sent += 1;
        self.in_flight.push(ChunkRequest {
            token,
            offset,
            payload: None,
            completed: false,
            via_cdn,
        });
    }

    pub fn contains(&self, token: RequestToken) -> bool {
        self.in_flight.iter().any(|r| r.token == token)
    }

    /// Offset of an in-flight request
    pub fn offset_of(&self, token: RequestToken) -> Option<u64> {
        self.in_flight.iter().find(|r| r.token == token).map(|r| r.offset)
    }

    pub fn is_cdn_request(&self, token: RequestToken) -> bool {
        self.in_flight.iter().any(|r| r.token == token && r.via_cdn)
    }

    /// Remove an in-flight request; `None` means it is stale
    pub fn take(&mut self, token: RequestToken) -> Option<ChunkRequest> {
        let idx = self.in_flight.iter().position(|r| r.token == token)?;
        if self.priority_token == Some(token) {
            self.priority_token = None;
        }
        Some(self.in_flight.remove(idx))
    }

    /// Park a completed request until it can be applied
    pub fn delay(&mut self, request: ChunkRequest) {
        self.delayed.push(request);
    }

    pub fn delayed(&self) -> impl Iterator<Item = &ChunkRequest> {
        self.delayed.iter()
    }

    /// First parked request accepted by `ready`
    pub fn take_ready_delayed<F>(&mut self, ready: F) -> Option<ChunkRequest>
    where
        F: Fn(&ChunkRequest) -> bool,
    {
        let idx = self.delayed.iter().position(|r| ready(r))?;
        Some(self.delayed.remove(idx))
    }

    /// Count a transient failure of `offset`; false once `limit` is exceeded
    pub fn record_retry(&mut self, offset: u64, limit: u32) -> bool {
        let attempts = self.retries.entry(offset).or_insert(0);
        *attempts += 1;
        *attempts <= limit
    }

    pub fn retry_count(&self, offset: u64) -> u32 {
        self.retries.get(&offset).copied().unwrap_or(0)
    }

    /// Re-issue `offset` before advancing the sequential cursor
    pub fn queue_retry(&mut self, offset: u64) {
        self.retry_queue.push_back(offset);
    }

    /// Drop every request except `except`
    pub fn clear(&mut self, except: Option<RequestToken>) -> Cleared {
        let mut cleared = Cleared::default();
        for request in self.in_flight.drain(..) {
            cleared.released.push(request.offset);
            if Some(request.token) != except {
                cleared.cancelled.push(request.token);
            }
        }
        for request in self.delayed.drain(..) {
            cleared.released.push(request.offset);
        }
        self.retry_queue.clear();
        self.priority_token = None;
        self.sent = 0;
        cleared
    }
}
