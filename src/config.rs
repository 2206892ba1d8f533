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


//! Transfer configuration
//!
//! # Profiles
//! - [`TransferConfig::default`] - 512 KiB chunks for small files, 128 KiB chunks
//!   for files from 10 MiB upward, 4 parallel requests
//! - [`TransferConfig::high_throughput`] - 512 KiB chunks for every size class,
//!   8 parallel requests
//!
//! Chunk sizes must stay multiples of 16 (block ciphers) and divide the CDN
//! check window, so every window is covered by whole chunks.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const KIB: u32 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Largest file the CDN check bookkeeping is sized for (4000 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4000 * MIB;

/// Engine configuration shared by every operation of a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for files below `big_file_size_from`
    pub chunk_size: u32,

    /// Chunk size for files from `big_file_size_from` upward
    pub chunk_size_big: u32,

    /// Chunk size for stream-priority transfers (progressive playback)
    pub stream_chunk_size: u32,

    /// Maximum in-flight requests for small files
    pub max_requests: usize,

    /// Maximum in-flight requests for big files
    pub max_requests_big: usize,

    /// Maximum in-flight requests for stream-priority transfers
    pub max_requests_stream: usize,

    /// Size class boundary in bytes
    pub big_file_size_from: u64,

    /// CDN hash window in bytes
    pub cdn_chunk_check_size: u32,

    /// Preload byte budget for video previews
    pub preload_max_bytes: u64,

    /// Attempts to rename temp → final before keeping the temp path
    pub rename_retry_limit: u32,

    /// Delay between rename attempts in milliseconds
    pub rename_retry_delay_ms: u64,

    /// Re-issues of a chunk after transient transport errors
    pub max_chunk_retries: u32,

    /// Upper bound for transfer size used to size CDN bookkeeping
    pub max_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512 * KIB,
            chunk_size_big: 128 * KIB,
            stream_chunk_size: 128 * KIB,
            max_requests: 4,
            max_requests_big: 4,
            max_requests_stream: 4,
            big_file_size_from: 10 * MIB,
            cdn_chunk_check_size: 1024 * KIB,
            preload_max_bytes: 2 * MIB,
            rename_retry_limit: 3,
            rename_retry_delay_ms: 200,
            max_chunk_retries: 3,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl TransferConfig {
    /// Profile with bigger chunks and more parallel requests
    pub fn high_throughput() -> Self {
        Self {
            chunk_size_big: 512 * KIB,
            max_requests: 8,
            max_requests_big: 8,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file, filling missing fields with defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: TransferConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the transfer engine relies on
    pub fn validate(&self) -> Result<()> {
        let check = self.cdn_chunk_check_size;
        for (name, size) in [
            ("chunk_size", self.chunk_size),
            ("chunk_size_big", self.chunk_size_big),
            ("stream_chunk_size", self.stream_chunk_size),
        ] {
            if size == 0 || size % 16 != 0 {
                return Err(TransferError::InvalidConfiguration(format!(
                    "{} must be a non-zero multiple of 16, got {}",
                    name, size
                )));
            }
            if check % size != 0 {
                return Err(TransferError::InvalidConfiguration(format!(
                    "{} ({}) must divide cdn_chunk_check_size ({})",
                    name, size, check
                )));
            }
        }
        if self.max_requests == 0 || self.max_requests_big == 0 || self.max_requests_stream == 0 {
            return Err(TransferError::InvalidConfiguration(
                "request limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Chunk size and parallelism for a transfer of `total` bytes
    pub fn chunking_for(&self, total: u64, stream_priority: bool) -> (u64, usize) {
        if stream_priority {
            (self.stream_chunk_size as u64, self.max_requests_stream)
        } else if total >= self.big_file_size_from {
            (self.chunk_size_big as u64, self.max_requests_big)
        } else {
            (self.chunk_size as u64, self.max_requests)
        }
    }

    pub fn rename_retry_delay(&self) -> Duration {
        Duration::from_millis(self.rename_retry_delay_ms)
    }
}
