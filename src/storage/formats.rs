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


//! Binary layouts of the preload and key files
//!
//! # Preload file
//! ```text
//! u8   finished flag
//! repeated:
//!   i64  source offset
//!   i64  payload length
//!   [u8] payload
//!   i64  found box size
//!   i64  next scan offset
//!   i64  next atom offset
//! ```
//! All integers are big-endian. Parsing stops at the first record that is
//! truncated or inconsistent; later appends overwrite that tail.
//!
//! # Key file
//! 32-byte key followed by a 16-byte IV.

use crate::crypto::CtrCipher;
use serde::Serialize;

/// Bytes a preload record adds on top of its payload
pub const PRELOAD_RECORD_OVERHEAD: u64 = 40;

/// Length of the key file
pub const KEY_FILE_LEN: usize = 48;

/// One parsed preload record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreloadRecord {
    /// Offset of the payload in the transfer
    pub source_offset: u64,
    /// Offset of the payload inside the preload file
    pub file_offset: u64,
    pub length: u64,
    pub found_size: i64,
    pub next_scan_offset: i64,
    pub next_atom_offset: i64,
}

/// Parsed preload file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreloadFile {
    pub finished: bool,
    pub records: Vec<PreloadRecord>,
    /// Offset at which the next record is appended
    pub end: u64,
}

impl PreloadFile {
    /// Parse a preload file, keeping every valid leading record
    ///
    /// `total` bounds source offsets and `max_chunk` bounds payload sizes.
    pub fn parse(bytes: &[u8], total: u64, max_chunk: u64) -> Self {
        let mut file = PreloadFile {
            finished: false,
            records: Vec::new(),
            end: 1,
        };
        let Some(&flag) = bytes.first() else {
            file.end = 0;
            return file;
        };
        file.finished = flag != 0;

        let mut pos: u64 = 1;
        let len = bytes.len() as u64;
        while pos + 16 <= len {
            let source_offset = read_i64(bytes, pos);
            let length = read_i64(bytes, pos + 8);
            if source_offset < 0 || source_offset as u64 > total || length <= 0 || length as u64 > max_chunk {
                break;
            }
            let file_offset = pos + 16;
            let tail = file_offset + length as u64;
            if tail + 24 > len {
                break;
            }
            file.records.push(PreloadRecord {
                source_offset: source_offset as u64,
                file_offset,
                length: length as u64,
                found_size: read_i64(bytes, tail),
                next_scan_offset: read_i64(bytes, tail + 8),
                next_atom_offset: read_i64(bytes, tail + 16),
            });
            pos = tail + 24;
        }
        file.end = pos;
        file
    }

    /// Payload bytes of `record` inside the raw file
    pub fn payload<'a>(&self, bytes: &'a [u8], record: &PreloadRecord) -> &'a [u8] {
        let start = record.file_offset as usize;
        &bytes[start..start + record.length as usize]
    }
}

/// Encode one preload record
pub fn encode_preload_record(
    source_offset: u64,
    payload: &[u8],
    found_size: i64,
    next_scan_offset: i64,
    next_atom_offset: i64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + PRELOAD_RECORD_OVERHEAD as usize);
    out.extend_from_slice(&(source_offset as i64).to_be_bytes());
    out.extend_from_slice(&(payload.len() as i64).to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&found_size.to_be_bytes());
    out.extend_from_slice(&next_scan_offset.to_be_bytes());
    out.extend_from_slice(&next_atom_offset.to_be_bytes());
    out
}

/// Parse a key file; anything but a positive multiple of 48 bytes is ignored
pub fn parse_key_file(bytes: &[u8]) -> Option<CtrCipher> {
    if bytes.is_empty() || bytes.len() % KEY_FILE_LEN != 0 {
        return None;
    }
    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&bytes[..32]);
    iv.copy_from_slice(&bytes[32..48]);
    Some(CtrCipher::new(key, iv))
}

pub fn encode_key_file(cipher: &CtrCipher) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEY_FILE_LEN);
    out.extend_from_slice(cipher.key());
    out.extend_from_slice(cipher.iv());
    out
}

fn read_i64(bytes: &[u8], pos: u64) -> i64 {
    let pos = pos as usize;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[pos..pos + 8]);
    i64::from_be_bytes(buf)
}
