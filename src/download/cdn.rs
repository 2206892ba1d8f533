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


//! CDN relay session
//!
//! After a redirect the transfer fetches chunks from a CDN datacenter with a
//! file token. CDN bytes are AES-256-CTR encrypted with the session key and
//! checked against server-supplied SHA-256 hashes, one hash per
//! `cdn_chunk_check_size` window.
//!
//! # Gate
//! - a CDN chunk is only applied once the hash of its window is known
//! - a window leaves the not-checked set only after its hash matched
//! - readers never see bytes of a window that is still not checked

use crate::crypto::CtrCipher;
use crate::download::ranges::RangeSet;
use crate::error::{Result, TransferError};
use crate::transport::{CdnRedirect, FileHash};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Negotiated CDN state of one transfer
#[derive(Debug)]
pub struct CdnSession {
    datacenter_id: i32,
    file_token: Vec<u8>,
    cipher: CtrCipher,
    hashes: HashMap<u64, FileHash>,
    check_size: u64,
    not_checked: RangeSet,
    /// Complete windows waiting for their hash
    pending: BTreeSet<u64>,
    hash_request: Option<u64>,
    reuploading: bool,
}

impl CdnSession {
    /// Open a session from a redirect
    ///
    /// `unchecked` lists the byte ranges that still need verification,
    /// typically the bytes not downloaded yet; they are widened to whole
    /// windows.
    ///
    /// # Errors
    /// `MalformedCdnRedirect` for a key or IV of the wrong size
    pub fn from_redirect(redirect: CdnRedirect, check_size: u64, unchecked: &RangeSet) -> Result<Self> {
        let cipher = CtrCipher::from_slices(&redirect.encryption_key, &redirect.encryption_iv)?;
        if redirect.file_token.is_empty() {
            return Err(TransferError::MalformedCdnRedirect("empty file token".to_string()));
        }

        let mut not_checked = RangeSet::new();
        for range in unchecked.iter() {
            let start = range.start / check_size * check_size;
            let end = range.end.div_ceil(check_size) * check_size;
            not_checked.insert(start, end);
        }

        let mut session = Self {
            datacenter_id: redirect.datacenter_id,
            file_token: redirect.file_token,
            cipher,
            hashes: HashMap::new(),
            check_size,
            not_checked,
            pending: BTreeSet::new(),
            hash_request: None,
            reuploading: false,
        };
        session.merge_hashes(redirect.file_hashes);
        Ok(session)
    }

    pub fn datacenter_id(&self) -> i32 {
        self.datacenter_id
    }

    pub fn file_token(&self) -> &[u8] {
        &self.file_token
    }

    pub fn check_size(&self) -> u64 {
        self.check_size
    }

    /// Decrypt a CDN chunk starting at `offset`
    pub fn decrypt(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.cipher.apply_at(offset, data)
    }

    /// Start of the window holding `offset`
    pub fn window_of(&self, offset: u64) -> u64 {
        offset / self.check_size * self.check_size
    }

    pub fn has_hash(&self, window: u64) -> bool {
        self.hashes.contains_key(&window)
    }

    pub fn is_checked(&self, window: u64) -> bool {
        !self.not_checked.contains(window)
    }

    pub fn merge_hashes(&mut self, hashes: Vec<FileHash>) {
        for hash in hashes {
            self.hashes.insert(hash.offset, hash);
        }
    }

    /// Record that a hash fetch for `window` is on the wire
    ///
    /// Returns false if one is already outstanding.
    pub fn begin_hash_request(&mut self, window: u64) -> bool {
        if self.hash_request.is_some() {
            return false;
        }
        self.hash_request = Some(window);
        true
    }

    /// Window of the hash fetch that just answered
    pub fn end_hash_request(&mut self) -> Option<u64> {
        self.hash_request.take()
    }

    pub fn is_reuploading(&self) -> bool {
        self.reuploading
    }

    pub fn set_reuploading(&mut self, reuploading: bool) {
        self.reuploading = reuploading;
    }

    /// Park a complete window until its hash arrives
    pub fn defer(&mut self, window: u64) {
        self.pending.insert(window);
    }

    /// Parked windows whose hash is now known
    pub fn take_verifiable(&mut self) -> Vec<u64> {
        let ready: Vec<u64> = self
            .pending
            .iter()
            .copied()
            .filter(|w| self.hashes.contains_key(w))
            .collect();
        for window in &ready {
            self.pending.remove(window);
        }
        ready
    }

    /// Parked window still missing its hash
    pub fn first_pending(&self) -> Option<u64> {
        self.pending.iter().next().copied()
    }

    /// Compare the plaintext of a complete window with its hash
    ///
    /// # Errors
    /// `IntegrityFailure` on mismatch, `InvalidState` without a hash
    pub fn verify(&mut self, window: u64, data: &[u8]) -> Result<()> {
        let expected = self
            .hashes
            .get(&window)
            .ok_or_else(|| TransferError::InvalidState(format!("no CDN hash for window {}", window)))?;

        let actual = Sha256::digest(data);
        if actual.as_slice() != expected.hash.as_slice() {
            return Err(TransferError::IntegrityFailure { offset: window });
        }

        debug!(window, len = data.len(), "CDN window verified");
        self.hashes.remove(&window);
        self.not_checked.remove(window, window + self.check_size);
        Ok(())
    }

    /// Verified bytes available from `offset`, capped at `length`
    pub fn coverage_from(&self, offset: u64, length: u64, total: u64) -> u64 {
        self.not_checked.coverage_from(offset, length, total)
    }
}
