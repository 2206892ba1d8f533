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


//! Offset-keyed AES-256-CTR
//!
//! Used for CDN-relayed bytes and for files kept encrypted at rest. The
//! counter for a chunk is the base IV with bytes 12..16 replaced by the
//! chunk's block index (`offset / 16`, big-endian, low 32 bits), so any
//! 16-byte aligned slice can be processed without state from earlier chunks.

use crate::error::{Result, TransferError};
use aes::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use rand::RngCore;

type Aes256Ctr = ::ctr::Ctr128BE<aes::Aes256>;

/// Stateless counter-mode cipher
#[derive(Clone, PartialEq, Eq)]
pub struct CtrCipher {
    key: [u8; 32],
    iv: [u8; 16],
}

impl std::fmt::Debug for CtrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrCipher").finish_non_exhaustive()
    }
}

impl CtrCipher {
    pub fn new(key: [u8; 32], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Build from server-supplied byte strings
    ///
    /// # Errors
    /// `MalformedCdnRedirect` if the key is not 32 bytes or the IV not 16
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| {
            TransferError::MalformedCdnRedirect(format!("key has {} bytes", key.len()))
        })?;
        let iv: [u8; 16] = iv.try_into().map_err(|_| {
            TransferError::MalformedCdnRedirect(format!("iv has {} bytes", iv.len()))
        })?;
        Ok(Self::new(key, iv))
    }

    /// Fresh random key and IV
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self::new(key, iv)
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    /// Encrypt or decrypt `data` that starts at absolute `offset`
    pub fn apply_at(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        if offset % 16 != 0 {
            return Err(TransferError::decryption(format!(
                "CTR offset {} is not block aligned",
                offset
            )));
        }
        let mut iv = self.iv;
        iv[12..16].copy_from_slice(&((offset / 16) as u32).to_be_bytes());

        let mut cipher = Aes256Ctr::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&iv),
        );
        cipher.apply_keystream(data);
        Ok(())
    }
}
