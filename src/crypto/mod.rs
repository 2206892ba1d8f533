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


//! Chunk decryption
//!
//! # Schemes
//! - **Whole-file** ([`ige::IgeCipher`]): one key and IV for the entire
//!   transfer, used for end-to-end encrypted documents. The running IV is
//!   persisted after each chunk. The transfer size is padded to 16 bytes and
//!   the padding is trimmed from the last chunk.
//! - **Counter** ([`ctr::CtrCipher`]): keyed per block by absolute offset,
//!   used for CDN-relayed bytes and for at-rest encryption of local files.
//!
//! A [`CipherContext`] bundles the schemes that apply to one transfer on the
//! write path. CDN decryption lives with the CDN session.

pub mod ctr;
pub mod ige;

pub use self::ctr::CtrCipher;
pub use self::ige::IgeCipher;

use crate::error::{Result, TransferError};

/// Size of the persisted IV-state block
pub const IV_STATE_LEN: usize = 64;

/// Whole-file cipher plus its starting IV, kept for restarts
#[derive(Clone)]
struct WholeFile {
    cipher: IgeCipher,
    initial_iv: [u8; 32],
    key: [u8; 32],
}

/// Ciphers applied to received chunks before they reach the temp file
#[derive(Clone, Default)]
pub struct CipherContext {
    whole_file: Option<WholeFile>,
    at_rest: Option<CtrCipher>,
}

impl CipherContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable whole-file IGE decryption
    pub fn with_whole_file(mut self, key: &[u8; 32], iv: &[u8; 32]) -> Self {
        self.whole_file = Some(WholeFile {
            cipher: IgeCipher::new(key, iv),
            initial_iv: *iv,
            key: *key,
        });
        self
    }

    /// Enable at-rest counter encryption of written bytes
    pub fn with_at_rest(mut self, cipher: CtrCipher) -> Self {
        self.at_rest = Some(cipher);
        self
    }

    pub fn has_whole_file(&self) -> bool {
        self.whole_file.is_some()
    }

    pub fn at_rest(&self) -> Option<&CtrCipher> {
        self.at_rest.as_ref()
    }

    /// Turn a received chunk into the bytes stored at `offset`
    ///
    /// Whole-file decryption runs first, then `trim` padding bytes are cut
    /// from the tail, then the at-rest layer is applied.
    pub fn process_chunk(&mut self, offset: u64, data: &mut Vec<u8>, trim: usize) -> Result<()> {
        if let Some(whole) = self.whole_file.as_mut() {
            whole.cipher.decrypt_in_place(data)?;
        }
        if trim > 0 {
            if trim > data.len() {
                return Err(TransferError::decryption(format!(
                    "padding of {} bytes exceeds final chunk of {} bytes",
                    trim,
                    data.len()
                )));
            }
            data.truncate(data.len() - trim);
        }
        if let Some(at_rest) = &self.at_rest {
            at_rest.apply_at(offset, data)?;
        }
        Ok(())
    }

    /// Undo the at-rest layer for bytes read back from disk
    pub fn reveal_stored(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        match &self.at_rest {
            Some(at_rest) => at_rest.apply_at(offset, data),
            None => Ok(()),
        }
    }

    /// IV-state block to persist, if a whole-file cipher is active
    pub fn iv_state_block(&self) -> Option<[u8; IV_STATE_LEN]> {
        self.whole_file.as_ref().map(|whole| {
            let mut block = [0u8; IV_STATE_LEN];
            block[..32].copy_from_slice(&whole.cipher.iv_state());
            block
        })
    }

    /// Continue whole-file decryption from a persisted IV-state block
    pub fn restore_iv_state(&mut self, block: &[u8]) -> Result<()> {
        let Some(whole) = self.whole_file.as_mut() else {
            return Ok(());
        };
        if block.is_empty() || block.len() % IV_STATE_LEN != 0 {
            return Err(TransferError::invalid_data(format!(
                "IV file has invalid length {}",
                block.len()
            )));
        }
        let mut iv = [0u8; 32];
        iv.copy_from_slice(&block[..32]);
        whole.cipher.restore(&iv);
        Ok(())
    }

    /// Restart whole-file decryption from the first byte
    pub fn reset(&mut self) {
        if let Some(whole) = self.whole_file.as_mut() {
            whole.cipher = IgeCipher::new(&whole.key, &whole.initial_iv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_chunk_trims_padding() {
        let key = [3u8; 32];
        let iv = [9u8; 32];
        let plain: Vec<u8> = (0..48u8).collect();
        let mut wire = plain.clone();
        IgeCipher::new(&key, &iv).encrypt_in_place(&mut wire).unwrap();

        let mut ctx = CipherContext::new().with_whole_file(&key, &iv);
        ctx.process_chunk(0, &mut wire, 11).unwrap();
        assert_eq!(wire.len(), 37);
        assert_eq!(&wire[..], &plain[..37]);
    }

    #[test]
    fn test_iv_state_round_trip_and_reset() {
        let key = [1u8; 32];
        let iv = [2u8; 32];
        let mut ctx = CipherContext::new().with_whole_file(&key, &iv);
        let mut chunk = vec![0u8; 32];
        ctx.process_chunk(0, &mut chunk, 0).unwrap();

        let block = ctx.iv_state_block().unwrap();
        assert_eq!(&block[32..], &[0u8; 32]);
        assert_ne!(&block[..32], &iv);

        let mut resumed = CipherContext::new().with_whole_file(&key, &iv);
        resumed.restore_iv_state(&block).unwrap();
        assert_eq!(resumed.iv_state_block(), Some(block));

        resumed.reset();
        assert_eq!(&resumed.iv_state_block().unwrap()[..32], &iv);
        assert!(resumed.restore_iv_state(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_at_rest_layer_round_trip() {
        let at_rest = CtrCipher::random();
        let mut ctx = CipherContext::new().with_at_rest(at_rest);
        let original = vec![5u8; 64];
        let mut stored = original.clone();
        ctx.process_chunk(32, &mut stored, 0).unwrap();
        assert_ne!(stored, original);

        ctx.reveal_stored(32, &mut stored).unwrap();
        assert_eq!(stored, original);
        assert!(ctx.iv_state_block().is_none());
    }
}
