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


//! AES-256 in infinite garble extension (IGE) mode
//!
//! IGE chains every block to both the previous ciphertext and the previous
//! plaintext, so decryption of chunk N needs the state left behind by chunk
//! N-1. The 32-byte running IV is exposed so it can be persisted after every
//! chunk.
//!
//! # IV layout
//! - bytes 0..16: previous ciphertext block
//! - bytes 16..32: previous plaintext block

use crate::error::{Result, TransferError};
use aes::cipher::{generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, IvState, KeyIvInit};
use aes::Aes256;

type Aes256IgeDec = ige::Decryptor<Aes256>;
type Aes256IgeEnc = ige::Encryptor<Aes256>;

const BLOCK: usize = 16;

/// IGE cipher over AES-256 that carries its running IV between chunks
#[derive(Clone)]
pub struct IgeCipher {
    key: [u8; 32],
    iv: [u8; 32],
}

impl IgeCipher {
    pub fn new(key: &[u8; 32], iv: &[u8; 32]) -> Self {
        Self { key: *key, iv: *iv }
    }

    /// Current 32-byte running IV
    pub fn iv_state(&self) -> [u8; 32] {
        self.iv
    }

    /// Continue from a previously persisted running IV
    pub fn restore(&mut self, iv: &[u8; 32]) {
        self.iv = *iv;
    }

    /// Decrypt `data` in place and advance the running IV
    ///
    /// # Errors
    /// `DecryptionFailed` when `data` is not a whole number of blocks
    pub fn decrypt_in_place(&mut self, data: &mut [u8]) -> Result<()> {
        check_blocks(data.len())?;
        let mut decryptor = Aes256IgeDec::new((&self.key).into(), (&self.iv).into());
        for block in data.chunks_exact_mut(BLOCK) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.iv.copy_from_slice(&decryptor.iv_state());
        Ok(())
    }

    /// Encrypt `data` in place and advance the running IV
    pub fn encrypt_in_place(&mut self, data: &mut [u8]) -> Result<()> {
        check_blocks(data.len())?;
        let mut encryptor = Aes256IgeEnc::new((&self.key).into(), (&self.iv).into());
        for block in data.chunks_exact_mut(BLOCK) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.iv.copy_from_slice(&encryptor.iv_state());
        Ok(())
    }
}

fn check_blocks(len: usize) -> Result<()> {
    if len % BLOCK != 0 {
        return Err(TransferError::decryption(format!(
            "IGE input of {} bytes is not a multiple of {}",
            len, BLOCK
        )));
    }
    Ok(())
}
