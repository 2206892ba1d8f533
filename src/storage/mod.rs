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


//! Persisted transfer artifacts
//!
//! Everything a transfer needs to resume after a restart lives next to its
//! temp data file:
//!
//! - **Range file** (`{base}_64.pt`): not-loaded ranges, see
//!   [`crate::download::ranges::RangeSet::to_bytes`]
//! - **IV file** (`{base}_64.iv`): 64-byte whole-file cipher state
//! - **Preload file** (`{base}_64.preload`): finished flag and preload records
//! - **Key file** (`{final}.key`): at-rest key and IV
//!
//! All auxiliary writes go through one [`ArtifactWriter`] task per context.
//!
//! # Usage Example
//! ```no_run
//! use chunkload_core::storage::ArtifactWriter;
//!
//! # async fn example() -> chunkload_core::error::Result<()> {
//! let writer = ArtifactWriter::spawn();
//! writer.replace("/tmp/1_2_64.pt".into(), vec![0, 0, 0, 0]);
//! writer.flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod formats;
pub mod writer;

pub use formats::{PreloadFile, PreloadRecord};
pub use writer::ArtifactWriter;
