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


//! Chunked transfer engine
//!
//! # Modules
//! - `operation` - per-file worker: scheduling, resume, CDN, completion
//! - `pipeline` - issued, parked and retried chunk requests
//! - `ranges` - byte range algebra for missing and unverified bytes
//! - `cdn` - CDN session with window hash verification
//! - `preload` - MP4 box walk and preload budget
//! - `progress` - progress snapshots and speed tracking
//! - `context` - shared collaborators and caller-facing callbacks

pub mod cdn;
pub mod context;
pub mod operation;
pub mod pipeline;
pub mod preload;
pub mod progress;
pub mod ranges;

// Re-export commonly used types
pub use context::{
    ListenerId, NoopDelegate, StreamListener, StreamStart, TransferContext, TransferDelegate, TransferRequest,
};
pub use operation::TransferOperation;
pub use progress::{TransferProgress, TransferState};
pub use ranges::{Range, RangeSet};
