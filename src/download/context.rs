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


//! Shared context, per-transfer request and caller-facing callbacks

use crate::config::TransferConfig;
use crate::error::FailureReason;
use crate::location::Location;
use crate::storage::ArtifactWriter;
use crate::transport::{NoReferenceResolver, ReferenceResolver, RequestToken, Transport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Collaborators shared by every transfer of one account
///
/// Cloning is cheap; all clones share the writer task and token counter.
#[derive(Clone)]
pub struct TransferContext {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn ReferenceResolver>,
    pub writer: ArtifactWriter,
    pub config: TransferConfig,
    tokens: Arc<AtomicU64>,
}

impl TransferContext {
    /// Create a context and start its artifact writer
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: TransferConfig) -> Self {
        Self {
            transport,
            resolver: Arc::new(NoReferenceResolver),
            writer: ArtifactWriter::spawn(),
            config,
            tokens: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ReferenceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Fresh request token, unique within this context
    pub fn next_token(&self) -> RequestToken {
        RequestToken(self.tokens.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Everything needed to transfer one logical file
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub location: Location,
    /// Size in bytes, 0 when unknown
    pub total_size: u64,
    /// Final extension including the dot
    pub extension: String,
    pub final_name: Option<String>,
    pub temp_dir: PathBuf,
    pub store_dir: PathBuf,
    /// Place the final file here under a collision-free name
    pub canonical_dir: Option<PathBuf>,
    pub encrypt_at_rest: bool,
    /// Video that can be previewed from a preload
    pub supports_preload: bool,
    /// Only fetch the preload, not the whole file
    pub preload: bool,
    /// Progressive playback: smaller chunks
    pub stream_priority: bool,
    pub priority: i32,
}

impl TransferRequest {
    pub fn new(location: Location, total_size: u64, temp_dir: PathBuf, store_dir: PathBuf) -> Self {
        Self {
            location,
            total_size,
            extension: String::new(),
            final_name: None,
            temp_dir,
            store_dir,
            canonical_dir: None,
            encrypt_at_rest: false,
            supports_preload: false,
            preload: false,
            stream_priority: false,
            priority: 0,
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    pub fn with_final_name(mut self, name: &str) -> Self {
        self.final_name = Some(name.to_string());
        self
    }

    pub fn with_canonical_dir(mut self, dir: PathBuf) -> Self {
        self.canonical_dir = Some(dir);
        self
    }

    pub fn encrypted_at_rest(mut self) -> Self {
        self.encrypt_at_rest = true;
        self
    }

    /// Mark as previewable video; `preload_only` fetches just the preload
    pub fn with_preload(mut self, preload_only: bool) -> Self {
        self.supports_preload = true;
        self.preload = preload_only;
        self
    }

    pub fn with_stream_priority(mut self) -> Self {
        self.stream_priority = true;
        self
    }
}

/// Terminal and progress callbacks of one transfer
///
/// Every method has an empty default. Callbacks run on the operation task
/// and must not block.
pub trait TransferDelegate: Send + Sync {
    fn on_progress(&self, _downloaded: u64, _total: u64) {}

    fn on_finished(&self, _final_path: &Path) {}

    fn on_preload_finished(&self, _preloaded_bytes: u64) {}

    fn on_failed(&self, _reason: FailureReason) {}

    /// Final file was placed in the canonical store
    fn on_save_canonical_path(&self, _path: &Path) {}

    /// Another transfer still uses the final file, so it must not be deleted
    fn has_another_ref_on_file(&self, _path: &Path) -> bool {
        false
    }
}

/// Delegate that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl TransferDelegate for NoopDelegate {}

/// Progressive playback consumer
pub trait StreamListener: Send + Sync {
    /// More contiguous bytes may be readable
    fn on_new_data_available(&self);
}

/// Handle for detaching a stream listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Stream parameters passed to `start_stream`
#[derive(Clone)]
pub struct StreamStart {
    pub offset: u64,
    pub priority: bool,
    pub listener: Option<(ListenerId, Arc<dyn StreamListener>)>,
}

impl std::fmt::Debug for StreamStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStart")
            .field("offset", &self.offset)
            .field("priority", &self.priority)
            .field("listener", &self.listener.as_ref().map(|(id, _)| *id))
            .finish()
    }
}
