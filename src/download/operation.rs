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


//! Transfer operation
//!
//! A [`TransferOperation`] moves one file from the network to disk. Its state
//! lives in a worker task; the handle only sends commands. Transport answers,
//! hash fetches, reference refreshes and rename retries come back through the
//! same channel, so every state change happens on the worker, one at a time.
//!
//! # Lifecycle
//! `Idle → Downloading → Finished | Failed | Cancelled`. A paused operation
//! stays in `Downloading` and issues no new requests until started again.
//! Dropping every handle stops the worker; answers arriving afterwards are
//! discarded.
//!
//! # Example
//! ```no_run
//! use chunkload_core::{Location, NoopDelegate, TransferConfig, TransferContext, TransferOperation, TransferRequest};
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn chunkload_core::Transport>) -> chunkload_core::Result<()> {
//! let ctx = TransferContext::new(transport, TransferConfig::default());
//! let location = Location::Plain {
//!     datacenter_id: 2,
//!     id: 42,
//!     access_hash: 7,
//!     file_reference: vec![],
//!     volume_id: 0,
//!     local_id: 0,
//! };
//! let request = TransferRequest::new(location, 1 << 20, "/tmp/parts".into(), "/tmp/files".into());
//! let operation = TransferOperation::spawn(ctx, request, Arc::new(NoopDelegate));
//! operation.start();
//! let (available, finished) = operation.downloaded_length_from(0, 4096).await?;
//! # let _ = (available, finished);
//! # Ok(())
//! # }
//! ```

use crate::crypto::{CipherContext, CtrCipher};
use crate::download::cdn::CdnSession;
use crate::download::context::{
    ListenerId, StreamListener, StreamStart, TransferContext, TransferDelegate, TransferRequest,
};
use crate::download::pipeline::{ChunkPayload, ChunkRequest, ChunkRequestPipeline};
use crate::download::preload::{PreloadPlanner, PreloadedRange};
use crate::download::progress::{ProgressTracker, TransferProgress, TransferState};
use crate::download::ranges::RangeSet;
use crate::error::{FailureReason, Result, TransferError};
use crate::file::{avoid_collision, ArtifactFlags, ArtifactPaths};
use crate::location::Location;
use crate::storage::formats::{encode_key_file, parse_key_file, PreloadFile};
use crate::transport::{
    CdnRedirect, ConnectionType, ErrorClass, PendingRequest, RequestFlags, RequestToken, RpcError, RpcRequest,
    RpcResponse, RpcResult, SendOptions,
};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

enum Command {
    Start(Option<StreamStart>),
    Pause,
    Cancel { delete_files: bool },
    SetPreload(bool),
    SetPriority(i32),
    DetachStream(ListenerId),
    Completed { token: RequestToken, result: RpcResult },
    PreloadedRead { token: RequestToken, result: Result<Vec<u8>> },
    HashesFetched { result: RpcResult },
    ReuploadFinished { result: RpcResult },
    ReferenceRefreshed { result: Result<Location> },
    RetryFinalize,
    Query(Query),
}

enum Query {
    DownloadedLength {
        offset: u64,
        length: u64,
        reply: oneshot::Sender<(u64, bool)>,
    },
    State(oneshot::Sender<TransferState>),
    Progress(oneshot::Sender<TransferProgress>),
    CurrentFile(oneshot::Sender<Option<PathBuf>>),
}

/// Handle to a running transfer
///
/// Cheap to clone. Commands are queued and applied in order by the worker.
#[derive(Clone)]
pub struct TransferOperation {
    id: Uuid,
    tx: mpsc::UnboundedSender<Command>,
    listener_ids: Arc<AtomicU64>,
}

impl std::fmt::Debug for TransferOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOperation").field("id", &self.id).finish()
    }
}

impl TransferOperation {
    /// Create the operation and its worker task in `Idle` state
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(ctx: TransferContext, request: TransferRequest, delegate: Arc<dyn TransferDelegate>) -> Self {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(id, ctx, request, delegate, tx.downgrade());
        tokio::spawn(worker.run(rx).instrument(info_span!("transfer", id = %id)));
        Self {
            id,
            tx,
            listener_ids: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start, or resume after `pause`
    pub fn start(&self) {
        self.send(Command::Start(None));
    }

    /// Start for progressive playback from `offset`
    ///
    /// With `priority` the chunk holding `offset` is requested ahead of
    /// everything else. The optional listener is told whenever more bytes
    /// may be readable; keep the returned id to detach it.
    pub fn start_stream(
        &self,
        offset: u64,
        priority: bool,
        listener: Option<Arc<dyn StreamListener>>,
    ) -> Option<ListenerId> {
        let listener = listener.map(|l| (ListenerId(self.listener_ids.fetch_add(1, Ordering::Relaxed) + 1), l));
        let id = listener.as_ref().map(|(id, _)| *id);
        self.send(Command::Start(Some(StreamStart {
            offset,
            priority,
            listener,
        })));
        id
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    /// Stop the transfer; with `delete_files` every artifact is removed
    pub fn cancel(&self, delete_files: bool) {
        self.send(Command::Cancel { delete_files });
    }

    /// Switch between preload-only and full download
    pub fn set_preload(&self, preload: bool) {
        self.send(Command::SetPreload(preload));
    }

    pub fn set_priority(&self, priority: i32) {
        self.send(Command::SetPriority(priority));
    }

    pub fn detach_stream(&self, listener: ListenerId) {
        self.send(Command::DetachStream(listener));
    }

    /// Contiguous readable bytes from `offset` (capped at `length`) and
    /// whether the transfer has finished
    pub async fn downloaded_length_from(&self, offset: u64, length: u64) -> Result<(u64, bool)> {
        self.query(|reply| Query::DownloadedLength { offset, length, reply }).await
    }

    /// Blocking variant of [`Self::downloaded_length_from`] for reader threads
    ///
    /// Panics when called from inside an async context.
    pub fn downloaded_length_from_blocking(&self, offset: u64, length: u64) -> Result<(u64, bool)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Query(Query::DownloadedLength { offset, length, reply }))
            .map_err(|_| TransferError::WorkerStopped("transfer operation"))?;
        rx.blocking_recv()
            .map_err(|_| TransferError::WorkerStopped("transfer operation"))
    }

    pub async fn state(&self) -> Result<TransferState> {
        self.query(Query::State).await
    }

    pub async fn progress(&self) -> Result<TransferProgress> {
        self.query(Query::Progress).await
    }

    /// Final path once finished, else the temp file being written
    pub async fn current_file(&self) -> Result<Option<PathBuf>> {
        self.query(Query::CurrentFile).await
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!(id = %self.id, "operation worker already stopped");
        }
    }

    async fn query<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Query,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Query(build(reply)))
            .map_err(|_| TransferError::WorkerStopped("transfer operation"))?;
        rx.await.map_err(|_| TransferError::WorkerStopped("transfer operation"))
    }
}

enum Setup {
    Ready,
    /// Every byte is in the temp file (or the preload is complete)
    Complete,
    /// The final file already exists with the expected size
    AlreadyComplete,
}

enum Applied {
    Delayed,
    Written { finished: bool },
}

struct Worker {
    id: Uuid,
    ctx: TransferContext,
    request: TransferRequest,
    delegate: Arc<dyn TransferDelegate>,
    me: mpsc::WeakUnboundedSender<Command>,
    state: TransferState,
    paused: bool,
    location: Location,
    /// Size including cipher padding
    total: u64,
    padding: u64,
    is_preload: bool,
    pipeline: ChunkRequestPipeline,
    not_loaded: Option<RangeSet>,
    not_requested: Option<RangeSet>,
    downloaded: u64,
    paths: Option<ArtifactPaths>,
    temp_file: Option<File>,
    cipher: CipherContext,
    cdn: Option<CdnSession>,
    preload: Option<PreloadPlanner>,
    reference_pending: bool,
    /// Every byte is in, but parked CDN windows still wait for hashes
    awaiting_hashes: bool,
    finalizing: bool,
    rename_attempts: u32,
    listeners: Vec<(ListenerId, Arc<dyn StreamListener>)>,
    progress: ProgressTracker,
    final_path: Option<PathBuf>,
}

impl Worker {
    fn new(
        id: Uuid,
        ctx: TransferContext,
        request: TransferRequest,
        delegate: Arc<dyn TransferDelegate>,
        me: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let (chunk, max) = ctx.config.chunking_for(request.total_size, request.stream_priority);
        let file_name = request
            .final_name
            .clone()
            .unwrap_or_else(|| format!("{}{}", request.location.artifact_base_name(), request.extension));
        Self {
            id,
            location: request.location.clone(),
            total: request.total_size,
            padding: 0,
            is_preload: request.preload,
            pipeline: ChunkRequestPipeline::new(chunk, max),
            progress: ProgressTracker::new(id.to_string(), file_name, request.total_size),
            ctx,
            request,
            delegate,
            me,
            state: TransferState::Idle,
            paused: false,
            not_loaded: None,
            not_requested: None,
            downloaded: 0,
            paths: None,
            temp_file: None,
            cipher: CipherContext::new(),
            cdn: None,
            preload: None,
            reference_pending: false,
            awaiting_hashes: false,
            finalizing: false,
            rename_attempts: 0,
            listeners: Vec::new(),
            final_path: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("operation worker started");
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        if !self.state.is_terminal() {
            debug!(id = %self.id, "all handles dropped, stopping transfer");
            let cleared = self.pipeline.clear(None);
            for token in cleared.cancelled {
                self.ctx.transport.cancel(token);
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(stream) => self.start(stream).await,
            Command::Pause => {
                if self.state == TransferState::Downloading {
                    debug!("pausing");
                    self.paused = true;
                    self.progress.set_paused(true);
                }
            }
            Command::Cancel { delete_files } => self.cancel(delete_files).await,
            Command::SetPreload(preload) => self.set_preload(preload).await,
            Command::SetPriority(priority) => {
                self.request.priority = priority;
                self.progress.set_priority(priority);
            }
            Command::DetachStream(listener) => self.listeners.retain(|(id, _)| *id != listener),
            Command::Completed { token, result } => self.on_completed(token, result).await,
            Command::PreloadedRead { token, result } => self.on_preloaded_read(token, result).await,
            Command::HashesFetched { result } => self.on_hashes(result).await,
            Command::ReuploadFinished { result } => self.on_reupload_finished(result).await,
            Command::ReferenceRefreshed { result } => self.on_reference_refreshed(result).await,
            Command::RetryFinalize => {
                if self.finalizing {
                    self.finalize().await;
                }
            }
            Command::Query(query) => self.answer(query),
        }
    }

    // ===== Start and setup =====

    async fn start(&mut self, stream: Option<StreamStart>) {
        if self.paused {
            self.paused = false;
            self.progress.set_paused(false);
        }
        match self.state {
            TransferState::Idle => match self.setup().await {
                Ok(Setup::Ready) => {
                    self.apply_stream(stream);
                    self.schedule().await;
                }
                Ok(Setup::Complete) => {
                    self.apply_stream(stream);
                    self.finish().await;
                }
                Ok(Setup::AlreadyComplete) => {
                    self.apply_stream(stream);
                    self.complete_existing();
                }
                Err(error) => self.fail(error).await,
            },
            TransferState::Downloading => {
                self.apply_stream(stream);
                self.schedule().await;
            }
            _ => {
                self.apply_stream(stream);
                if self.state == TransferState::Finished {
                    self.notify_listeners();
                }
            }
        }
    }

    fn apply_stream(&mut self, stream: Option<StreamStart>) {
        let Some(stream) = stream else {
            return;
        };
        if let Some(listener) = stream.listener {
            self.listeners.push(listener);
        }
        if self.state != TransferState::Downloading || self.is_preload {
            return;
        }
        if stream.priority && self.not_requested.is_some() {
            if let Some(withdrawn) = self.pipeline.set_priority(stream.offset) {
                debug!(offset = withdrawn.offset, "withdrawing previous priority request");
                self.ctx.transport.cancel(withdrawn.token);
                self.give_back(withdrawn.offset);
            }
        } else {
            self.pipeline.set_stream_start(stream.offset);
        }
    }

    async fn setup(&mut self) -> Result<Setup> {
        self.ctx.config.validate()?;
        self.location.validate()?;
        self.ctx.writer.flush().await?;
        self.cdn = None;
        self.reference_pending = false;
        self.awaiting_hashes = false;
        self.rename_attempts = 0;

        let preload_max = self.ctx.config.preload_max_bytes;
        if self.is_preload
            && !(self.request.supports_preload && !self.request.encrypt_at_rest && self.total > preload_max)
        {
            debug!(total = self.total, "no preload possible, downloading the whole file");
            self.is_preload = false;
        }

        if self.location.whole_file_key().is_some() && self.total % 16 != 0 {
            self.padding = 16 - self.total % 16;
            self.total += self.padding;
        }
        let (chunk, max) = self.ctx.config.chunking_for(self.total, self.request.stream_priority);
        self.pipeline = ChunkRequestPipeline::new(chunk, max);

        let ranges = self.location.allows_random_order() && !self.request.encrypt_at_rest && self.total > chunk;
        let flags = ArtifactFlags {
            ranges,
            whole_file_cipher: self.location.whole_file_key().is_some(),
            preload: self.request.supports_preload,
            encrypt_at_rest: self.request.encrypt_at_rest,
        };
        let paths = ArtifactPaths::derive(
            &self.location,
            &self.request.temp_dir,
            &self.request.store_dir,
            &self.request.extension,
            self.request.final_name.as_deref(),
            flags,
        );
        self.cipher = match self.location.whole_file_key() {
            Some((key, iv)) => CipherContext::new().with_whole_file(key, iv),
            None => CipherContext::new(),
        };
        self.state = TransferState::Downloading;
        self.progress.set_state(TransferState::Downloading);

        if let Ok(meta) = fs::metadata(&paths.final_path).await {
            let expected = self.total - self.padding;
            if expected == 0 || meta.len() == expected {
                info!(path = %paths.final_path.display(), "final file already present");
                self.final_path = Some(paths.final_path.clone());
                self.paths = Some(paths);
                return Ok(Setup::AlreadyComplete);
            }
            if !self.delegate.has_another_ref_on_file(&paths.final_path) {
                debug!(size = meta.len(), expected, "removing final file with unexpected size");
                remove_if_exists(&paths.final_path).await?;
            }
        }

        fs::create_dir_all(&self.request.temp_dir).await?;

        let mut fresh_key = false;
        if let Some(key_path) = &paths.key {
            let existing = match fs::read(key_path).await {
                Ok(raw) => parse_key_file(&raw),
                Err(_) => None,
            };
            let at_rest = match existing {
                Some(cipher) => cipher,
                None => {
                    let cipher = CtrCipher::random();
                    if let Some(parent) = key_path.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::write(key_path, encode_key_file(&cipher)).await?;
                    fresh_key = true;
                    cipher
                }
            };
            self.cipher = std::mem::take(&mut self.cipher).with_at_rest(at_rest);
        }

        self.preload = None;
        if let Some(preload_path) = &paths.preload {
            let planner = match fs::read(preload_path).await {
                Ok(raw) if !raw.is_empty() => {
                    let file = PreloadFile::parse(&raw, self.total, chunk);
                    PreloadPlanner::restore(chunk, self.total, preload_max, &file, &raw)
                }
                _ => PreloadPlanner::new(chunk, self.total, preload_max),
            };
            if self.is_preload || planner.has_preloaded() {
                self.preload = Some(planner);
            }
        }

        let mut not_loaded = None;
        if ranges {
            let mut missing = RangeSet::new();
            if let Some(parts) = &paths.parts {
                if let Ok(raw) = fs::read(parts).await {
                    match RangeSet::from_bytes(&raw, self.total) {
                        Ok(set) => missing = set,
                        Err(error) => warn!(%error, "ignoring unreadable range file"),
                    }
                }
            }
            not_loaded = Some(missing);
        }

        let mut resumed = 0;
        if !self.is_preload {
            if let Ok(meta) = fs::metadata(&paths.temp).await {
                if fresh_key {
                    remove_if_exists(&paths.temp).await?;
                } else if paths.iv.is_none() || meta.len() % chunk == 0 {
                    resumed = meta.len() / chunk * chunk;
                }
            }
        }
        if let Some(set) = not_loaded.as_mut() {
            if set.is_empty() {
                set.insert(resumed, self.total);
            }
        }
        self.downloaded = match &not_loaded {
            Some(set) => self.total.saturating_sub(set.total_len()),
            None => resumed,
        };

        if let Some(iv_path) = &paths.iv {
            if self.downloaded != 0 {
                let restored = match fs::read(iv_path).await {
                    Ok(raw) => self.cipher.restore_iv_state(&raw).is_ok(),
                    Err(_) => false,
                };
                if !restored {
                    debug!("no usable IV state, restarting from the first byte");
                    self.downloaded = 0;
                }
            }
        }

        self.not_requested = not_loaded.clone();
        self.not_loaded = not_loaded;
        match (&self.preload, self.is_preload) {
            (Some(planner), true) => self.pipeline.set_requested_bytes(planner.total_preloaded()),
            _ => self.pipeline.set_requested_bytes(self.downloaded),
        }

        if !self.is_preload {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&paths.temp)
                .await?;
            self.temp_file = Some(file);
        }
        self.paths = Some(paths);

        info!(
            total = self.total,
            chunk,
            max_requests = max,
            ranges,
            preload = self.is_preload,
            downloaded = self.downloaded,
            "transfer set up"
        );

        if self.is_preload {
            let planner_done = self.preload.as_ref().is_some_and(PreloadPlanner::is_finished);
            let preloaded = self.preload.as_ref().map_or(0, PreloadPlanner::total_preloaded);
            self.progress.update(preloaded, self.total);
            return Ok(if planner_done { Setup::Complete } else { Setup::Ready });
        }
        self.progress.update(self.downloaded, self.total);
        if self.total > 0 && self.downloaded >= self.total {
            return Ok(Setup::Complete);
        }
        Ok(Setup::Ready)
    }

    fn complete_existing(&mut self) {
        self.state = TransferState::Finished;
        self.progress.set_state(TransferState::Finished);
        let size = self.total - self.padding;
        self.progress.update(size, size);
        self.notify_listeners();
        if let Some(path) = self.final_path.clone() {
            self.delegate.on_finished(&path);
        }
    }

    // ===== Scheduling =====

    async fn schedule(&mut self) {
        if self.state != TransferState::Downloading
            || self.paused
            || self.reference_pending
            || self.awaiting_hashes
            || self.finalizing
        {
            return;
        }
        if self.cdn.as_ref().is_some_and(CdnSession::is_reuploading) || self.pipeline.is_saturated() {
            return;
        }

        let mut parallel = true;
        if self.is_preload {
            let Some(planner) = self.preload.as_ref() else {
                return;
            };
            if planner.budget_spent(self.pipeline.requested_bytes()) {
                if self.pipeline.is_idle() {
                    self.finish().await;
                }
                return;
            }
            parallel = planner.allows_parallel();
            if !parallel && self.pipeline.in_flight_len() > 0 {
                return;
            }
        }
        let count = if parallel && self.total > 0 && !self.pipeline.has_priority_offset() {
            self.pipeline.free_slots().max(1)
        } else {
            1
        };
        let chunk = self.pipeline.chunk_size();

        for i in 0..count {
            let offset = if self.is_preload {
                match self.preload.as_mut().and_then(PreloadPlanner::next_request_offset) {
                    Some(offset) => offset,
                    None => {
                        if self.pipeline.is_idle() {
                            self.finish().await;
                        }
                        return;
                    }
                }
            } else {
                match self.pipeline.select_offset(self.not_requested.as_ref()) {
                    Some(offset) => offset,
                    None => return,
                }
            };
            if self.total > 0 && offset >= self.total {
                return;
            }

            if self.is_preload {
                self.pipeline.advance_cursor();
            } else if let Some(set) = self.not_requested.as_mut() {
                set.remove(offset, offset + chunk);
            } else if offset == self.pipeline.requested_bytes() {
                self.pipeline.advance_cursor();
            }

            let token = self.ctx.next_token();
            if !self.is_preload {
                let reuse = self.preload.as_ref().and_then(|p| p.preloaded_range(offset));
                let path = self.paths.as_ref().and_then(|p| p.preload.clone());
                if let (Some(range), Some(path)) = (reuse, path) {
                    self.pipeline.issue(token, offset, false);
                    self.read_preloaded(token, path, range);
                    continue;
                }
            }
            if self.location.needs_reference() {
                self.pipeline.issue(token, offset, false);
                self.request_reference(token, offset);
                return;
            }
            let is_last = self.total == 0 || i + 1 == count || offset + chunk >= self.total;
            self.dispatch_chunk(token, offset, is_last);
        }
    }

    fn dispatch_chunk(&mut self, token: RequestToken, offset: u64, is_last: bool) {
        let limit = self.pipeline.chunk_size() as u32;
        let (request, datacenter_id, via_cdn) = match &self.cdn {
            Some(cdn) => (
                RpcRequest::GetCdnFile {
                    file_token: cdn.file_token().to_vec(),
                    offset,
                    limit,
                },
                cdn.datacenter_id(),
                true,
            ),
            None if self.location.is_web() => (
                RpcRequest::GetWebFile {
                    location: self.location.clone(),
                    offset,
                    limit,
                },
                self.location.datacenter_id(),
                false,
            ),
            None => (
                RpcRequest::GetFile {
                    location: self.location.clone(),
                    offset,
                    limit,
                    cdn_supported: self.location.supports_cdn(),
                },
                self.location.datacenter_id(),
                false,
            ),
        };
        let options = SendOptions {
            token,
            datacenter_id,
            connection: self.pipeline.next_connection(),
            flags: RequestFlags {
                force_download: true,
                enable_unauthorized: via_cdn,
                is_last,
                ..RequestFlags::default()
            },
        };
        self.pipeline.issue(token, offset, via_cdn);
        debug!(%token, offset, datacenter_id, via_cdn, "requesting chunk");
        let answer = self.ctx.transport.send(request, options);
        self.spawn_reply(answer, move |result| Command::Completed { token, result });
    }

    fn read_preloaded(&self, token: RequestToken, path: PathBuf, range: PreloadedRange) {
        debug!(%token, file_offset = range.file_offset, "serving chunk from preload");
        let writer = self.ctx.writer.clone();
        let read = async move { writer.read_at(path, range.file_offset, range.length as usize).await };
        self.spawn_reply(read, move |result| Command::PreloadedRead { token, result });
    }

    /// Await `work` off the worker and post its outcome back as a command
    fn spawn_reply<T, Fut, F>(&self, work: Fut, wrap: F)
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        F: FnOnce(T) -> Command + Send + 'static,
    {
        let me = self.me.clone();
        tokio::spawn(async move {
            let value = work.await;
            if let Some(tx) = me.upgrade() {
                let _ = tx.send(wrap(value));
            }
        });
    }

    /// Return an offset to the pool of chunks still to request
    fn give_back(&mut self, offset: u64) {
        if self.is_preload {
            if let Some(planner) = self.preload.as_mut() {
                planner.release(offset);
            }
            return;
        }
        let chunk = self.pipeline.chunk_size();
        match (self.not_requested.as_mut(), self.not_loaded.as_ref()) {
            (Some(not_requested), Some(not_loaded)) => {
                for range in not_loaded.overlapping(offset, offset + chunk) {
                    not_requested.insert(range.start, range.end);
                }
            }
            _ => self.pipeline.queue_retry(offset),
        }
    }

    /// Drop every request except `except` and give their chunks back
    fn clear_requests(&mut self, except: Option<RequestToken>) {
        let cleared = self.pipeline.clear(except);
        for token in &cleared.cancelled {
            self.ctx.transport.cancel(*token);
        }
        if self.is_preload {
            if let Some(planner) = self.preload.as_mut() {
                for offset in &cleared.released {
                    planner.release(*offset);
                }
                self.pipeline.set_requested_bytes(planner.total_preloaded());
            }
            return;
        }
        if self.not_requested.is_some() {
            for offset in cleared.released {
                self.give_back(offset);
            }
        } else {
            self.pipeline.set_requested_bytes(self.downloaded);
        }
    }

    fn request_reference(&mut self, token: RequestToken, offset: u64) {
        if self.reference_pending {
            return;
        }
        info!(%token, offset, "file reference needed, refreshing");
        self.clear_requests(Some(token));
        self.reference_pending = true;
        let refresh = self
            .ctx
            .resolver
            .refresh(self.location.clone(), PendingRequest { token, offset });
        self.spawn_reply(refresh, |result| Command::ReferenceRefreshed { result });
    }

    async fn on_reference_refreshed(&mut self, result: Result<Location>) {
        if self.state != TransferState::Downloading {
            return;
        }
        self.reference_pending = false;
        match result.and_then(|updated| self.location.apply_refresh(updated)) {
            Ok(()) if self.location.needs_reference() => {
                self.fail(TransferError::ReferenceRefreshFailed(
                    "refreshed location is still unresolved".to_string(),
                ))
                .await
            }
            Ok(()) => {
                info!("file reference refreshed");
                self.schedule().await;
            }
            Err(TransferError::ReferenceRefreshFailed(message)) => {
                self.fail(TransferError::ReferenceRefreshFailed(message)).await
            }
            Err(error) => self.fail(TransferError::ReferenceRefreshFailed(error.to_string())).await,
        }
    }

    // ===== Answers =====

    async fn on_completed(&mut self, token: RequestToken, result: RpcResult) {
        if self.state != TransferState::Downloading || !self.pipeline.contains(token) {
            debug!(%token, "discarding stale answer");
            return;
        }
        let response = match result {
            Ok(response) => response,
            Err(error) => return self.on_request_error(token, error).await,
        };
        let payload = match response {
            RpcResponse::File { bytes } => ChunkPayload::Direct(bytes),
            RpcResponse::WebFile { bytes, size } => {
                if self.total == 0 && size > 0 {
                    debug!(size, "web file announced its size");
                    self.total = size;
                }
                ChunkPayload::Web(bytes)
            }
            RpcResponse::CdnFile { bytes } => ChunkPayload::Cdn(bytes),
            RpcResponse::CdnRedirect(redirect) => return self.on_cdn_redirect(token, redirect).await,
            RpcResponse::CdnReuploadNeeded { request_token } => {
                return self.on_reupload_needed(token, request_token).await
            }
            RpcResponse::FileHashes(_) => {
                return self
                    .fail(TransferError::UnexpectedResponse(
                        "file hashes in answer to a chunk request".to_string(),
                    ))
                    .await
            }
        };
        let Some(mut request) = self.pipeline.take(token) else {
            return;
        };
        request.payload = Some(payload);
        request.completed = true;
        self.drain(Some(request)).await;
    }

    async fn on_request_error(&mut self, token: RequestToken, error: RpcError) {
        let class = error.classify();
        match class {
            ErrorClass::FileReferenceExpired => {
                let offset = self.pipeline.offset_of(token).unwrap_or(0);
                self.request_reference(token, offset);
                return;
            }
            ErrorClass::FileTokenInvalid if self.pipeline.is_cdn_request(token) => {
                warn!(%token, "CDN file token rejected, falling back to the origin");
                self.cdn = None;
                self.clear_requests(None);
                self.schedule().await;
                return;
            }
            _ => {}
        }

        let Some(request) = self.pipeline.take(token) else {
            return;
        };
        match class {
            ErrorClass::Migrate(datacenter_id) => self.migrate(datacenter_id).await,
            ErrorClass::OffsetInvalid => {
                if self.downloaded % self.pipeline.chunk_size() == 0 {
                    info!(downloaded = self.downloaded, "offset past the end, treating as complete");
                    self.finish().await;
                } else {
                    self.fail(TransferError::OffsetInvalid {
                        downloaded: self.downloaded,
                    })
                    .await;
                }
            }
            ErrorClass::RetryLimit => self.fail(TransferError::RetryLimitExceeded).await,
            ErrorClass::Transient => {
                let offset = request.offset;
                if self.pipeline.record_retry(offset, self.ctx.config.max_chunk_retries) {
                    warn!(
                        offset,
                        attempt = self.pipeline.retry_count(offset),
                        %error,
                        "transient error, re-issuing chunk"
                    );
                    self.give_back(offset);
                    self.schedule().await;
                } else {
                    self.fail(TransferError::ChunkRetriesExhausted {
                        offset,
                        attempts: self.pipeline.retry_count(offset),
                        text: error.text,
                    })
                    .await;
                }
            }
            _ => self.fail(TransferError::rpc(error.code, error.text)).await,
        }
    }

    async fn migrate(&mut self, datacenter_id: i32) {
        info!(datacenter_id, "file lives on another datacenter, restarting there");
        self.location.set_datacenter_id(datacenter_id);
        self.clear_requests(None);
        if !self.is_preload {
            self.downloaded = 0;
            self.pipeline.set_requested_bytes(0);
            if self.not_loaded.is_some() {
                let all = RangeSet::full(0, self.total);
                self.not_requested = Some(all.clone());
                self.not_loaded = Some(all);
                self.persist_ranges();
            }
            self.cipher.reset();
            self.progress.update(0, self.total);
        }
        self.schedule().await;
    }

    async fn on_preloaded_read(&mut self, token: RequestToken, result: Result<Vec<u8>>) {
        if self.state != TransferState::Downloading {
            return;
        }
        let Some(mut request) = self.pipeline.take(token) else {
            return;
        };
        match result {
            Ok(bytes) => {
                request.payload = Some(ChunkPayload::Preloaded(bytes));
                request.completed = true;
                self.drain(Some(request)).await;
            }
            Err(error) => {
                warn!(%error, offset = request.offset, "preloaded chunk unreadable, fetching it instead");
                self.preload = None;
                self.give_back(request.offset);
                self.schedule().await;
            }
        }
    }

    // ===== CDN =====

    fn unloaded_ranges(&self) -> RangeSet {
        match &self.not_loaded {
            Some(set) => set.clone(),
            None => {
                let end = if self.total > 0 {
                    self.total
                } else {
                    self.ctx.config.max_file_size
                };
                RangeSet::full(self.downloaded, end)
            }
        }
    }

    async fn on_cdn_redirect(&mut self, token: RequestToken, redirect: CdnRedirect) {
        let unchecked = self.unloaded_ranges();
        let check_size = self.ctx.config.cdn_chunk_check_size as u64;
        match CdnSession::from_redirect(redirect, check_size, &unchecked) {
            Ok(session) => {
                info!(datacenter_id = session.datacenter_id(), "switching to CDN");
                self.cdn = Some(session);
                self.clear_requests(Some(token));
                self.schedule().await;
            }
            Err(error) => self.fail(error).await,
        }
    }

    async fn on_reupload_needed(&mut self, token: RequestToken, request_token: Vec<u8>) {
        self.clear_requests(Some(token));
        let request = match self.cdn.as_mut() {
            None => {
                return self
                    .fail(TransferError::UnexpectedResponse(
                        "reupload request without a CDN session".to_string(),
                    ))
                    .await
            }
            Some(cdn) if cdn.is_reuploading() => return,
            Some(cdn) => {
                cdn.set_reuploading(true);
                RpcRequest::ReuploadCdnFile {
                    file_token: cdn.file_token().to_vec(),
                    request_token,
                }
            }
        };
        info!("CDN asked for a reupload");
        let options = SendOptions {
            token: self.ctx.next_token(),
            datacenter_id: self.location.datacenter_id(),
            connection: ConnectionType::Generic,
            flags: RequestFlags {
                fail_on_server_errors: true,
                ..RequestFlags::default()
            },
        };
        let answer = self.ctx.transport.send(request, options);
        self.spawn_reply(answer, |result| Command::ReuploadFinished { result });
    }

    async fn on_reupload_finished(&mut self, result: RpcResult) {
        if self.state != TransferState::Downloading {
            return;
        }
        let Some(cdn) = self.cdn.as_mut() else {
            return;
        };
        cdn.set_reuploading(false);
        match result {
            Ok(RpcResponse::FileHashes(hashes)) => {
                debug!(count = hashes.len(), "reupload finished");
                cdn.merge_hashes(hashes);
                self.schedule().await;
            }
            Ok(_) => {
                self.fail(TransferError::UnexpectedResponse(
                    "reupload answered without hashes".to_string(),
                ))
                .await
            }
            Err(error) => match error.classify() {
                ErrorClass::FileTokenInvalid | ErrorClass::RequestTokenInvalid => {
                    warn!(%error, "reupload rejected, falling back to the origin");
                    self.cdn = None;
                    self.clear_requests(None);
                    self.schedule().await;
                }
                _ => self.fail(TransferError::CdnReuploadFailed(error.to_string())).await,
            },
        }
    }

    fn request_hashes(&mut self, window: u64) {
        let Some(cdn) = self.cdn.as_mut() else {
            return;
        };
        if !cdn.begin_hash_request(window) {
            return;
        }
        let request = RpcRequest::GetCdnFileHashes {
            file_token: cdn.file_token().to_vec(),
            offset: window,
        };
        debug!(window, "fetching CDN hashes");
        let options = SendOptions {
            token: self.ctx.next_token(),
            datacenter_id: self.location.datacenter_id(),
            connection: ConnectionType::Generic,
            flags: RequestFlags::default(),
        };
        let answer = self.ctx.transport.send(request, options);
        self.spawn_reply(answer, |result| Command::HashesFetched { result });
    }

    async fn on_hashes(&mut self, result: RpcResult) {
        if self.state != TransferState::Downloading {
            return;
        }
        let Some(cdn) = self.cdn.as_mut() else {
            return;
        };
        let requested = cdn.end_hash_request();
        match result {
            Ok(RpcResponse::FileHashes(hashes)) => {
                debug!(count = hashes.len(), "CDN hashes received");
                cdn.merge_hashes(hashes);
            }
            Ok(_) => {
                return self
                    .fail(TransferError::UnexpectedResponse(
                        "hash request answered without hashes".to_string(),
                    ))
                    .await
            }
            Err(error) if error.classify() == ErrorClass::FileTokenInvalid => {
                warn!(%error, "CDN file token rejected, falling back to the origin");
                self.cdn = None;
                self.clear_requests(None);
                if self.awaiting_hashes {
                    self.awaiting_hashes = false;
                    return self.finish().await;
                }
                return self.schedule().await;
            }
            Err(error) => return self.fail(TransferError::rpc(error.code, error.text)).await,
        }

        let ready = self.cdn.as_mut().map(CdnSession::take_verifiable).unwrap_or_default();
        for window in ready {
            if let Err(error) = self.verify_window(window).await {
                return self.fail(error).await;
            }
        }
        if self.awaiting_hashes {
            return self.finish_after_hashes(requested).await;
        }
        self.drain(None).await;
    }

    /// Finish once no parked window is left, fetching the next missing hash
    async fn finish_after_hashes(&mut self, requested: Option<u64>) {
        match self.cdn.as_ref().and_then(CdnSession::first_pending) {
            None => {
                self.awaiting_hashes = false;
                self.finish().await;
            }
            Some(window) if Some(window) == requested => {
                warn!(window, "hash answer skipped a parked window");
                self.fail(TransferError::IntegrityFailure { offset: window }).await;
            }
            Some(_) => self.request_missing_hashes(),
        }
    }

    fn request_missing_hashes(&mut self) {
        let Some(cdn) = self.cdn.as_ref() else {
            return;
        };
        let missing = |window: &u64| !cdn.has_hash(*window) && !cdn.is_checked(*window);
        let window = self
            .pipeline
            .delayed()
            .filter(|r| r.payload.as_ref().is_some_and(ChunkPayload::is_cdn))
            .map(|r| cdn.window_of(r.offset))
            .find(missing)
            .or_else(|| cdn.first_pending().filter(missing));
        if let Some(window) = window {
            self.request_hashes(window);
        }
    }

    fn window_end(&self, window: u64, check_size: u64) -> u64 {
        let end = window + check_size;
        if self.total > 0 {
            end.min(self.total)
        } else {
            end
        }
    }

    fn window_complete(&self, window: u64, check_size: u64) -> bool {
        let end = self.window_end(window, check_size);
        match &self.not_loaded {
            Some(set) => set.overlapping(window, end).is_empty(),
            None => self.downloaded >= end,
        }
    }

    /// Verify every complete window touched by `[offset, offset + len)`
    async fn verify_written(&mut self, offset: u64, len: u64) -> Result<()> {
        let Some(cdn) = self.cdn.as_ref() else {
            return Ok(());
        };
        let check_size = cdn.check_size();
        let mut window = cdn.window_of(offset);
        let last = cdn.window_of(offset + len.max(1) - 1);
        while window <= last {
            if self.window_complete(window, check_size) {
                self.verify_window(window).await?;
            }
            window += check_size;
        }
        Ok(())
    }

    async fn verify_window(&mut self, window: u64) -> Result<()> {
        let check_size = match self.cdn.as_mut() {
            None => return Ok(()),
            Some(cdn) if cdn.is_checked(window) => return Ok(()),
            Some(cdn) if !cdn.has_hash(window) => {
                cdn.defer(window);
                self.request_hashes(window);
                return Ok(());
            }
            Some(cdn) => cdn.check_size(),
        };
        let mut end = self.window_end(window, check_size);
        if self.total == 0 {
            end = end.min(self.downloaded.max(window));
        }
        let mut data = self.read_temp(window, (end - window) as usize).await?;
        self.cipher.reveal_stored(window, &mut data)?;
        if let Some(cdn) = self.cdn.as_mut() {
            cdn.verify(window, &data)?;
        }
        self.notify_listeners();
        Ok(())
    }

    // ===== Applying chunks =====

    fn ready_to_apply(&self, request: &ChunkRequest) -> bool {
        ready_to_apply(
            request,
            self.not_loaded.is_some() || self.is_preload,
            self.downloaded,
            self.cdn.as_ref(),
            self.is_preload,
        )
    }

    /// Apply `first`, then every parked chunk that became applicable
    async fn drain(&mut self, first: Option<ChunkRequest>) {
        let mut next = first;
        loop {
            let request = match next.take() {
                Some(request) => request,
                None => {
                    let any_order = self.not_loaded.is_some() || self.is_preload;
                    let downloaded = self.downloaded;
                    let is_preload = self.is_preload;
                    let cdn = self.cdn.as_ref();
                    match self
                        .pipeline
                        .take_ready_delayed(|r| ready_to_apply(r, any_order, downloaded, cdn, is_preload))
                    {
                        Some(request) => request,
                        None => break,
                    }
                }
            };
            match self.apply_chunk(request).await {
                Ok(Applied::Written { finished: true }) => return self.finish().await,
                Ok(_) => {}
                Err(error) => return self.fail(error).await,
            }
            if self.state != TransferState::Downloading {
                return;
            }
        }
        self.request_missing_hashes();
        self.schedule().await;
    }

    async fn apply_chunk(&mut self, mut request: ChunkRequest) -> Result<Applied> {
        if !self.ready_to_apply(&request) {
            debug!(offset = request.offset, downloaded = self.downloaded, "parking chunk");
            self.pipeline.delay(request);
            return Ok(Applied::Delayed);
        }
        let offset = request.offset;
        let payload = request
            .payload
            .take()
            .ok_or_else(|| TransferError::InvalidState(format!("chunk at {} has no payload", offset)))?;
        let from_cdn = payload.is_cdn();
        let mut data = payload.into_bytes();
        if from_cdn {
            if let Some(cdn) = self.cdn.as_ref() {
                cdn.decrypt(offset, &mut data)?;
            }
        }

        if self.is_preload {
            return self.apply_preload_chunk(offset, data);
        }
        if data.is_empty() {
            debug!(offset, "empty chunk, end of file reached");
            return Ok(Applied::Written { finished: true });
        }

        let len = data.len() as u64;
        let chunk = self.pipeline.chunk_size();
        let mut finished = match self.not_loaded {
            Some(_) => false,
            None => len != chunk || (self.total > 0 && self.downloaded + len >= self.total),
        };
        let trim = if finished && self.not_loaded.is_none() {
            self.padding as usize
        } else {
            0
        };
        self.cipher.process_chunk(offset, &mut data, trim)?;
        self.write_temp(offset, &data).await?;

        match self.not_loaded.as_mut() {
            Some(set) => {
                set.remove(offset, offset + len);
                self.downloaded = self.total.saturating_sub(set.total_len());
                finished = set.is_empty();
                self.persist_ranges();
            }
            None => self.downloaded += len,
        }
        if let Some(block) = self.cipher.iv_state_block() {
            if let Some(path) = self.paths.as_ref().and_then(|p| p.iv.clone()) {
                self.ctx.writer.replace(path, block.to_vec());
            }
        }
        self.verify_written(offset, len).await?;

        self.report_progress();
        self.notify_listeners();
        Ok(Applied::Written { finished })
    }

    fn apply_preload_chunk(&mut self, offset: u64, data: Vec<u8>) -> Result<Applied> {
        let path = self
            .paths
            .as_ref()
            .and_then(|p| p.preload.clone())
            .ok_or_else(|| TransferError::InvalidState("preload without a preload file".to_string()))?;
        let planner = self
            .preload
            .as_mut()
            .ok_or_else(|| TransferError::InvalidState("preload without a planner".to_string()))?;
        if data.is_empty() {
            return Ok(Applied::Written { finished: true });
        }

        let step = planner.on_chunk(offset, &data);
        let preloaded = planner.total_preloaded();
        self.ctx.writer.write_at(path.clone(), step.file_offset, step.record);
        if step.finished {
            self.ctx.writer.write_at(path, 0, vec![1]);
        }
        debug!(offset, preloaded, "chunk preloaded");
        self.progress.update(preloaded, self.total);
        Ok(Applied::Written {
            finished: step.finished,
        })
    }

    async fn write_temp(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self
            .temp_file
            .as_mut()
            .ok_or_else(|| TransferError::InvalidState("temp file is not open".to_string()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_temp(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self
            .temp_file
            .as_mut()
            .ok_or_else(|| TransferError::InvalidState("temp file is not open".to_string()))?;
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    fn persist_ranges(&self) {
        let parts = self.paths.as_ref().and_then(|p| p.parts.clone());
        if let (Some(set), Some(path)) = (&self.not_loaded, parts) {
            self.ctx.writer.replace(path, set.to_bytes());
        }
    }

    fn report_progress(&mut self) {
        self.progress.update(self.downloaded, self.total);
        if self.total > 0 {
            self.delegate.on_progress(self.downloaded, self.total);
        }
    }

    fn notify_listeners(&self) {
        for (_, listener) in &self.listeners {
            listener.on_new_data_available();
        }
    }

    // ===== Completion =====

    async fn finish(&mut self) {
        if self.state != TransferState::Downloading || self.finalizing {
            return;
        }
        self.clear_requests(None);

        if !self.is_preload && self.cdn.as_ref().and_then(CdnSession::first_pending).is_some() {
            debug!("parked CDN windows left, waiting for their hashes");
            self.awaiting_hashes = true;
            self.request_missing_hashes();
            return;
        }

        if self.is_preload {
            let (preloaded, flagged) = self
                .preload
                .as_ref()
                .map_or((0, false), |p| (p.total_preloaded(), p.is_finished()));
            if let Some(path) = self.paths.as_ref().and_then(|p| p.preload.clone()) {
                if !flagged {
                    self.ctx.writer.write_at(path.clone(), 0, vec![1]);
                }
                self.ctx.writer.close(path);
            }
            self.state = TransferState::Finished;
            self.progress.set_state(TransferState::Finished);
            info!(preloaded, "preload finished");
            self.notify_listeners();
            self.delegate.on_preload_finished(preloaded);
            return;
        }

        if self.total == 0 && self.downloaded > 0 {
            if let Err(error) = self.verify_tail().await {
                return self.fail(error).await;
            }
        }
        if let Some(mut file) = self.temp_file.take() {
            if let Err(error) = file.flush().await {
                return self.fail(error.into()).await;
            }
        }
        if let Some(paths) = &self.paths {
            for path in paths.auxiliary() {
                self.ctx.writer.remove(path.clone());
            }
        }
        self.finalizing = true;
        self.finalize().await;
    }

    /// Verify the trailing partial window of a file of unknown size
    async fn verify_tail(&mut self) -> Result<()> {
        let window = match self.cdn.as_ref() {
            Some(cdn) => cdn.window_of(self.downloaded - 1),
            None => return Ok(()),
        };
        if self.cdn.as_ref().is_some_and(|cdn| !cdn.has_hash(window)) {
            warn!(window, "no hash for the trailing CDN window");
            return Ok(());
        }
        self.verify_window(window).await
    }

    async fn finalize(&mut self) {
        if self.state != TransferState::Downloading {
            return;
        }
        let Some(paths) = self.paths.clone() else {
            return self
                .fail(TransferError::InvalidState("finalizing without artifacts".to_string()))
                .await;
        };
        let target = match &self.request.canonical_dir {
            Some(dir) => {
                let name = paths
                    .final_path
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("file"));
                avoid_collision(dir.join(name))
            }
            None => paths.final_path.clone(),
        };
        if let Some(parent) = target.parent() {
            if let Err(error) = fs::create_dir_all(parent).await {
                warn!(%error, dir = %parent.display(), "could not create target directory");
            }
        }

        let placed = match fs::rename(&paths.temp, &target).await {
            Ok(()) => target,
            Err(error) => {
                self.rename_attempts += 1;
                if self.rename_attempts < self.ctx.config.rename_retry_limit {
                    warn!(attempt = self.rename_attempts, %error, "rename failed, retrying");
                    self.schedule_finalize_retry();
                    return;
                }
                warn!(%error, "rename keeps failing, keeping the temp file as result");
                paths.temp.clone()
            }
        };
        if let Some(key) = &paths.key {
            if placed != paths.final_path && placed != paths.temp {
                let mut moved = placed.as_os_str().to_owned();
                moved.push(".key");
                if let Err(error) = fs::rename(key, PathBuf::from(moved)).await {
                    warn!(%error, "could not move the at-rest key next to the file");
                }
            }
        }

        self.finalizing = false;
        self.state = TransferState::Finished;
        self.progress.set_state(TransferState::Finished);
        info!(path = %placed.display(), size = self.total - self.padding, "transfer finished");
        if self.request.canonical_dir.is_some() && placed != paths.temp {
            self.delegate.on_save_canonical_path(&placed);
        }
        self.final_path = Some(placed.clone());
        self.notify_listeners();
        self.delegate.on_finished(&placed);
    }

    fn schedule_finalize_retry(&self) {
        let me = self.me.clone();
        let delay = self.ctx.config.rename_retry_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = me.upgrade() {
                let _ = tx.send(Command::RetryFinalize);
            }
        });
    }

    async fn fail(&mut self, error: TransferError) {
        if self.state.is_terminal() {
            return;
        }
        let reason = error.failure_reason();
        if reason == FailureReason::Cancelled {
            info!("transfer cancelled");
        } else {
            warn!(%error, "transfer failed");
        }
        self.clear_requests(None);
        self.finalizing = false;
        self.temp_file = None;

        if let Some(paths) = &self.paths {
            if let Some(preload) = &paths.preload {
                self.ctx.writer.close(preload.clone());
            }
            if error.is_integrity_failure() {
                if let Err(error) = remove_if_exists(&paths.temp).await {
                    warn!(%error, "could not discard the temp file");
                }
                for path in paths.iv.iter().chain(paths.parts.iter()) {
                    self.ctx.writer.remove(path.clone());
                }
            }
        }

        if reason == FailureReason::Cancelled {
            self.state = TransferState::Cancelled;
            self.progress.set_state(TransferState::Cancelled);
        } else {
            self.state = TransferState::Failed;
            self.progress.set_error(error.user_message());
        }
        self.delegate.on_failed(reason);
    }

    async fn cancel(&mut self, delete_files: bool) {
        self.fail(TransferError::Cancelled).await;
        if !delete_files {
            return;
        }
        let paths = match self.paths.clone() {
            Some(paths) => paths,
            None => self.every_artifact(),
        };
        self.temp_file = None;
        for path in paths.all() {
            self.ctx.writer.remove(path.clone());
        }
        if let Some(placed) = &self.final_path {
            if *placed != paths.final_path {
                self.ctx.writer.remove(placed.clone());
            }
        }
        info!("artifacts deleted");
    }

    /// Paths of every artifact this transfer may have left, before setup ran
    fn every_artifact(&self) -> ArtifactPaths {
        let flags = ArtifactFlags {
            ranges: true,
            whole_file_cipher: self.location.whole_file_key().is_some(),
            preload: self.request.supports_preload,
            encrypt_at_rest: self.request.encrypt_at_rest,
        };
        ArtifactPaths::derive(
            &self.location,
            &self.request.temp_dir,
            &self.request.store_dir,
            &self.request.extension,
            self.request.final_name.as_deref(),
            flags,
        )
    }

    async fn set_preload(&mut self, preload: bool) {
        if preload == self.is_preload {
            return;
        }
        match self.state {
            TransferState::Idle => {
                self.is_preload = preload;
                self.request.preload = preload;
            }
            TransferState::Downloading | TransferState::Finished if !preload => {
                info!("switching from preload to full download");
                self.clear_requests(None);
                self.is_preload = false;
                self.request.preload = false;
                self.total -= self.padding;
                self.padding = 0;
                self.state = TransferState::Idle;
                self.progress.set_state(TransferState::Idle);
                self.start(None).await;
            }
            _ => debug!(preload, "preload mode cannot be enabled on a running transfer"),
        }
    }

    // ===== Queries =====

    fn answer(&self, query: Query) {
        match query {
            Query::DownloadedLength { offset, length, reply } => {
                let finished = self.state == TransferState::Finished;
                let _ = reply.send((self.downloaded_length(offset, length), finished));
            }
            Query::State(reply) => {
                let _ = reply.send(self.state);
            }
            Query::Progress(reply) => {
                let _ = reply.send(self.progress.clone_progress());
            }
            Query::CurrentFile(reply) => {
                let current = match &self.final_path {
                    Some(path) if self.state == TransferState::Finished => Some(path.clone()),
                    _ => self.paths.as_ref().map(|p| p.temp.clone()),
                };
                let _ = reply.send(current);
            }
        }
    }

    fn downloaded_length(&self, offset: u64, length: u64) -> u64 {
        if self.is_preload {
            let Some(planner) = &self.preload else {
                return 0;
            };
            let chunk = self.pipeline.chunk_size();
            let aligned = offset / chunk * chunk;
            return planner
                .preloaded_range(aligned)
                .map_or(0, |r| length.min((aligned + r.length).saturating_sub(offset)));
        }
        if self.state == TransferState::Finished {
            return length;
        }
        let available = match &self.not_loaded {
            Some(set) => set.coverage_from(offset, length, self.total),
            None => length.min(self.downloaded.saturating_sub(offset)),
        };
        match &self.cdn {
            Some(cdn) => {
                let span = if self.total > 0 {
                    self.total
                } else {
                    self.ctx.config.max_file_size
                };
                available.min(cdn.coverage_from(offset, length, span))
            }
            None => available,
        }
    }
}

/// Whether a completed chunk may be written now
///
/// Without a not-loaded set chunks are written strictly in order. A CDN chunk
/// waits for the hash of its window.
fn ready_to_apply(
    request: &ChunkRequest,
    any_order: bool,
    downloaded: u64,
    cdn: Option<&CdnSession>,
    is_preload: bool,
) -> bool {
    if !any_order && request.offset != downloaded {
        return false;
    }
    if is_preload || !request.payload.as_ref().is_some_and(ChunkPayload::is_cdn) {
        return true;
    }
    match cdn {
        Some(cdn) => {
            let window = cdn.window_of(request.offset);
            cdn.has_hash(window) || cdn.is_checked(window)
        }
        None => true,
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
