//! Shared fixtures for transfer integration tests
//!
//! `MockTransport` records every request and answers through a handler
//! closure. `ChannelDelegate` forwards callbacks to a channel the test
//! awaits on.

#![allow(dead_code)]

use chunkload_core::transport::{FileHash, RpcRequest, RpcResponse, RpcResult, SendOptions};
use chunkload_core::{FailureReason, Location, RequestToken, TransferDelegate, TransferOperation, Transport};
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

type Handler = dyn Fn(&RpcRequest, &SendOptions) -> BoxFuture<'static, RpcResult> + Send + Sync;

/// Transport double answering through a closure
pub struct MockTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<(RpcRequest, SendOptions)>>,
    cancelled: Mutex<Vec<RequestToken>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&RpcRequest, &SendOptions) -> BoxFuture<'static, RpcResult> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        })
    }

    /// Serve chunk requests from `data` and nothing else
    pub fn serving(data: Arc<Vec<u8>>) -> Arc<Self> {
        Self::new(move |request, _| ready(serve_chunk(&data, request)))
    }

    pub fn requests(&self) -> Vec<(RpcRequest, SendOptions)> {
        self.requests.lock().unwrap().clone()
    }

    /// Offsets of every chunk request, in issue order
    pub fn chunk_offsets(&self) -> Vec<u64> {
        self.requests()
            .iter()
            .filter_map(|(request, _)| request.chunk_offset())
            .collect()
    }

    pub fn count<F: Fn(&RpcRequest) -> bool>(&self, filter: F) -> usize {
        self.requests().iter().filter(|(request, _)| filter(request)).count()
    }

    pub fn cancelled(&self) -> Vec<RequestToken> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn send(&self, request: RpcRequest, options: SendOptions) -> BoxFuture<'static, RpcResult> {
        let answer = (self.handler)(&request, &options);
        self.requests.lock().unwrap().push((request, options));
        answer
    }

    fn cancel(&self, token: RequestToken) {
        self.cancelled.lock().unwrap().push(token);
    }
}

pub fn ready(result: RpcResult) -> BoxFuture<'static, RpcResult> {
    Box::pin(async move { result })
}

/// Answer held back until `gate` hands out a permit
pub fn gated(gate: Arc<Semaphore>, result: RpcResult) -> BoxFuture<'static, RpcResult> {
    Box::pin(async move {
        let _permit = gate.acquire().await.expect("gate closed");
        result
    })
}

/// Future that never resolves, for requests left on the wire
pub fn never() -> BoxFuture<'static, RpcResult> {
    Box::pin(futures_util::future::pending())
}

/// Slice of `data` a chunk request asks for
pub fn slice(data: &[u8], offset: u64, limit: u32) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = (start + limit as usize).min(data.len());
    data[start..end].to_vec()
}

pub fn serve_chunk(data: &[u8], request: &RpcRequest) -> RpcResult {
    match request {
        RpcRequest::GetFile { offset, limit, .. } => Ok(RpcResponse::File {
            bytes: slice(data, *offset, *limit),
        }),
        RpcRequest::GetWebFile { offset, limit, .. } => Ok(RpcResponse::WebFile {
            bytes: slice(data, *offset, *limit),
            size: data.len() as u64,
        }),
        other => panic!("unexpected request {:?}", other),
    }
}

/// Deterministic test payload
pub fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn window_hash(data: &[u8], offset: u64, limit: u64) -> FileHash {
    let end = ((offset + limit) as usize).min(data.len());
    FileHash {
        offset,
        limit: limit as u32,
        hash: Sha256::digest(&data[offset as usize..end]).to_vec(),
    }
}

pub fn plain_location(datacenter_id: i32, id: i64) -> Location {
    Location::Plain {
        datacenter_id,
        id,
        access_hash: 7,
        file_reference: vec![1],
        volume_id: 0,
        local_id: 0,
    }
}

pub fn peer_photo(photo_id: i64) -> Location {
    Location::PeerPhoto {
        datacenter_id: 2,
        peer_id: 10,
        photo_id,
        big: true,
        file_reference: Vec::new(),
    }
}

/// Delegate callbacks as values
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Progress(u64, u64),
    Finished(PathBuf),
    PreloadFinished(u64),
    Failed(FailureReason),
    Canonical(PathBuf),
}

pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<Event>,
}

pub fn channel_delegate() -> (Arc<ChannelDelegate>, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelDelegate { tx }), rx)
}

impl TransferDelegate for ChannelDelegate {
    fn on_progress(&self, downloaded: u64, total: u64) {
        let _ = self.tx.send(Event::Progress(downloaded, total));
    }

    fn on_finished(&self, final_path: &Path) {
        let _ = self.tx.send(Event::Finished(final_path.to_path_buf()));
    }

    fn on_preload_finished(&self, preloaded_bytes: u64) {
        let _ = self.tx.send(Event::PreloadFinished(preloaded_bytes));
    }

    fn on_failed(&self, reason: FailureReason) {
        let _ = self.tx.send(Event::Failed(reason));
    }

    fn on_save_canonical_path(&self, path: &Path) {
        let _ = self.tx.send(Event::Canonical(path.to_path_buf()));
    }
}

/// Next terminal event, skipping progress and canonical-path notices
pub async fn wait_terminal(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Some(Event::Progress(..)) | Some(Event::Canonical(_)) => continue,
                Some(event) => return event,
                None => panic!("delegate dropped without a terminal event"),
            }
        }
    })
    .await
    .expect("transfer did not reach a terminal state")
}

/// Poll until `check` holds
pub async fn wait_until<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

/// Poll progress until `bytes` are reported downloaded
pub async fn wait_for_downloaded(operation: &TransferOperation, bytes: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let progress = operation.progress().await.expect("worker stopped");
            if progress.bytes_downloaded == bytes {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("download did not reach the expected size")
}
