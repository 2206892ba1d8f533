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


//! Single writer for auxiliary artifacts
//!
//! Range, IV and preload files of every transfer in a context are written by
//! one task that drains a FIFO queue. Jobs for the same path therefore never
//! interleave, a removal always lands after the writes queued before it, and
//! the scheduling path only pays for a channel send.

use crate::error::{Result, TransferError};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum WriteJob {
    Replace {
        path: PathBuf,
        bytes: Vec<u8>,
    },
    WriteAt {
        path: PathBuf,
        offset: u64,
        bytes: Vec<u8>,
    },
    ReadAt {
        path: PathBuf,
        offset: u64,
        len: usize,
        reply: oneshot::Sender<std::io::Result<Vec<u8>>>,
    },
    Close {
        path: PathBuf,
    },
    Remove {
        path: PathBuf,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the writer task
#[derive(Clone, Debug)]
pub struct ArtifactWriter {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl std::fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteJob::Replace { path, bytes } => write!(f, "Replace({}, {} bytes)", path.display(), bytes.len()),
            WriteJob::WriteAt { path, offset, bytes } => {
                write!(f, "WriteAt({}, @{}, {} bytes)", path.display(), offset, bytes.len())
            }
            WriteJob::ReadAt { path, offset, len, .. } => {
                write!(f, "ReadAt({}, @{}, {} bytes)", path.display(), offset, len)
            }
            WriteJob::Close { path } => write!(f, "Close({})", path.display()),
            WriteJob::Remove { path } => write!(f, "Remove({})", path.display()),
            WriteJob::Flush { .. } => write!(f, "Flush"),
        }
    }
}

impl ArtifactWriter {
    /// Start the writer task on the current tokio runtime
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(rx));
        Self { tx }
    }

    /// Overwrite the whole file with `bytes`
    pub fn replace(&self, path: PathBuf, bytes: Vec<u8>) {
        self.submit(WriteJob::Replace { path, bytes });
    }

    /// Write `bytes` at `offset`, growing the file if needed
    pub fn write_at(&self, path: PathBuf, offset: u64, bytes: Vec<u8>) {
        self.submit(WriteJob::WriteAt { path, offset, bytes });
    }

    /// Release the cached handle of `path`
    pub fn close(&self, path: PathBuf) {
        self.submit(WriteJob::Close { path });
    }

    /// Delete `path` after every job queued before this one
    pub fn remove(&self, path: PathBuf) {
        self.submit(WriteJob::Remove { path });
    }

    /// Read `len` bytes at `offset`, ordered after pending writes
    pub async fn read_at(&self, path: PathBuf, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteJob::ReadAt { path, offset, len, reply })
            .map_err(|_| TransferError::WorkerStopped("artifact writer"))?;
        let bytes = rx
            .await
            .map_err(|_| TransferError::WorkerStopped("artifact writer"))??;
        Ok(bytes)
    }

    /// Wait until every job queued so far has been applied
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Flush { reply })
            .map_err(|_| TransferError::WorkerStopped("artifact writer"))?;
        rx.await.map_err(|_| TransferError::WorkerStopped("artifact writer"))
    }

    fn submit(&self, job: WriteJob) {
        if let Err(err) = self.tx.send(job) {
            warn!(job = ?err.0, "artifact writer stopped, dropping job");
        }
    }
}

async fn run_writer(mut rx: mpsc::UnboundedReceiver<WriteJob>) {
    let mut files: HashMap<PathBuf, File> = HashMap::new();

    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::Replace { path, bytes } => {
                if let Err(err) = replace(&mut files, &path, &bytes).await {
                    warn!(path = %path.display(), error = %err, "failed to rewrite artifact");
                    files.remove(&path);
                }
            }
            WriteJob::WriteAt { path, offset, bytes } => {
                if let Err(err) = write_at(&mut files, &path, offset, &bytes).await {
                    warn!(path = %path.display(), offset, error = %err, "failed to write artifact");
                    files.remove(&path);
                }
            }
            WriteJob::ReadAt { path, offset, len, reply } => {
                let result = read_at(&mut files, &path, offset, len).await;
                let _ = reply.send(result);
            }
            WriteJob::Close { path } => {
                files.remove(&path);
            }
            WriteJob::Remove { path } => {
                files.remove(&path);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!(path = %path.display(), "artifact removed"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(path = %path.display(), error = %err, "failed to remove artifact"),
                }
            }
            WriteJob::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

async fn handle<'a>(files: &'a mut HashMap<PathBuf, File>, path: &PathBuf) -> std::io::Result<&'a mut File> {
    if !files.contains_key(path) {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        files.insert(path.clone(), file);
    }
    files
        .get_mut(path)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "artifact handle missing"))
}

async fn replace(files: &mut HashMap<PathBuf, File>, path: &PathBuf, bytes: &[u8]) -> std::io::Result<()> {
    let file = handle(files, path).await?;
    file.seek(std::io::SeekFrom::Start(0)).await?;
    file.write_all(bytes).await?;
    file.set_len(bytes.len() as u64).await?;
    file.flush().await
}

async fn write_at(
    files: &mut HashMap<PathBuf, File>,
    path: &PathBuf,
    offset: u64,
    bytes: &[u8],
) -> std::io::Result<()> {
    let file = handle(files, path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

async fn read_at(
    files: &mut HashMap<PathBuf, File>,
    path: &PathBuf,
    offset: u64,
    len: usize,
) -> std::io::Result<Vec<u8>> {
    let file = handle(files, path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replace_shrinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranges.pt");
        let writer = ArtifactWriter::spawn();

        writer.replace(path.clone(), vec![1; 36]);
        writer.replace(path.clone(), vec![2; 4]);
        writer.flush().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![2; 4]);
    }

    #[tokio::test]
    async fn test_write_then_read_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.preload");
        let writer = ArtifactWriter::spawn();

        writer.write_at(path.clone(), 0, vec![0]);
        writer.write_at(path.clone(), 1, vec![9, 8, 7]);
        let read = writer.read_at(path.clone(), 1, 3).await.unwrap();
        assert_eq!(read, vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn test_remove_after_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cipher.iv");
        let writer = ArtifactWriter::spawn();

        writer.replace(path.clone(), vec![0; 64]);
        writer.remove(path.clone());
        writer.flush().await.unwrap();
        assert!(!path.exists());

        // Removing a missing file is not an error
        writer.remove(path.clone());
        writer.flush().await.unwrap();
    }
}
