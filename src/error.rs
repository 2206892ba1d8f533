//! Error types for chunkload-core
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped by the layer that produces them (transport, protocol,
//! integrity, local state, I/O) so the transfer state machine can decide between
//! recovery and a terminal transition with a single match.
//!
//! ## Terminal reasons
//!
//! Every error that ends a transfer maps onto a [`FailureReason`], the numeric
//! code delivered through `TransferDelegate::on_failed`:
//!
//! - `Failed` (0): generic protocol or I/O failure
//! - `Cancelled` (1): user-initiated stop, never shown as an error
//! - `RetryLimit` (2): the server refused further retries
//! - `IntegrityFailure` (3): CDN hash mismatch, partial data discarded

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our TransferError type
pub type Result<T> = std::result::Result<T, TransferError>;

/// Main error type for chunkload-core
#[derive(Error, Debug)]
pub enum TransferError {
    // ===== Transport Errors =====

    /// The RPC layer answered with an error that is not recoverable locally
    #[error("RPC error {code}: {text}")]
    Rpc {
        code: i32,
        text: String,
    },

    /// Server reported that the request was retried too often
    #[error("Server retry limit exceeded")]
    RetryLimitExceeded,

    /// A transient error kept recurring for the same chunk
    #[error("Chunk at offset {offset} failed after {attempts} attempts: {text}")]
    ChunkRetriesExhausted {
        offset: u64,
        attempts: u32,
        text: String,
    },

    /// The transport answered with a response shape the request cannot produce
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    // ===== Protocol Errors =====

    /// CDN redirect carried a key or IV of the wrong length
    #[error("Malformed CDN redirect: {0}")]
    MalformedCdnRedirect(String),

    /// CDN reupload was rejected by the origin
    #[error("CDN reupload failed: {0}")]
    CdnReuploadFailed(String),

    /// File reference refresh failed or returned a different object
    #[error("File reference refresh failed: {0}")]
    ReferenceRefreshFailed(String),

    /// Server reported an invalid offset past an unaligned cursor
    #[error("Invalid offset at {downloaded} bytes")]
    OffsetInvalid {
        downloaded: u64,
    },

    // ===== Integrity/Crypto Errors =====

    /// SHA-256 of a CDN window does not match the server-supplied hash
    #[error("CDN hash mismatch for window at offset {offset}")]
    IntegrityFailure {
        offset: u64,
    },

    /// Decryption could not be applied to a chunk
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    // ===== Local State Errors =====

    /// Location descriptor cannot be addressed
    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    /// Persisted artifact could not be parsed
    #[error("Invalid artifact data: {0}")]
    InvalidData(String),

    /// Operation is in a state that does not allow the request
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Transfer was cancelled by the caller
    #[error("Transfer cancelled")]
    Cancelled,

    /// The owning task of an operation or of the writer queue is gone
    #[error("Worker stopped: {0}")]
    WorkerStopped(&'static str),

    // ===== I/O and Serialization =====

    /// File system I/O failure (automatically converted from std::io::Error)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

/// Numeric reason delivered with a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    Failed,
    Cancelled,
    RetryLimit,
    IntegrityFailure,
}

impl FailureReason {
    /// Stable reason code for callers that persist or forward it
    pub fn code(self) -> i32 {
        match self {
            FailureReason::Failed => 0,
            FailureReason::Cancelled => 1,
            FailureReason::RetryLimit => 2,
            FailureReason::IntegrityFailure => 3,
        }
    }
}

impl TransferError {
    /// Create an RPC error from code and text
    pub fn rpc<S: Into<String>>(code: i32, text: S) -> Self {
        Self::Rpc {
            code,
            text: text.into(),
        }
    }

    /// Create an artifact parse error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData(message.into())
    }

    /// Create an invalid location error
    pub fn invalid_location<S: Into<String>>(message: S) -> Self {
        Self::InvalidLocation(message.into())
    }

    /// Create a decryption error
    pub fn decryption<S: Into<String>>(message: S) -> Self {
        Self::DecryptionFailed(message.into())
    }

    /// Check if the error may succeed when the same work is attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            Self::Rpc { code, .. } => *code == -1 || (500..=599).contains(code),
            _ => false,
        }
    }

    /// Check if the error is an integrity failure that discarded data
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::IntegrityFailure { .. })
    }

    /// Map the error onto the reason code reported to the delegate
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Cancelled => FailureReason::Cancelled,
            Self::RetryLimitExceeded => FailureReason::RetryLimit,
            Self::IntegrityFailure { .. } => FailureReason::IntegrityFailure,
            _ => FailureReason::Failed,
        }
    }

    /// Get user-friendly error message for display in UI
    pub fn user_message(&self) -> String {
        match self {
            Self::Cancelled => "Download was cancelled.".to_string(),
            Self::RetryLimitExceeded | Self::ChunkRetriesExhausted { .. } => {
                "The server is busy. Please try again later.".to_string()
            }
            Self::IntegrityFailure { .. } => {
                "Downloaded data failed verification and was discarded.".to_string()
            }
            Self::ReferenceRefreshFailed(_) => {
                "The file is no longer available. Please reload and try again.".to_string()
            }
            Self::IoError(_) => "Could not write the file to storage.".to_string(),
            _ => format!("Download failed: {}", self),
        }
    }
}
