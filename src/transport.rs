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


//! Contracts with the RPC layer
//!
//! The engine never speaks the wire format. It hands [`RpcRequest`] values to
//! a [`Transport`] and consumes [`RpcResponse`] / [`RpcError`] values. A
//! [`ReferenceResolver`] refreshes expired file references.
//!
//! # Request shapes
//! - `GetFile` - chunk from the origin datacenter
//! - `GetWebFile` - chunk of a proxied web resource
//! - `GetCdnFile` - chunk from a CDN session
//! - `GetCdnFileHashes` - out-of-band hash fetch for a CDN window
//! - `ReuploadCdnFile` - ask the origin to push the file back to the CDN

use crate::error::Result;
use crate::location::Location;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Identifier of one issued request, unique within a transfer context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestToken(pub u64);

impl std::fmt::Display for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Requests issued by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRequest {
    GetFile {
        location: Location,
        offset: u64,
        limit: u32,
        cdn_supported: bool,
    },
    GetWebFile {
        location: Location,
        offset: u64,
        limit: u32,
    },
    GetCdnFile {
        file_token: Vec<u8>,
        offset: u64,
        limit: u32,
    },
    GetCdnFileHashes {
        file_token: Vec<u8>,
        offset: u64,
    },
    ReuploadCdnFile {
        file_token: Vec<u8>,
        request_token: Vec<u8>,
    },
}

impl RpcRequest {
    /// Chunk offset for chunk requests
    pub fn chunk_offset(&self) -> Option<u64> {
        match self {
            RpcRequest::GetFile { offset, .. }
            | RpcRequest::GetWebFile { offset, .. }
            | RpcRequest::GetCdnFile { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

/// Expected SHA-256 of one CDN window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    pub offset: u64,
    pub limit: u32,
    pub hash: Vec<u8>,
}

/// Origin answer that moves the transfer onto a CDN session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnRedirect {
    pub datacenter_id: i32,
    pub file_token: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub encryption_iv: Vec<u8>,
    pub file_hashes: Vec<FileHash>,
}

/// Successful answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResponse {
    File { bytes: Vec<u8> },
    WebFile { bytes: Vec<u8>, size: u64 },
    CdnFile { bytes: Vec<u8> },
    CdnRedirect(CdnRedirect),
    CdnReuploadNeeded { request_token: Vec<u8> },
    FileHashes(Vec<FileHash>),
}

/// Error answer from the RPC layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub text: String,
}

/// How the engine reacts to an [`RpcError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Migrate(i32),
    OffsetInvalid,
    RetryLimit,
    FileReferenceExpired,
    FileTokenInvalid,
    RequestTokenInvalid,
    Transient,
    Fatal,
}

impl RpcError {
    pub fn new<S: Into<String>>(code: i32, text: S) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn classify(&self) -> ErrorClass {
        let text = self.text.as_str();
        if let Some(dc) = text.strip_prefix("FILE_MIGRATE_") {
            return match dc.parse::<i32>() {
                Ok(dc) if dc > 0 => ErrorClass::Migrate(dc),
                _ => ErrorClass::Fatal,
            };
        }
        match text {
            "OFFSET_INVALID" => ErrorClass::OffsetInvalid,
            "RETRY_LIMIT" => ErrorClass::RetryLimit,
            "FILE_TOKEN_INVALID" => ErrorClass::FileTokenInvalid,
            "REQUEST_TOKEN_INVALID" => ErrorClass::RequestTokenInvalid,
            "FILEREF_EXPIRED" => ErrorClass::FileReferenceExpired,
            t if t.starts_with("FILE_REFERENCE_") => ErrorClass::FileReferenceExpired,
            _ if self.code == -1 || self.code == -503 || (500..=599).contains(&self.code) => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Fatal,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Connection a request travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Generic,
    Download,
    Download2,
}

/// Flags passed along with a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub fail_on_server_errors: bool,
    pub force_download: bool,
    pub enable_unauthorized: bool,
    pub is_last: bool,
}

/// Routing for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub token: RequestToken,
    pub datacenter_id: i32,
    pub connection: ConnectionType,
    pub flags: RequestFlags,
}

pub type RpcResult = std::result::Result<RpcResponse, RpcError>;

/// RPC layer consumed by the engine
pub trait Transport: Send + Sync {
    /// Issue a request; the future resolves with the answer
    fn send(&self, request: RpcRequest, options: SendOptions) -> BoxFuture<'static, RpcResult>;

    /// Best-effort cancellation; a late answer is discarded by the engine
    fn cancel(&self, token: RequestToken);
}

/// The request that hit an expired reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub token: RequestToken,
    pub offset: u64,
}

/// Refreshes expired file references
pub trait ReferenceResolver: Send + Sync {
    fn refresh(&self, location: Location, pending: PendingRequest) -> BoxFuture<'static, Result<Location>>;
}

/// Resolver for contexts without reference refresh support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReferenceResolver;

impl ReferenceResolver for NoReferenceResolver {
    fn refresh(&self, _location: Location, _pending: PendingRequest) -> BoxFuture<'static, Result<Location>> {
        Box::pin(async {
            Err(crate::error::TransferError::ReferenceRefreshFailed(
                "no reference resolver configured".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(RpcError::new(303, "FILE_MIGRATE_3").classify(), ErrorClass::Migrate(3));
        assert_eq!(RpcError::new(303, "FILE_MIGRATE_x").classify(), ErrorClass::Fatal);
        assert_eq!(RpcError::new(400, "OFFSET_INVALID").classify(), ErrorClass::OffsetInvalid);
        assert_eq!(RpcError::new(400, "RETRY_LIMIT").classify(), ErrorClass::RetryLimit);
        assert_eq!(
            RpcError::new(400, "FILE_REFERENCE_EMPTY").classify(),
            ErrorClass::FileReferenceExpired
        );
        assert_eq!(
            RpcError::new(400, "FILEREF_EXPIRED").classify(),
            ErrorClass::FileReferenceExpired
        );
        assert_eq!(
            RpcError::new(400, "FILE_TOKEN_INVALID").classify(),
            ErrorClass::FileTokenInvalid
        );
        assert_eq!(RpcError::new(-1, "timeout").classify(), ErrorClass::Transient);
        assert_eq!(RpcError::new(500, "INTERNAL").classify(), ErrorClass::Transient);
        assert_eq!(RpcError::new(400, "LOCATION_INVALID").classify(), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_no_resolver_fails() {
        let location = Location::Secure {
            datacenter_id: 1,
            id: 1,
            access_hash: 0,
        };
        let pending = PendingRequest {
            token: RequestToken(1),
            offset: 0,
        };
        assert!(NoReferenceResolver.refresh(location, pending).await.is_err());
    }
}
