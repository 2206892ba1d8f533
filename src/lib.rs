//! Resumable, encrypted, chunked file transfers
//!
//! A [`TransferOperation`] downloads one remote file in fixed-size chunks over
//! a caller-supplied [`Transport`], keeps enough state on disk to resume after
//! a restart, follows datacenter migrations and CDN redirects, verifies CDN
//! data against server hashes and can stop after a short video preload.

pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod file;
pub mod location;
pub mod storage;
pub mod transport;

pub use config::TransferConfig;
pub use download::{
    ListenerId, NoopDelegate, StreamListener, TransferContext, TransferDelegate, TransferOperation,
    TransferProgress, TransferRequest, TransferState,
};
pub use error::{FailureReason, Result, TransferError};
pub use location::Location;
pub use transport::{
    ReferenceResolver, RequestToken, RpcError, RpcRequest, RpcResponse, RpcResult, SendOptions, Transport,
};
