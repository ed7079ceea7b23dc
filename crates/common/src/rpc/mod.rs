//! Request/response RPC over any byte stream.
//!
//! One connection carries a strict sequence of request and response frames.
//! The master's [`FsServer`](crate::fs_server::FsServer) and the worker
//! daemon both speak it; [`FsApi`] is the blocking view FUSE threads use.

mod client;
mod codec;
mod messages;
mod server;

use content_cache::ContentHash;

use crate::attr::{DirListing, FileAttr};

pub use client::{BlockingFsClient, RpcClient};
pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
pub use messages::{Request, Response};
pub use server::{serve_connection, RpcService};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] bincode::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("connection closed")]
    Closed,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("expected {expected} response, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

/// Blocking file-export calls, served in-process or over a connection.
pub trait FsApi: Send + Sync {
    fn get_attr(&self, path: &str) -> Result<FileAttr, RpcError>;

    fn read_dir(&self, path: &str) -> Result<DirListing, RpcError>;

    fn fetch_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, RpcError>;

    fn update_files(&self, attrs: Vec<FileAttr>) -> Result<(), RpcError>;
}
