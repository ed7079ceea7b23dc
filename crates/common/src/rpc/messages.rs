use serde::{Deserialize, Serialize};

use content_cache::ContentHash;

use crate::attr::{DirListing, FileAttr};
use crate::status::WorkerStatus;

/// Calls understood by the master's file server and the worker daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    GetAttr { path: String },
    ReadDir { path: String },
    FetchContent { hash: ContentHash },
    /// Push changed attributes; receivers overwrite what they cached.
    UpdateFiles { attrs: Vec<FileAttr> },
    Status,
    /// Ask a worker to build a mirror served over the data channel tagged
    /// `rpc_id`, which the caller dials next.
    CreateMirror {
        rpc_id: String,
        writable_root: String,
        max_job_count: usize,
    },
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::GetAttr { .. } => "get_attr",
            Request::ReadDir { .. } => "read_dir",
            Request::FetchContent { .. } => "fetch_content",
            Request::UpdateFiles { .. } => "update_files",
            Request::Status => "status",
            Request::CreateMirror { .. } => "create_mirror",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Attr(FileAttr),
    DirEntries(DirListing),
    /// `None` when the digest is not known to the server.
    Content(Option<Vec<u8>>),
    Ack,
    Status(WorkerStatus),
    MirrorCreated { granted: usize },
    /// The request could not be served at all. Per-path failures travel in
    /// the attribute status instead.
    Error(String),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Attr(_) => "attr",
            Response::DirEntries(_) => "dir_entries",
            Response::Content(_) => "content",
            Response::Ack => "ack",
            Response::Status(_) => "status",
            Response::MirrorCreated { .. } => "mirror_created",
            Response::Error(_) => "error",
        }
    }
}
