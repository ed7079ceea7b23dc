//! Shared pieces of the termite master and worker: the wire data model,
//! authenticated connections, RPC and the file export server.

pub mod attr;
pub mod connection;
pub mod fs_server;
pub mod paths;
pub mod rpc;
pub mod status;
pub mod version;

pub use content_cache;

pub mod prelude {
    pub use crate::attr::{DirListing, FileAttr, FileInfo, FileKind, Status};
    pub use crate::fs_server::FsServer;
    pub use crate::rpc::{FsApi, Request, Response, RpcClient, RpcError, RpcService};
    pub use crate::status::{MirrorStatus, WorkerStatus};
    pub use content_cache::{ContentCache, ContentHash};
}
