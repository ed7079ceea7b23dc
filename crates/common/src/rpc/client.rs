use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::Mutex;

use content_cache::ContentHash;

use super::codec::{read_frame, write_frame};
use super::{FsApi, Request, Response, RpcError};
use crate::attr::{DirListing, FileAttr};
use crate::connection::BoxedStream;
use crate::status::WorkerStatus;

/// Client end of one RPC connection. Concurrent calls queue on the
/// connection and complete in order.
pub struct RpcClient {
    conn: Mutex<BoxedStream>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

macro_rules! expect_response {
    ($response:expr, $variant:ident, $expected:literal) => {
        match $response {
            Response::$variant(value) => Ok(value),
            other => Err(RpcError::Unexpected {
                expected: $expected,
                got: other.kind(),
            }),
        }
    };
}

impl RpcClient {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            conn: Mutex::new(Box::new(stream)),
        }
    }

    /// Send one request and wait for its response. Remote failures come back
    /// as [`RpcError::Remote`].
    pub async fn call(&self, request: Request) -> Result<Response, RpcError> {
        let mut conn = self.conn.lock().await;
        write_frame(&mut *conn, &request).await?;
        match read_frame::<_, Response>(&mut *conn).await? {
            Some(Response::Error(e)) => Err(RpcError::Remote(e)),
            Some(response) => Ok(response),
            None => Err(RpcError::Closed),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_attr(&self, path: &str) -> Result<FileAttr, RpcError> {
        let response = self.call(Request::GetAttr { path: path.to_string() }).await?;
        expect_response!(response, Attr, "attr")
    }

    #[tracing::instrument(skip(self))]
    pub async fn read_dir(&self, path: &str) -> Result<DirListing, RpcError> {
        let response = self.call(Request::ReadDir { path: path.to_string() }).await?;
        expect_response!(response, DirEntries, "dir_entries")
    }

    #[tracing::instrument(skip(self, hash), fields(hash = %hash.short()))]
    pub async fn fetch_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, RpcError> {
        let response = self.call(Request::FetchContent { hash: hash.clone() }).await?;
        expect_response!(response, Content, "content")
    }

    pub async fn update_files(&self, attrs: Vec<FileAttr>) -> Result<(), RpcError> {
        match self.call(Request::UpdateFiles { attrs }).await? {
            Response::Ack => Ok(()),
            other => Err(RpcError::Unexpected {
                expected: "ack",
                got: other.kind(),
            }),
        }
    }

    pub async fn status(&self) -> Result<WorkerStatus, RpcError> {
        let response = self.call(Request::Status).await?;
        expect_response!(response, Status, "status")
    }

    /// Returns the concurrency the worker granted.
    pub async fn create_mirror(&self, rpc_id: &str, writable_root: &str, max_job_count: usize) -> Result<usize, RpcError> {
        let request = Request::CreateMirror {
            rpc_id: rpc_id.to_string(),
            writable_root: writable_root.to_string(),
            max_job_count,
        };
        match self.call(request).await? {
            Response::MirrorCreated { granted } => Ok(granted),
            other => Err(RpcError::Unexpected {
                expected: "mirror_created",
                got: other.kind(),
            }),
        }
    }
}

/// [`FsApi`] over an [`RpcClient`], for threads outside the runtime.
///
/// Calls block on `handle`; calling from inside one of its worker threads
/// panics, so hand this only to dedicated threads such as FUSE sessions.
#[derive(Debug, Clone)]
pub struct BlockingFsClient {
    client: Arc<RpcClient>,
    handle: Handle,
}

impl BlockingFsClient {
    pub fn new(client: Arc<RpcClient>, handle: Handle) -> Self {
        Self { client, handle }
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }
}

impl FsApi for BlockingFsClient {
    fn get_attr(&self, path: &str) -> Result<FileAttr, RpcError> {
        self.handle.block_on(self.client.get_attr(path))
    }

    fn read_dir(&self, path: &str) -> Result<DirListing, RpcError> {
        self.handle.block_on(self.client.read_dir(path))
    }

    fn fetch_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, RpcError> {
        self.handle.block_on(self.client.fetch_content(hash))
    }

    fn update_files(&self, attrs: Vec<FileAttr>) -> Result<(), RpcError> {
        self.handle.block_on(self.client.update_files(attrs))
    }
}
