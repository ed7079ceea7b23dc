//! The worker daemon: accepts master connections and keeps one [`Mirror`]
//! per exported tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use common::attr::FileAttr;
use common::connection::{accept_loop, BoxedStream, ConnectionId, MuxError, PendingConnections};
use common::rpc::{serve_connection, BlockingFsClient, Request, Response, RpcClient, RpcService};
use common::status::WorkerStatus;
use common::version::version_string;
use content_cache::{CacheError, ContentCache};

use crate::config::WorkerConfig;
use crate::fs::RpcFs;
use crate::mirror::Mirror;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error("failed to open content cache: {0}")]
    Cache(#[from] CacheError),
}

pub struct Worker {
    config: WorkerConfig,
    cache: ContentCache,
    pending: Arc<PendingConnections<BoxedStream>>,
    /// Keyed by the id of the channel the mirror reads through.
    mirrors: Mutex<HashMap<String, Arc<Mirror>>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("mirrors", &self.mirrors.lock().len())
            .finish()
    }
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let cache = ContentCache::new(&config.cache_dir)?;
        tracing::info!(cache = %config.cache_dir.display(), max_jobs = config.max_jobs, "worker starting");
        Ok(Self {
            config,
            cache,
            pending: Arc::new(PendingConnections::new()),
            mirrors: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn content_cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Connections waiting to be claimed by id.
    pub fn pending(&self) -> &Arc<PendingConnections<BoxedStream>> {
        &self.pending
    }

    pub fn mirror(&self, rpc_id: &str) -> Option<Arc<Mirror>> {
        self.mirrors.lock().get(rpc_id).cloned()
    }

    pub fn status(&self) -> WorkerStatus {
        let mut mirrors: Vec<_> = self.mirrors.lock().values().map(|m| m.status()).collect();
        mirrors.sort_by(|a, b| a.root.cmp(&b.root));
        WorkerStatus {
            mirrors,
            version: version_string(),
            max_job_count: self.config.max_jobs,
            shutting_down: self.shutting_down.load(Ordering::Relaxed),
        }
    }

    /// Claim the data channel `rpc_id` and build a mirror reading through
    /// it. Returns the granted concurrency.
    #[tracing::instrument(skip(self))]
    pub async fn create_mirror(
        &self,
        rpc_id: &str,
        writable_root: &str,
        max_job_count: usize,
    ) -> Result<usize, WorkerError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(WorkerError::ShuttingDown);
        }
        let id: ConnectionId = rpc_id.parse()?;
        let conn = self
            .pending
            .wait_timeout(&id, self.config.connect_timeout())
            .await?;

        let client = Arc::new(RpcClient::new(conn));
        let api = BlockingFsClient::new(client, Handle::current());
        let rpc_fs = Arc::new(RpcFs::new(Arc::new(api), self.cache.clone()));
        let granted = max_job_count.min(self.config.max_jobs).max(1);
        let mirror = Mirror::new(
            writable_root,
            rpc_fs,
            self.config.sandbox_options(writable_root),
            granted,
        );
        self.mirrors
            .lock()
            .insert(rpc_id.to_string(), Arc::new(mirror));
        tracing::info!(granted, "mirror created");
        Ok(granted)
    }

    /// Push changed attributes to every mirror.
    pub async fn update_files(&self, attrs: Vec<FileAttr>) {
        let attrs = Arc::new(attrs);
        let mirrors: Vec<Arc<Mirror>> = self.mirrors.lock().values().cloned().collect();
        for mirror in mirrors {
            let attrs = attrs.clone();
            // Kernel notifications may block on the FUSE device.
            let result = tokio::task::spawn_blocking(move || mirror.update(&attrs)).await;
            if let Err(e) = result {
                tracing::error!(error = %e, "mirror update panicked");
            }
        }
    }

    /// Route one authenticated connection, serving it if it is the RPC
    /// channel.
    pub async fn handle_connection(self: &Arc<Self>, conn: BoxedStream) {
        let Some(conn) = self.pending.accept(conn).await else {
            return;
        };
        if let Err(e) = serve_connection(conn, self.clone()).await {
            tracing::warn!(error = %e, "rpc connection failed");
        }
    }

    /// Accept master connections on `listener` until it fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener, secret: Vec<u8>) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "worker listening");
        }
        let (tx, mut rx) = mpsc::channel(16);
        let acceptor = tokio::spawn(accept_loop(listener, Arc::new(secret), tx));
        while let Some(conn) = rx.recv().await {
            let worker = self.clone();
            tokio::spawn(async move { worker.handle_connection(Box::new(conn)).await });
        }
        match acceptor.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }

    /// Refuse new mirrors and wind down the existing ones.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::Relaxed) {
            return;
        }
        tracing::info!("worker shutting down");
        let mirrors: Vec<Arc<Mirror>> = self.mirrors.lock().values().cloned().collect();
        for mirror in mirrors {
            mirror.shutdown();
        }
    }
}

#[async_trait]
impl RpcService for Worker {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Status => Response::Status(self.status()),
            Request::CreateMirror {
                rpc_id,
                writable_root,
                max_job_count,
            } => match self.create_mirror(&rpc_id, &writable_root, max_job_count).await {
                Ok(granted) => Response::MirrorCreated { granted },
                Err(e) => Response::Error(e.to_string()),
            },
            Request::UpdateFiles { attrs } => {
                self.update_files(attrs).await;
                Response::Ack
            }
            other => Response::Error(format!("worker does not serve {}", other.kind())),
        }
    }
}
