//! Read-only view of a remote tree, built from RPC calls and a local
//! content cache.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use common::attr::{DirListing, FileAttr, FileInfo, FileKind, Status};
use common::paths;
use common::rpc::FsApi;
use content_cache::{ContentCache, ContentHash};

use super::loopback::read_at;
use super::{Caller, DirEntry, Errno, FsResult, PathFs};

/// Kernel cache entry to drop after an attribute push. Paths are relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// The file still exists; its data and attributes changed.
    Content(String),
    /// The name disappeared from `parent`.
    Entry { parent: String, name: String },
}

/// Transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcFsStats {
    /// Content fetched from the server.
    pub fetches: u64,
    /// Reads served from the local cache.
    pub cache_hits: u64,
}

pub struct RpcFs {
    api: Arc<dyn FsApi>,
    cache: ContentCache,
    /// Keyed by wire path. Non-Ok entries are confirmed absent.
    attrs: Mutex<HashMap<String, FileAttr>>,
    dirs: Mutex<HashMap<String, Arc<DirListing>>>,
    /// One lock per digest being fetched.
    fetching: Mutex<HashMap<ContentHash, Arc<Mutex<()>>>>,
    fetches: AtomicU64,
    cache_hits: AtomicU64,
}

impl std::fmt::Debug for RpcFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcFs")
            .field("cache", &self.cache)
            .field("attrs", &self.attrs.lock().len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl RpcFs {
    pub fn new(api: Arc<dyn FsApi>, cache: ContentCache) -> Self {
        Self {
            api,
            cache,
            attrs: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            fetching: Mutex::new(HashMap::new()),
            fetches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> RpcFsStats {
        RpcFsStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Full attribute of `path`, asking the server on first use.
    pub fn attr(&self, path: &str) -> FsResult<FileAttr> {
        let wire = paths::normalize(path);
        if let Some(attr) = self.attrs.lock().get(&wire) {
            return Ok(attr.clone());
        }

        let attr = self.api.get_attr(&wire).map_err(|e| {
            tracing::warn!(path = %wire, error = %e, "get_attr rpc failed");
            Errno::IO
        })?;
        self.attrs.lock().insert(wire, attr.clone());
        Ok(attr)
    }

    fn listing(&self, path: &str) -> FsResult<Arc<DirListing>> {
        let wire = paths::normalize(path);
        if let Some(listing) = self.dirs.lock().get(&wire) {
            return Ok(listing.clone());
        }

        let listing = self.api.read_dir(&wire).map_err(|e| {
            tracing::warn!(path = %wire, error = %e, "read_dir rpc failed");
            Errno::IO
        })?;
        let listing = Arc::new(listing);
        if listing.status.is_ok() {
            self.dirs.lock().insert(wire, listing.clone());
        }
        Ok(listing)
    }

    /// Local path of the blob for `hash`, fetching it once if needed.
    fn local_content(&self, hash: &ContentHash) -> FsResult<PathBuf> {
        if let Some(path) = self.cache.path(hash) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(path);
        }

        let lock = self.fetching.lock().entry(hash.clone()).or_default().clone();
        let _guard = lock.lock();
        // Another reader may have completed the fetch while we waited.
        if let Some(path) = self.cache.path(hash) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(path);
        }

        let result = self.fetch(hash);
        self.fetching.lock().remove(hash);
        result
    }

    fn fetch(&self, hash: &ContentHash) -> FsResult<PathBuf> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let data = match self.api.fetch_content(hash) {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::warn!(hash = %hash.short(), "server does not have content");
                return Err(Errno::IO);
            }
            Err(e) => {
                tracing::warn!(hash = %hash.short(), error = %e, "fetch_content rpc failed");
                return Err(Errno::IO);
            }
        };
        tracing::debug!(hash = %hash.short(), bytes = data.len(), "fetched content");

        let stored = self.cache.put(&data).map_err(|e| {
            tracing::warn!(hash = %hash.short(), error = %e, "failed to store content");
            Errno::IO
        })?;
        if stored != *hash {
            tracing::warn!(want = %hash.short(), got = %stored.short(), "content digest mismatch");
            return Err(Errno::IO);
        }
        self.cache.path(hash).ok_or(Errno::IO)
    }

    /// Record pushed attributes and say what the kernel must forget.
    ///
    /// Removed paths are kept as tombstones, so later lookups answer ENOENT
    /// without asking the server.
    pub fn apply_update(&self, attrs: &[FileAttr]) -> Vec<Invalidation> {
        let mut invalidations = Vec::with_capacity(attrs.len());
        let mut cached = self.attrs.lock();
        let mut dirs = self.dirs.lock();
        for attr in attrs {
            let wire = paths::normalize(&attr.path);
            let parent = paths::parent(&wire);
            dirs.remove(&parent);
            dirs.remove(&wire);

            let mut attr = attr.clone();
            attr.path = wire.clone();
            if attr.is_ok() {
                invalidations.push(Invalidation::Content(paths::relative(&wire).to_string()));
            } else {
                attr.tombstone();
                invalidations.push(Invalidation::Entry {
                    parent: paths::relative(&parent).to_string(),
                    name: paths::file_name(&wire).to_string(),
                });
            }
            cached.insert(wire, attr);
        }
        invalidations
    }
}

fn ok_info(attr: &FileAttr) -> FsResult<&FileInfo> {
    match attr.status {
        Status::Ok => attr.info.as_ref().ok_or(Errno::IO),
        status => Err(Errno(status.errno())),
    }
}

impl PathFs for RpcFs {
    fn get_attr(&self, path: &str, _caller: &Caller) -> FsResult<FileInfo> {
        let attr = self.attr(path)?;
        ok_info(&attr).cloned()
    }

    fn read_dir(&self, path: &str, caller: &Caller) -> FsResult<Vec<DirEntry>> {
        let listing = self.listing(path)?;
        if !listing.status.is_ok() {
            return Err(Errno(listing.status.errno()));
        }

        let mut entries = Vec::with_capacity(listing.names.len());
        for name in &listing.names {
            let child = paths::join_relative(path, name);
            match self.get_attr(&child, caller) {
                Ok(info) => entries.push(DirEntry::new(name.clone(), info.kind)),
                // Vanished since the listing was taken.
                Err(Errno::NOENT) => {}
                Err(_) => entries.push(DirEntry::new(name.clone(), FileKind::Other)),
            }
        }
        Ok(entries)
    }

    fn read(&self, path: &str, offset: u64, size: u32, _caller: &Caller) -> FsResult<Vec<u8>> {
        let attr = self.attr(path)?;
        let info = ok_info(&attr)?;
        if info.is_dir() {
            return Err(Errno::ISDIR);
        }
        let hash = attr.hash.as_ref().ok_or(Errno::INVAL)?;
        let local = self.local_content(hash)?;
        let file = File::open(local)?;
        read_at(&file, offset, size)
    }

    fn read_link(&self, path: &str, _caller: &Caller) -> FsResult<String> {
        let attr = self.attr(path)?;
        ok_info(&attr)?;
        attr.link.clone().ok_or(Errno::INVAL)
    }
}
