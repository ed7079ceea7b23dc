//! Export of one directory tree: attributes, listings and content by digest.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use content_cache::{CacheError, ContentCache, ContentHash};

use crate::attr::{DirListing, FileAttr, FileInfo, Status};
use crate::paths;
use crate::rpc::{FsApi, Request, Response, RpcError, RpcService};

#[derive(Default)]
struct Caches {
    /// Absent: never queried. Present and not Ok: confirmed gone.
    attrs: HashMap<String, FileAttr>,
    hashes: HashMap<String, ContentHash>,
}

struct Inner {
    root: PathBuf,
    cache: ContentCache,
    excludes: Vec<String>,
    caches: Mutex<Caches>,
}

/// Serves attributes and content of the tree under `root`.
///
/// Keys are wire paths (`/`-prefixed, relative to `root`). Clones share the
/// same caches.
#[derive(Clone)]
pub struct FsServer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsServer")
            .field("root", &self.inner.root)
            .field("excludes", &self.inner.excludes)
            .finish_non_exhaustive()
    }
}

impl FsServer {
    /// `excludes` are wire-path prefixes reported as absent, e.g. `/proc`.
    pub fn new(root: impl Into<PathBuf>, cache: ContentCache, excludes: &[String]) -> Self {
        let excludes = excludes
            .iter()
            .map(|e| paths::normalize(e))
            .filter(|e| e != "/")
            .collect();
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                cache,
                excludes,
                caches: Mutex::new(Caches::default()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn content_cache(&self) -> &ContentCache {
        &self.inner.cache
    }

    fn excluded(&self, path: &str) -> bool {
        self.inner
            .excludes
            .iter()
            .any(|prefix| paths::has_dir_prefix(path, prefix))
    }

    fn backing_path(&self, path: &str) -> PathBuf {
        self.inner.root.join(paths::relative(path))
    }

    /// Attribute of `path`, from the cache when it was seen before.
    pub fn get_attr(&self, path: &str) -> FileAttr {
        let path = paths::normalize(path);
        if let Some(attr) = self.inner.caches.lock().attrs.get(&path) {
            return attr.clone();
        }

        let attr = self.read_attr(&path);
        let mut caches = self.inner.caches.lock();
        match &attr.hash {
            Some(hash) => {
                caches.hashes.insert(path.clone(), hash.clone());
            }
            None => {
                caches.hashes.remove(&path);
            }
        }
        caches.attrs.insert(path, attr.clone());
        attr
    }

    /// Stat `path` on disk, hashing regular files into the content cache.
    fn read_attr(&self, path: &str) -> FileAttr {
        if self.excluded(path) {
            return FileAttr::not_found(path);
        }
        let full = self.backing_path(path);
        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) => return FileAttr::failed(path, Status::from_io_error(&e)),
        };

        let info = FileInfo::from_metadata(&meta);
        let mut attr = FileAttr {
            path: path.to_string(),
            info: None,
            hash: None,
            link: None,
            status: Status::Ok,
        };
        if info.is_regular() {
            match self.inner.cache.save_path(&full) {
                Ok(hash) => attr.hash = Some(hash),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to hash file");
                    return FileAttr::failed(path, cache_status(&e));
                }
            }
        } else if info.is_symlink() {
            match fs::read_link(&full) {
                Ok(target) => attr.link = Some(target.to_string_lossy().into_owned()),
                Err(e) => return FileAttr::failed(path, Status::from_io_error(&e)),
            }
        }
        attr.info = Some(info);
        attr
    }

    /// Names of the immediate children of `path`, sorted.
    pub fn read_dir(&self, path: &str) -> DirListing {
        let path = paths::normalize(path);
        if self.excluded(&path) {
            return DirListing {
                status: Status::NotFound,
                names: Vec::new(),
            };
        }

        let entries = match fs::read_dir(self.backing_path(&path)) {
            Ok(entries) => entries,
            Err(e) => {
                return DirListing {
                    status: Status::from_io_error(&e),
                    names: Vec::new(),
                }
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !self.excluded(&paths::join(&path, name)))
            .collect();
        names.sort();
        DirListing {
            status: Status::Ok,
            names,
        }
    }

    /// Re-check every cached entry under `dir` against the disk.
    ///
    /// Entries that disappeared become tombstones; entries whose metadata
    /// changed (or that reappeared) are re-read. Paths never queried stay
    /// absent. Returns the new attributes of everything that changed.
    pub fn refresh_attribute_cache(&self, dir: &str) -> Vec<FileAttr> {
        let candidates: Vec<FileAttr> = {
            let caches = self.inner.caches.lock();
            caches
                .attrs
                .iter()
                .filter(|(key, _)| paths::has_dir_prefix(key, dir))
                .map(|(_, attr)| attr.clone())
                .collect()
        };

        let mut updated = Vec::new();
        for old in candidates {
            let current = fs::symlink_metadata(self.backing_path(&old.path)).ok();
            let changed = match (&old.info, current) {
                (Some(_), None) => {
                    let mut tombstone = old.clone();
                    tombstone.tombstone();
                    Some(tombstone)
                }
                (Some(cached), Some(meta)) if !cached.same_state(&FileInfo::from_metadata(&meta)) => {
                    Some(self.read_attr(&old.path))
                }
                (None, Some(_)) => Some(self.read_attr(&old.path)),
                _ => None,
            };
            if let Some(attr) = changed {
                tracing::debug!(path = %attr.path, ok = attr.is_ok(), "attribute changed");
                updated.push(attr);
            }
        }

        if !updated.is_empty() {
            self.update_files(updated.clone());
        }
        updated
    }

    /// Bytes for `hash`, if this side has them.
    pub fn fetch_content(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        match self.inner.cache.get(hash) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(hash = %hash.short(), error = %e, "content read failed");
                None
            }
        }
    }

    /// Overwrite cached attributes with `attrs`, as pushed by the owner of
    /// the tree.
    pub fn update_files(&self, attrs: Vec<FileAttr>) {
        let mut caches = self.inner.caches.lock();
        for mut attr in attrs {
            attr.path = paths::normalize(&attr.path);
            match &attr.hash {
                Some(hash) => {
                    caches.hashes.insert(attr.path.clone(), hash.clone());
                }
                None => {
                    caches.hashes.remove(&attr.path);
                }
            }
            caches.attrs.insert(attr.path.clone(), attr);
        }
    }

    /// The cached attribute of `path`, without touching the disk.
    pub fn cached_attr(&self, path: &str) -> Option<FileAttr> {
        self.inner.caches.lock().attrs.get(&paths::normalize(path)).cloned()
    }

    pub fn cached_hash(&self, path: &str) -> Option<ContentHash> {
        self.inner.caches.lock().hashes.get(&paths::normalize(path)).cloned()
    }

    pub fn cached_len(&self) -> usize {
        self.inner.caches.lock().attrs.len()
    }

    fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::GetAttr { path } => Response::Attr(self.get_attr(&path)),
            Request::ReadDir { path } => Response::DirEntries(self.read_dir(&path)),
            Request::FetchContent { hash } => Response::Content(self.fetch_content(&hash)),
            Request::UpdateFiles { attrs } => {
                self.update_files(attrs);
                Response::Ack
            }
            other => Response::Error(format!("{} is not served here", other.kind())),
        }
    }
}

fn cache_status(err: &CacheError) -> Status {
    match err {
        CacheError::Io { source, .. } => Status::from_io_error(source),
        _ => Status::Error(libc::EIO),
    }
}

#[async_trait]
impl RpcService for FsServer {
    async fn handle(&self, request: Request) -> Response {
        let server = self.clone();
        let kind = request.kind();
        match tokio::task::spawn_blocking(move || server.dispatch(request)).await {
            Ok(response) => response,
            Err(e) => Response::Error(format!("{} handler failed: {}", kind, e)),
        }
    }
}

impl FsApi for FsServer {
    fn get_attr(&self, path: &str) -> Result<FileAttr, RpcError> {
        Ok(FsServer::get_attr(self, path))
    }

    fn read_dir(&self, path: &str) -> Result<DirListing, RpcError> {
        Ok(FsServer::read_dir(self, path))
    }

    fn fetch_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, RpcError> {
        Ok(FsServer::fetch_content(self, hash))
    }

    fn update_files(&self, attrs: Vec<FileAttr>) -> Result<(), RpcError> {
        FsServer::update_files(self, attrs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::FileKind;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, FsServer) {
        let tmp = TempDir::new().unwrap();
        let orig = tmp.path().join("orig");
        fs::create_dir(&orig).unwrap();
        fs::write(orig.join("file.txt"), b"hello").unwrap();
        let cache = ContentCache::new(&tmp.path().join("server-cache")).unwrap();
        let server = FsServer::new(&orig, cache, &[]);
        (tmp, orig, server)
    }

    #[test]
    fn test_refresh_never_populates() {
        let (_tmp, _orig, server) = setup();
        let updated = server.refresh_attribute_cache("/");
        assert!(updated.is_empty());
        assert_eq!(server.cached_len(), 0);
    }

    #[test]
    fn test_get_attr_fills_cache() {
        let (_tmp, _orig, server) = setup();
        assert!(server.get_attr("/").is_dir());
        let attr = server.get_attr("/file.txt");

        assert_eq!(server.cached_len(), 2);
        let info = attr.info.as_ref().unwrap();
        assert_eq!(info.kind, FileKind::Regular);
        assert_eq!(info.size, 5);
        assert_eq!(attr.hash, Some(ContentHash::from_data(b"hello")));
        assert_eq!(server.cached_hash("/file.txt"), attr.hash);
    }

    #[test]
    fn test_rename_then_refresh_tombstones() {
        let (_tmp, orig, server) = setup();
        server.get_attr("/");
        server.get_attr("/file.txt");

        fs::rename(orig.join("file.txt"), orig.join("new.txt")).unwrap();
        let updated = server.refresh_attribute_cache("/");

        let old = server.cached_attr("/file.txt").expect("entry kept");
        assert!(!old.is_ok());
        assert!(updated.iter().any(|a| a.path == "/file.txt" && !a.is_ok()));
        // The new name was never queried.
        assert!(server.cached_attr("/new.txt").is_none());
    }

    #[test]
    fn test_refresh_rereads_changed_content() {
        let (_tmp, orig, server) = setup();
        let before = server.get_attr("/file.txt");

        fs::write(orig.join("file.txt"), b"hello, world").unwrap();
        let updated = server.refresh_attribute_cache("/");

        assert_eq!(updated.len(), 1);
        let after = server.get_attr("/file.txt");
        assert_ne!(before.hash, after.hash);
        assert_eq!(after.hash, Some(ContentHash::from_data(b"hello, world")));
        assert_eq!(
            server.fetch_content(after.hash.as_ref().unwrap()),
            Some(b"hello, world".to_vec())
        );
    }

    #[test]
    fn test_refresh_is_scoped_to_dir() {
        let (_tmp, orig, server) = setup();
        fs::create_dir(orig.join("sub")).unwrap();
        fs::write(orig.join("sub/inner.txt"), b"x").unwrap();
        server.get_attr("/file.txt");
        server.get_attr("/sub/inner.txt");

        fs::remove_file(orig.join("file.txt")).unwrap();
        fs::remove_file(orig.join("sub/inner.txt")).unwrap();
        let updated = server.refresh_attribute_cache("/sub");

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].path, "/sub/inner.txt");
        assert!(server.cached_attr("/file.txt").unwrap().is_ok());
    }

    #[test]
    fn test_update_files_overwrites() {
        let (_tmp, _orig, server) = setup();
        server.get_attr("/file.txt");

        let new_hash = ContentHash::from_data(b"somethingelse");
        server.update_files(vec![FileAttr {
            path: "/file.txt".into(),
            info: Some(FileInfo::regular(0o644, 13)),
            hash: Some(new_hash.clone()),
            link: None,
            status: Status::Ok,
        }]);
        assert_eq!(server.cached_hash("/file.txt"), Some(new_hash.clone()));
        assert_eq!(server.get_attr("/file.txt").hash, Some(new_hash));
    }

    #[test]
    fn test_missing_and_excluded_paths() {
        let (tmp, orig, _) = setup();
        fs::create_dir(orig.join("proc")).unwrap();
        let cache = ContentCache::new(&tmp.path().join("c2")).unwrap();
        let server = FsServer::new(&orig, cache, &["/proc".to_string()]);

        assert_eq!(server.get_attr("/nope").status, Status::NotFound);
        assert_eq!(server.get_attr("/proc").status, Status::NotFound);
        let listing = server.read_dir("/");
        assert_eq!(listing.names, vec!["file.txt".to_string()]);
        assert_eq!(server.read_dir("/file.txt/x").status, Status::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_records_target() {
        let (_tmp, orig, server) = setup();
        std::os::unix::fs::symlink("file.txt", orig.join("link")).unwrap();
        let attr = server.get_attr("/link");
        assert!(attr.info.as_ref().unwrap().is_symlink());
        assert_eq!(attr.link.as_deref(), Some("file.txt"));
        assert!(attr.hash.is_none());
    }

    #[tokio::test]
    async fn test_non_file_requests_are_refused() {
        let (_tmp, _orig, server) = setup();
        let response = RpcService::handle(&server, Request::Status).await;
        assert!(matches!(response, Response::Error(_)));
    }
}
