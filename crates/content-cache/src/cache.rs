//! Disk-backed content cache with a small in-memory tier.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use moka::sync::Cache;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

use crate::error::{CacheError, Result};
use crate::hash::ContentHash;

/// Blobs up to this size are also kept in memory.
pub const MEMORY_BLOB_LIMIT: usize = 128 * 1024;

/// Default byte budget of the in-memory tier.
const DEFAULT_MEMORY_BUDGET: u64 = 64 * 1024 * 1024;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Entry count and byte total of the on-disk objects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheUsage {
    pub entries: u64,
    pub bytes: u64,
}

/// Statistics from a prune pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    /// Objects deleted
    pub removed: u64,
    /// Bytes released
    pub freed_bytes: u64,
    /// Bytes still on disk after the pass
    pub remaining_bytes: u64,
}

/// Content-addressed blob store keyed by [`ContentHash`].
///
/// Cloning is cheap; clones share the same directory and memory tier.
#[derive(Clone)]
pub struct ContentCache {
    dir: PathBuf,
    objects_dir: PathBuf,
    staging_dir: PathBuf,
    memory: Cache<ContentHash, Arc<Vec<u8>>>,
}

impl ContentCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn new(dir: &Path) -> Result<Self> {
        Self::with_memory_budget(dir, DEFAULT_MEMORY_BUDGET)
    }

    /// Open a cache whose in-memory tier holds at most `budget` bytes.
    pub fn with_memory_budget(dir: &Path, budget: u64) -> Result<Self> {
        let objects_dir = dir.join("objects");
        let staging_dir = dir.join("staging");
        fs::create_dir_all(&objects_dir).map_err(|e| CacheError::io(&objects_dir, e))?;
        fs::create_dir_all(&staging_dir).map_err(|e| CacheError::io(&staging_dir, e))?;

        let memory = Cache::builder()
            .weigher(|_hash: &ContentHash, blob: &Arc<Vec<u8>>| {
                u32::try_from(blob.len()).unwrap_or(u32::MAX)
            })
            .max_capacity(budget)
            .build();

        Ok(Self {
            dir: dir.to_path_buf(),
            objects_dir,
            staging_dir,
            memory,
        })
    }

    /// Root directory of the cache.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        self.objects_dir.join(hash.prefix()).join(hash.remainder())
    }

    /// Whether the blob for `hash` is present.
    pub fn has(&self, hash: &ContentHash) -> bool {
        self.memory.contains_key(hash) || self.object_path(hash).is_file()
    }

    /// Filesystem path of a stored blob, for callers that want to copy it.
    pub fn path(&self, hash: &ContentHash) -> Option<PathBuf> {
        let path = self.object_path(hash);
        path.is_file().then_some(path)
    }

    /// Fetch the bytes for `hash`, or `None` when the blob is not cached.
    pub fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        if let Some(blob) = self.memory.get(hash) {
            trace!(hash = %hash.short(), "memory hit");
            return Ok(Some(blob.as_ref().clone()));
        }

        let path = self.object_path(hash);
        match fs::read(&path) {
            Ok(data) => {
                touch(&path);
                if data.len() <= MEMORY_BLOB_LIMIT {
                    self.memory.insert(hash.clone(), Arc::new(data.clone()));
                }
                Ok(Some(data))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Store `data` and return its digest.
    ///
    /// Storing bytes that are already present is a no-op apart from hashing.
    pub fn put(&self, data: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::from_data(data);
        if self.has(&hash) {
            trace!(hash = %hash.short(), "already cached");
            return Ok(hash);
        }

        let mut staged = self.staging_file()?;
        staged
            .write_all(data)
            .map_err(|e| CacheError::io(staged.path(), e))?;
        self.persist(staged, &hash)?;

        if data.len() <= MEMORY_BLOB_LIMIT {
            self.memory.insert(hash.clone(), Arc::new(data.to_vec()));
        }
        debug!(hash = %hash.short(), size = data.len(), "stored blob");
        Ok(hash)
    }

    /// Store the contents of the file at `path`.
    pub fn save_path(&self, path: &Path) -> Result<ContentHash> {
        let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
        self.save_stream(file)
    }

    /// Store everything readable from `reader`, hashing while copying.
    pub fn save_stream<R: Read>(&self, mut reader: R) -> Result<ContentHash> {
        let mut staged = self.staging_file()?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut size = 0usize;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CacheError::io(staged.path(), e)),
            };
            hasher.update(&buf[..n]);
            staged
                .write_all(&buf[..n])
                .map_err(|e| CacheError::io(staged.path(), e))?;
            size += n;
        }

        let hash = ContentHash::from_hasher(&hasher);
        if self.has(&hash) {
            trace!(hash = %hash.short(), "already cached");
            return Ok(hash);
        }
        self.persist(staged, &hash)?;
        debug!(hash = %hash.short(), size, "stored streamed blob");
        Ok(hash)
    }

    fn staging_file(&self) -> Result<NamedTempFile> {
        NamedTempFile::new_in(&self.staging_dir).map_err(|e| CacheError::io(&self.staging_dir, e))
    }

    fn persist(&self, staged: NamedTempFile, hash: &ContentHash) -> Result<()> {
        let dest = self.object_path(hash);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }

        match staged.persist_noclobber(&dest) {
            Ok(_) => Ok(()),
            // Another writer stored the same bytes first.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(CacheError::Persist {
                hash: hash.to_string(),
                source: e.error,
            }),
        }
    }

    /// Walk the on-disk objects.
    fn objects(&self) -> Result<Vec<(ContentHash, PathBuf, u64, SystemTime)>> {
        let mut out = Vec::new();
        let shards =
            fs::read_dir(&self.objects_dir).map_err(|e| CacheError::io(&self.objects_dir, e))?;
        for shard in shards {
            let shard = shard.map_err(|e| CacheError::io(&self.objects_dir, e))?;
            let prefix = shard.file_name().to_string_lossy().into_owned();
            let Ok(entries) = fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let name = format!("{}{}", prefix, entry.file_name().to_string_lossy());
                let Ok(hash) = name.parse::<ContentHash>() else {
                    warn!(object = %name, "unexpected file in object store, skipping");
                    continue;
                };
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                out.push((hash, entry.path(), meta.len(), mtime));
            }
        }
        Ok(out)
    }

    /// Count stored objects and their total size.
    pub fn usage(&self) -> Result<CacheUsage> {
        let objects = self.objects()?;
        Ok(CacheUsage {
            entries: objects.len() as u64,
            bytes: objects.iter().map(|(_, _, size, _)| size).sum(),
        })
    }

    /// Evict least-recently-read objects until at most `max_bytes` remain.
    pub fn prune(&self, max_bytes: u64) -> Result<PruneStats> {
        let mut objects = self.objects()?;
        let mut total: u64 = objects.iter().map(|(_, _, size, _)| size).sum();
        let mut stats = PruneStats::default();

        objects.sort_by_key(|(_, _, _, mtime)| *mtime);
        for (hash, path, size, _) in objects {
            if total <= max_bytes {
                break;
            }
            if let Err(e) = fs::remove_file(&path) {
                warn!(hash = %hash.short(), error = %e, "failed to evict object");
                continue;
            }
            self.memory.invalidate(&hash);
            total -= size;
            stats.removed += 1;
            stats.freed_bytes += size;
        }
        stats.remaining_bytes = total;

        if stats.removed > 0 {
            debug!(
                removed = stats.removed,
                freed = stats.freed_bytes,
                "pruned content cache"
            );
        }
        Ok(stats)
    }
}

/// Record a read by bumping the mtime; failures only degrade eviction order.
fn touch(path: &Path) {
    if let Ok(file) = File::options().write(true).open(path) {
        let _ = file.set_modified(SystemTime::now());
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("dir", &self.dir)
            .field("memory_entries", &self.memory.entry_count())
            .finish()
    }
}
