//! Copy-on-write overlay of a local writable directory over a read-only
//! filesystem.
//!
//! Reads prefer the writable branch. Modifying a file that only exists in
//! the read-only branch first copies it up. Removing something the read-only
//! branch still has records a marker file in a hidden [`DELETIONS_DIR`]
//! directory of the writable branch, so the removal survives restarts of the
//! overlay and cache drops.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;

use common::attr::{FileInfo, FileKind};
use common::paths;
use content_cache::ContentHash;

use super::{read_all, Caller, DirEntry, Errno, FsResult, LoopbackFs, PathFs};

/// Name of the marker directory at the root of the writable branch.
pub const DELETIONS_DIR: &str = "DELETIONS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    Writable,
    ReadOnly,
    Absent,
}

pub struct UnionFs {
    rw: LoopbackFs,
    ro: Arc<dyn PathFs>,
    branches: Cache<String, Branch>,
    /// Deleted paths, loaded lazily from the marker directory.
    deletions: Mutex<Option<HashSet<String>>>,
}

fn key(path: &str) -> String {
    paths::relative(path).to_string()
}

fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

impl UnionFs {
    /// Overlay `rw_root` over `ro`. Branch lookups are cached for
    /// `branch_ttl`.
    pub fn new(rw_root: impl Into<PathBuf>, ro: Arc<dyn PathFs>, branch_ttl: Duration) -> std::io::Result<Self> {
        let rw = LoopbackFs::new(rw_root);
        fs::create_dir_all(rw.full_path(DELETIONS_DIR))?;
        Ok(Self {
            rw,
            ro,
            branches: Cache::builder()
                .time_to_live(branch_ttl)
                .max_capacity(100_000)
                .build(),
            deletions: Mutex::new(None),
        })
    }

    pub fn writable(&self) -> &LoopbackFs {
        &self.rw
    }

    /// Forget cached branch decisions for `paths`.
    pub fn drop_branch_cache(&self, paths: &[String]) {
        for path in paths {
            self.branches.invalidate(&key(path));
        }
    }

    /// Forget the loaded deletion set; it is re-read from disk on next use.
    pub fn drop_deletion_cache(&self) {
        *self.deletions.lock() = None;
    }

    fn marker_path(&self, path: &str) -> PathBuf {
        let name = ContentHash::from_data(path.as_bytes());
        self.rw.full_path(DELETIONS_DIR).join(name.as_str())
    }

    fn load_deletions(&self) -> HashSet<String> {
        let dir = self.rw.full_path(DELETIONS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot read deletion markers");
                return HashSet::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| fs::read_to_string(entry.path()).ok())
            .collect()
    }

    fn with_deletions<R>(&self, f: impl FnOnce(&mut HashSet<String>) -> R) -> R {
        let mut guard = self.deletions.lock();
        let set = guard.get_or_insert_with(|| self.load_deletions());
        f(set)
    }

    /// Whether `path` or one of its ancestors was deleted.
    fn is_deleted(&self, path: &str) -> bool {
        self.with_deletions(|set| {
            set.contains(path) || ancestors(path).any(|a| set.contains(a))
        })
    }

    fn mark_deleted(&self, path: &str) -> FsResult<()> {
        fs::write(self.marker_path(path), path.as_bytes())?;
        self.with_deletions(|set| set.insert(path.to_string()));
        Ok(())
    }

    fn clear_deleted(&self, path: &str) -> FsResult<()> {
        match fs::remove_file(self.marker_path(path)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.with_deletions(|set| set.remove(path));
        Ok(())
    }

    fn is_hidden(path: &str) -> bool {
        paths::has_dir_prefix(path, DELETIONS_DIR)
    }

    fn branch(&self, path: &str, caller: &Caller) -> Branch {
        if Self::is_hidden(path) {
            return Branch::Absent;
        }
        if let Some(branch) = self.branches.get(path) {
            return branch;
        }

        let branch = if self.rw.get_attr(path, caller).is_ok() {
            Branch::Writable
        } else if self.is_deleted(path) {
            Branch::Absent
        } else if self.ro.get_attr(path, caller).is_ok() {
            Branch::ReadOnly
        } else {
            Branch::Absent
        };
        self.branches.insert(path.to_string(), branch);
        branch
    }

    fn set_branch(&self, path: &str, branch: Branch) {
        self.branches.insert(path.to_string(), branch);
    }

    fn ro_has(&self, path: &str, caller: &Caller) -> bool {
        self.ro.get_attr(path, caller).is_ok()
    }

    /// Make sure every ancestor directory of `path` exists in the writable
    /// branch, creating them with their overlay permissions.
    fn promote_parents(&self, path: &str, caller: &Caller) -> FsResult<()> {
        let parent = paths::relative(&paths::parent(path)).to_string();
        if !parent.is_empty() {
            let info = self.get_attr(&parent, caller)?;
            if !info.is_dir() {
                return Err(Errno::NOTDIR);
            }
        }
        for dir in ancestors(path) {
            if self.rw.get_attr(dir, caller).is_ok() {
                continue;
            }
            let perm = self.get_attr(dir, caller)?.perm();
            // Writable so the overlay can fill it.
            self.rw.mkdir(dir, perm | 0o700, caller)?;
            self.set_branch(dir, Branch::Writable);
        }
        Ok(())
    }

    fn copy_up(&self, path: &str, caller: &Caller) -> FsResult<()> {
        match self.branch(path, caller) {
            Branch::Writable => return Ok(()),
            Branch::Absent => return Err(Errno::NOENT),
            Branch::ReadOnly => {}
        }
        self.promote_parents(path, caller)?;

        let info = self.ro.get_attr(path, caller)?;
        match info.kind {
            FileKind::Regular => {
                let data = read_all(self.ro.as_ref(), path, caller)?;
                self.rw.create(path, info.perm() | 0o200, caller)?;
                self.rw.write(path, 0, &data, caller)?;
                if info.perm() & 0o200 == 0 {
                    self.rw.chmod(path, info.perm(), caller)?;
                }
            }
            FileKind::Directory => self.rw.mkdir(path, info.perm() | 0o700, caller)?,
            FileKind::Symlink => {
                let target = self.ro.read_link(path, caller)?;
                self.rw.symlink(&target, path, caller)?;
            }
            FileKind::Other => return Err(Errno(libc::EPERM)),
        }
        tracing::trace!(path, "copied up");
        self.set_branch(path, Branch::Writable);
        Ok(())
    }

    fn copy_up_tree(&self, path: &str, caller: &Caller) -> FsResult<()> {
        self.copy_up(path, caller)?;
        if self.rw.get_attr(path, caller)?.is_dir() {
            for entry in self.read_dir(path, caller)? {
                self.copy_up_tree(&paths::join_relative(path, &entry.name), caller)?;
            }
        }
        Ok(())
    }

    fn ensure_absent(&self, path: &str, caller: &Caller) -> FsResult<()> {
        match self.branch(path, caller) {
            Branch::Absent => Ok(()),
            _ => Err(Errno::EXIST),
        }
    }
}

impl PathFs for UnionFs {
    fn get_attr(&self, path: &str, caller: &Caller) -> FsResult<FileInfo> {
        let path = key(path);
        match self.branch(&path, caller) {
            Branch::Writable => self.rw.get_attr(&path, caller),
            Branch::ReadOnly => self.ro.get_attr(&path, caller),
            Branch::Absent => Err(Errno::NOENT),
        }
    }

    fn read_dir(&self, path: &str, caller: &Caller) -> FsResult<Vec<DirEntry>> {
        let path = key(path);
        if self.branch(&path, caller) == Branch::Absent {
            return Err(Errno::NOENT);
        }

        let mut merged = BTreeMap::new();
        if !self.is_deleted(&path) {
            if let Ok(entries) = self.ro.read_dir(&path, caller) {
                for entry in entries {
                    merged.insert(entry.name, entry.kind);
                }
            }
        }
        if let Ok(entries) = self.rw.read_dir(&path, caller) {
            for entry in entries {
                merged.insert(entry.name, entry.kind);
            }
        }

        let entries = merged
            .into_iter()
            .filter(|(name, _)| {
                let child = paths::join_relative(&path, name);
                !Self::is_hidden(&child) && !self.is_deleted(&child)
            })
            .map(|(name, kind)| DirEntry::new(name, kind))
            .collect();
        Ok(entries)
    }

    fn read(&self, path: &str, offset: u64, size: u32, caller: &Caller) -> FsResult<Vec<u8>> {
        let path = key(path);
        match self.branch(&path, caller) {
            Branch::Writable => self.rw.read(&path, offset, size, caller),
            Branch::ReadOnly => self.ro.read(&path, offset, size, caller),
            Branch::Absent => Err(Errno::NOENT),
        }
    }

    fn read_link(&self, path: &str, caller: &Caller) -> FsResult<String> {
        let path = key(path);
        match self.branch(&path, caller) {
            Branch::Writable => self.rw.read_link(&path, caller),
            Branch::ReadOnly => self.ro.read_link(&path, caller),
            Branch::Absent => Err(Errno::NOENT),
        }
    }

    fn write(&self, path: &str, offset: u64, data: &[u8], caller: &Caller) -> FsResult<u32> {
        let path = key(path);
        self.copy_up(&path, caller)?;
        self.rw.write(&path, offset, data, caller)
    }

    fn create(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        let path = key(path);
        self.promote_parents(&path, caller)?;
        self.rw.create(&path, mode, caller)?;
        self.clear_deleted(&path)?;
        self.set_branch(&path, Branch::Writable);
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        let path = key(path);
        self.ensure_absent(&path, caller)?;
        self.promote_parents(&path, caller)?;

        let was_deleted = self.is_deleted(&path);
        self.rw.mkdir(&path, mode, caller)?;
        self.clear_deleted(&path)?;
        if was_deleted {
            // A fresh directory must not resurrect the old one's children.
            if let Ok(entries) = self.ro.read_dir(&path, caller) {
                for entry in entries {
                    self.mark_deleted(&paths::join_relative(&path, &entry.name))?;
                }
            }
        }
        self.set_branch(&path, Branch::Writable);
        Ok(())
    }

    fn unlink(&self, path: &str, caller: &Caller) -> FsResult<()> {
        let path = key(path);
        let branch = self.branch(&path, caller);
        if branch == Branch::Absent {
            return Err(Errno::NOENT);
        }
        if self.get_attr(&path, caller)?.is_dir() {
            return Err(Errno::ISDIR);
        }
        if branch == Branch::Writable {
            self.rw.unlink(&path, caller)?;
        }
        if self.ro_has(&path, caller) {
            self.mark_deleted(&path)?;
        }
        self.set_branch(&path, Branch::Absent);
        Ok(())
    }

    fn rmdir(&self, path: &str, caller: &Caller) -> FsResult<()> {
        let path = key(path);
        let branch = self.branch(&path, caller);
        if branch == Branch::Absent {
            return Err(Errno::NOENT);
        }
        if !self.get_attr(&path, caller)?.is_dir() {
            return Err(Errno::NOTDIR);
        }
        if !self.read_dir(&path, caller)?.is_empty() {
            return Err(Errno::NOTEMPTY);
        }
        if branch == Branch::Writable {
            self.rw.rmdir(&path, caller)?;
        }
        if self.ro_has(&path, caller) {
            self.mark_deleted(&path)?;
        }
        self.set_branch(&path, Branch::Absent);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str, caller: &Caller) -> FsResult<()> {
        let (from, to) = (key(from), key(to));
        let info = self.get_attr(&from, caller)?;
        if info.is_dir() {
            self.copy_up_tree(&from, caller)?;
        } else {
            self.copy_up(&from, caller)?;
        }
        self.promote_parents(&to, caller)?;

        self.rw.rename(&from, &to, caller)?;
        self.clear_deleted(&to)?;
        if self.ro_has(&from, caller) {
            self.mark_deleted(&from)?;
        }
        if info.is_dir() {
            // Cached decisions below either name are stale.
            self.branches.invalidate_all();
        }
        self.set_branch(&from, Branch::Absent);
        self.set_branch(&to, Branch::Writable);
        Ok(())
    }

    fn symlink(&self, target: &str, path: &str, caller: &Caller) -> FsResult<()> {
        let path = key(path);
        self.ensure_absent(&path, caller)?;
        self.promote_parents(&path, caller)?;
        self.rw.symlink(target, &path, caller)?;
        self.clear_deleted(&path)?;
        self.set_branch(&path, Branch::Writable);
        Ok(())
    }

    fn truncate(&self, path: &str, size: u64, caller: &Caller) -> FsResult<()> {
        let path = key(path);
        self.copy_up(&path, caller)?;
        self.rw.truncate(&path, size, caller)
    }

    fn chmod(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        let path = key(path);
        self.copy_up(&path, caller)?;
        self.rw.chmod(&path, mode, caller)
    }
}
