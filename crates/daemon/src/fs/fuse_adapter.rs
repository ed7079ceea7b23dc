//! Kernel-facing FUSE bridge for any [`PathFs`].

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    BackgroundSession, FileType, KernelConfig, MountOption, Notifier, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, Session,
    TimeOrNow,
};
use parking_lot::Mutex;

use common::attr::{FileInfo, FileKind};

use super::{Caller, Errno, FsResult, InodeTable, Invalidation, PathFs};

/// Mount-time knobs.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// How long the kernel may cache entries and attributes.
    pub attr_ttl: Duration,
    /// Outstanding background requests the kernel may queue.
    pub max_background: u16,
    /// Let other users (the task user) into the mount. Needs root.
    pub allow_other: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: Duration::from_secs(30),
            max_background: 4,
            // SAFETY: geteuid cannot fail.
            allow_other: unsafe { libc::geteuid() } == 0,
        }
    }
}

/// Adapts a [`PathFs`] to [`fuser::Filesystem`].
pub struct FuseFs {
    fs: Arc<dyn PathFs>,
    inodes: Arc<Mutex<InodeTable>>,
    ttl: Duration,
    max_background: u16,
    debug: Arc<AtomicBool>,
    next_fh: AtomicU64,
}

impl FuseFs {
    pub fn new(fs: Arc<dyn PathFs>, config: &MountConfig) -> Self {
        Self {
            fs,
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            ttl: config.attr_ttl,
            max_background: config.max_background,
            debug: Arc::new(AtomicBool::new(false)),
            next_fh: AtomicU64::new(1),
        }
    }

    fn path(&self, ino: u64) -> FsResult<String> {
        self.inodes
            .lock()
            .path(ino)
            .map(str::to_string)
            .ok_or(Errno::NOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> FsResult<String> {
        let name = name.to_str().ok_or(Errno::INVAL)?;
        self.inodes.lock().child_path(parent, name).ok_or(Errno::NOENT)
    }

    fn trace(&self, op: &str, path: &str) {
        if self.debug.load(Ordering::Relaxed) {
            tracing::info!(op, path, "fuse call");
        } else {
            tracing::trace!(op, path, "fuse call");
        }
    }

    /// Stat `path` and hand out its inode.
    fn entry(&self, path: &str, caller: &Caller) -> FsResult<fuser::FileAttr> {
        let info = self.fs.get_attr(path, caller)?;
        let ino = self.inodes.lock().lookup(path);
        Ok(to_fuse_attr(ino, &info))
    }

    fn attr_of(&self, ino: u64, caller: &Caller) -> FsResult<fuser::FileAttr> {
        let path = self.path(ino)?;
        let info = self.fs.get_attr(&path, caller)?;
        Ok(to_fuse_attr(ino, &info))
    }

    fn reply_entry(&self, result: FsResult<fuser::FileAttr>, reply: ReplyEntry) {
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.code()),
        }
    }
}

fn caller_of(req: &Request<'_>) -> Caller {
    Caller {
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular | FileKind::Other => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

fn to_fuse_attr(ino: u64, info: &FileInfo) -> fuser::FileAttr {
    let mtime = if info.mtime >= 0 {
        UNIX_EPOCH + Duration::new(info.mtime as u64, info.mtime_nsec)
    } else {
        UNIX_EPOCH - Duration::from_secs(info.mtime.unsigned_abs())
    };
    fuser::FileAttr {
        ino,
        size: info.size,
        blocks: info.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: file_type(info.kind),
        perm: info.perm() as u16,
        nlink: if info.is_dir() { 2 } else { 1 },
        uid: info.uid,
        gid: info.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

impl fuser::Filesystem for FuseFs {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        if let Err(nearest) = config.set_max_background(self.max_background) {
            tracing::debug!(nearest, "kernel rejected max_background");
        }
        Ok(())
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self
            .child(parent, name)
            .and_then(|path| self.entry(&path, &caller_of(req)));
        self.reply_entry(result, reply);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.attr_of(ino, &caller_of(req)) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.code()),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let caller = caller_of(req);
        let result = self.path(ino).and_then(|path| {
            self.trace("setattr", &path);
            if let Some(mode) = mode {
                self.fs.chmod(&path, mode, &caller)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&path, size, &caller)?;
            }
            self.attr_of(ino, &caller)
        });
        match result {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.code()),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self
            .path(ino)
            .and_then(|path| self.fs.read_link(&path, &caller_of(req)))
        {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.code()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let caller = caller_of(req);
        let result = self.child(parent, name).and_then(|path| {
            self.trace("mkdir", &path);
            self.fs.mkdir(&path, mode & !umask, &caller)?;
            self.entry(&path, &caller)
        });
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child(parent, name).and_then(|path| {
            self.trace("unlink", &path);
            self.fs.unlink(&path, &caller_of(req))?;
            self.inodes.lock().remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child(parent, name).and_then(|path| {
            self.trace("rmdir", &path);
            self.fs.rmdir(&path, &caller_of(req))?;
            self.inodes.lock().remove(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let caller = caller_of(req);
        let result = self.child(parent, link_name).and_then(|path| {
            let target = target.to_str().ok_or(Errno::INVAL)?;
            self.trace("symlink", &path);
            self.fs.symlink(target, &path, &caller)?;
            self.entry(&path, &caller)
        });
        self.reply_entry(result, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.child(parent, name).and_then(|from| {
            let to = self.child(newparent, newname)?;
            self.trace("rename", &from);
            self.fs.rename(&from, &to, &caller_of(req))?;
            self.inodes.lock().rename(&from, &to);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.code()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let caller = caller_of(req);
        let result = self.path(ino).and_then(|path| {
            let info = self.fs.get_attr(&path, &caller)?;
            if info.is_dir() {
                return Err(Errno::ISDIR);
            }
            if flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY {
                self.fs.truncate(&path, 0, &caller)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.opened(self.next_fh.fetch_add(1, Ordering::Relaxed), 0),
            Err(e) => reply.error(e.code()),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result = self.path(ino).and_then(|path| {
            let offset = u64::try_from(offset).map_err(|_| Errno::INVAL)?;
            self.fs.read(&path, offset, size, &caller_of(req))
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.code()),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result = self.path(ino).and_then(|path| {
            let offset = u64::try_from(offset).map_err(|_| Errno::INVAL)?;
            self.fs.write(&path, offset, data, &caller_of(req))
        });
        match result {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.code()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let caller = caller_of(req);
        let result = self.child(parent, name).and_then(|path| {
            self.trace("create", &path);
            self.fs.create(&path, mode & !umask, &caller)?;
            self.entry(&path, &caller)
        });
        match result {
            Ok(attr) => {
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                reply.created(&self.ttl, &attr, 0, fh, 0)
            }
            Err(e) => reply.error(e.code()),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e.code()),
        };
        let entries = match self.fs.read_dir(&path, &caller_of(req)) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.code()),
        };

        let mut listing = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        {
            let mut inodes = self.inodes.lock();
            for entry in entries {
                let child = inodes.lookup(&common::paths::join_relative(&path, &entry.name));
                listing.push((child, file_type(entry.kind), entry.name));
            }
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (child, kind, name)) in listing.into_iter().enumerate().skip(skip) {
            if reply.add(child, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// A live mount running on a background thread. Dropping it unmounts.
pub struct FuseMount {
    session: BackgroundSession,
    notifier: Notifier,
    inodes: Arc<Mutex<InodeTable>>,
    debug: Arc<AtomicBool>,
}

impl FuseMount {
    /// Drop kernel caches for a changed path. Paths the kernel never
    /// looked up have nothing cached and are skipped.
    pub fn invalidate(&self, invalidation: &Invalidation) {
        let result = match invalidation {
            Invalidation::Content(path) => {
                let Some(ino) = self.inodes.lock().inode(path) else {
                    return;
                };
                self.notifier.inval_inode(ino, 0, 0)
            }
            Invalidation::Entry { parent, name } => {
                let Some(parent_ino) = self.inodes.lock().inode(parent) else {
                    return;
                };
                self.inodes
                    .lock()
                    .remove(&common::paths::join_relative(parent, name));
                self.notifier.inval_entry(parent_ino, OsStr::new(name))
            }
        };
        // ENOENT only means the kernel had already forgotten the entry.
        if let Err(e) = result {
            if e.raw_os_error() != Some(libc::ENOENT) {
                tracing::warn!(?invalidation, error = %e, "kernel cache invalidation failed");
            }
        }
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
    }

    pub fn unmount(self) {
        drop(self.session);
    }
}

impl std::fmt::Debug for FuseMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseMount")
            .field("inodes", &self.inodes.lock().len())
            .finish()
    }
}

/// Mount `fs` at `at` and serve it from a background thread.
pub fn mount(fs: FuseFs, at: &Path, config: &MountConfig) -> io::Result<FuseMount> {
    let mut options = vec![
        MountOption::FSName("termite".to_string()),
        MountOption::Subtype("termite".to_string()),
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }

    let inodes = fs.inodes.clone();
    let debug = fs.debug.clone();
    let session = Session::new(fs, at, &options)?;
    let notifier = session.notifier();
    let session = session.spawn()?;
    tracing::debug!(mountpoint = %at.display(), "fuse filesystem mounted");

    Ok(FuseMount {
        session,
        notifier,
        inodes,
        debug,
    })
}
