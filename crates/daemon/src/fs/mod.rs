//! Path-level filesystems composed into a task sandbox.
//!
//! Every filesystem here is addressed by paths relative to its own root: no
//! leading slash, the root itself is the empty string. A [`SwitchFs`] routes
//! each path to the filesystem mounted at its longest matching prefix, and
//! the FUSE adapter (feature `fuse`) exposes the result to the kernel.
//!
//! Failures are plain errno values. Every write operation defaults to
//! `EROFS`, so read-only filesystems only implement the lookups.

use std::fmt;
use std::io;

use common::attr::{FileInfo, FileKind};

mod devnull;
#[cfg(feature = "fuse")]
mod fuse_adapter;
mod inode_table;
mod loopback;
mod proc;
mod readonly;
mod rpc_fs;
mod switch;
mod union;

pub use devnull::DevNullFs;
#[cfg(feature = "fuse")]
pub use fuse_adapter::{mount, FuseFs, FuseMount, MountConfig};
pub use inode_table::InodeTable;
pub use loopback::LoopbackFs;
pub use proc::ProcFs;
pub use readonly::ReadonlyFs;
pub use rpc_fs::{Invalidation, RpcFs, RpcFsStats};
pub use switch::{Route, SwitchFs};
pub use union::{UnionFs, DELETIONS_DIR};

/// An errno value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const NOENT: Errno = Errno(libc::ENOENT);
    pub const IO: Errno = Errno(libc::EIO);
    pub const ROFS: Errno = Errno(libc::EROFS);
    pub const INVAL: Errno = Errno(libc::EINVAL);
    pub const ISDIR: Errno = Errno(libc::EISDIR);
    pub const NOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const NOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    pub const EXIST: Errno = Errno(libc::EEXIST);
    pub const XDEV: Errno = Errno(libc::EXDEV);

    pub fn code(self) -> i32 {
        self.0
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

pub type FsResult<T> = Result<T, Errno>;

/// Identity of the process making a filesystem call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl Caller {
    /// The current process, for calls that do not come from the kernel.
    pub fn current() -> Self {
        // SAFETY: these calls cannot fail and touch no memory.
        unsafe {
            Self {
                uid: libc::geteuid(),
                gid: libc::getegid(),
                pid: libc::getpid() as u32,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A filesystem addressed by relative path.
#[allow(unused_variables)]
pub trait PathFs: Send + Sync {
    fn get_attr(&self, path: &str, caller: &Caller) -> FsResult<FileInfo>;

    fn read_dir(&self, path: &str, caller: &Caller) -> FsResult<Vec<DirEntry>>;

    /// Up to `size` bytes starting at `offset`; short at end of file.
    fn read(&self, path: &str, offset: u64, size: u32, caller: &Caller) -> FsResult<Vec<u8>>;

    fn read_link(&self, path: &str, caller: &Caller) -> FsResult<String> {
        Err(Errno::INVAL)
    }

    /// Returns the number of bytes written.
    fn write(&self, path: &str, offset: u64, data: &[u8], caller: &Caller) -> FsResult<u32> {
        Err(Errno::ROFS)
    }

    /// Create an empty regular file.
    fn create(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        Err(Errno::ROFS)
    }

    fn mkdir(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        Err(Errno::ROFS)
    }

    fn unlink(&self, path: &str, caller: &Caller) -> FsResult<()> {
        Err(Errno::ROFS)
    }

    fn rmdir(&self, path: &str, caller: &Caller) -> FsResult<()> {
        Err(Errno::ROFS)
    }

    fn rename(&self, from: &str, to: &str, caller: &Caller) -> FsResult<()> {
        Err(Errno::ROFS)
    }

    fn symlink(&self, target: &str, path: &str, caller: &Caller) -> FsResult<()> {
        Err(Errno::ROFS)
    }

    fn truncate(&self, path: &str, size: u64, caller: &Caller) -> FsResult<()> {
        Err(Errno::ROFS)
    }

    fn chmod(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        Err(Errno::ROFS)
    }
}

/// Read a whole file through [`PathFs::read`], chunk by chunk.
pub fn read_all(fs: &dyn PathFs, path: &str, caller: &Caller) -> FsResult<Vec<u8>> {
    const CHUNK: u32 = 128 * 1024;
    let mut out = Vec::new();
    loop {
        let chunk = fs.read(path, out.len() as u64, CHUNK, caller)?;
        let done = chunk.len() < CHUNK as usize;
        out.extend_from_slice(&chunk);
        if done {
            return Ok(out);
        }
    }
}

/// Slice `[offset, offset + size)` out of `data`, clamped to its length.
pub(crate) fn window(data: &[u8], offset: u64, size: u32) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end = start.saturating_add(size as usize).min(data.len());
    data[start..end].to_vec()
}
