//! File attribute snapshots exchanged between master and worker.

use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;

use serde::{Deserialize, Serialize};

use content_cache::ContentHash;

use crate::paths;

/// Coarse file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Metadata of one path, independent of the machine it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub kind: FileKind,
    pub size: u64,
    /// Permission bits plus file type bits, as in `st_mode`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub mtime_nsec: u32,
}

impl FileInfo {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        let kind = if ft.is_file() {
            FileKind::Regular
        } else if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Other
        };
        Self {
            kind,
            size: meta.size(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec().clamp(0, 999_999_999) as u32,
        }
    }

    /// A synthetic directory entry.
    pub fn directory(perm: u32) -> Self {
        Self {
            kind: FileKind::Directory,
            size: 0,
            mode: libc::S_IFDIR | (perm & 0o7777),
            uid: 0,
            gid: 0,
            mtime: 0,
            mtime_nsec: 0,
        }
    }

    /// A synthetic regular file.
    pub fn regular(perm: u32, size: u64) -> Self {
        Self {
            kind: FileKind::Regular,
            size,
            mode: libc::S_IFREG | (perm & 0o7777),
            uid: 0,
            gid: 0,
            mtime: 0,
            mtime_nsec: 0,
        }
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Permission bits only.
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Whether two snapshots describe the same file state.
    pub fn same_state(&self, other: &FileInfo) -> bool {
        self.kind == other.kind
            && self.size == other.size
            && self.mode == other.mode
            && self.mtime == other.mtime
            && self.mtime_nsec == other.mtime_nsec
    }
}

/// Outcome of resolving a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NotFound,
    /// Any other failure, carrying the OS error code.
    Error(i32),
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    pub fn from_io_error(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENOTDIR) => Status::NotFound,
            Some(code) => Status::Error(code),
            None if err.kind() == io::ErrorKind::NotFound => Status::NotFound,
            None => Status::Error(libc::EIO),
        }
    }

    /// errno equivalent, 0 for `Ok`.
    pub fn errno(&self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::NotFound => libc::ENOENT,
            Status::Error(code) => *code,
        }
    }
}

/// One path's metadata snapshot plus an optional content reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// `/`-prefixed path relative to the export root.
    pub path: String,
    pub info: Option<FileInfo>,
    /// Digest of the content, for regular files.
    pub hash: Option<ContentHash>,
    /// Target, for symlinks.
    pub link: Option<String>,
    pub status: Status,
}

impl FileAttr {
    /// Attribute of a path confirmed not to exist.
    pub fn not_found(path: &str) -> Self {
        Self::failed(path, Status::NotFound)
    }

    pub fn failed(path: &str, status: Status) -> Self {
        Self {
            path: paths::normalize(path),
            info: None,
            hash: None,
            link: None,
            status,
        }
    }

    /// Turn this entry into a tombstone, keeping the path.
    pub fn tombstone(&mut self) {
        self.info = None;
        self.hash = None;
        self.link = None;
        self.status = Status::NotFound;
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn is_dir(&self) -> bool {
        self.info.as_ref().is_some_and(FileInfo::is_dir)
    }
}

/// Result of listing a directory: child names only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirListing {
    pub status: Status,
    pub names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_status_from_io_error() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(Status::from_io_error(&err), Status::NotFound);

        let err = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(Status::from_io_error(&err), Status::Error(libc::EACCES));
        assert_eq!(Status::Error(libc::EACCES).errno(), libc::EACCES);
        assert_eq!(Status::Ok.errno(), 0);
    }

    #[test]
    fn test_file_info_from_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("file.txt");
        fs::write(&file, b"hello").unwrap();

        let info = FileInfo::from_metadata(&fs::symlink_metadata(&file).unwrap());
        assert!(info.is_regular());
        assert_eq!(info.size, 5);

        let info = FileInfo::from_metadata(&fs::symlink_metadata(dir.path()).unwrap());
        assert!(info.is_dir());
    }

    #[test]
    fn test_tombstone_keeps_path() {
        let mut attr = FileAttr {
            path: "/a/b".into(),
            info: Some(FileInfo::regular(0o644, 3)),
            hash: Some(ContentHash::from_data(b"abc")),
            link: None,
            status: Status::Ok,
        };
        attr.tombstone();
        assert_eq!(attr.path, "/a/b");
        assert!(!attr.is_ok());
        assert!(attr.hash.is_none());
    }
}
