use std::fs::{self, DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use common::attr::{FileInfo, FileKind};

use super::{Caller, DirEntry, Errno, FsResult, PathFs};

/// Passthrough to a local directory.
#[derive(Debug, Clone)]
pub struct LoopbackFs {
    root: PathBuf,
}

impl LoopbackFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path backing `path`.
    pub fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

fn kind_of(ft: fs::FileType) -> FileKind {
    if ft.is_file() {
        FileKind::Regular
    } else if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::Other
    }
}

impl PathFs for LoopbackFs {
    fn get_attr(&self, path: &str, _caller: &Caller) -> FsResult<FileInfo> {
        let meta = fs::symlink_metadata(self.full_path(path))?;
        Ok(FileInfo::from_metadata(&meta))
    }

    fn read_dir(&self, path: &str, _caller: &Caller) -> FsResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.full_path(path))? {
            let entry = entry?;
            let kind = entry.file_type().map(kind_of).unwrap_or(FileKind::Other);
            entries.push(DirEntry::new(entry.file_name().to_string_lossy(), kind));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, path: &str, offset: u64, size: u32, _caller: &Caller) -> FsResult<Vec<u8>> {
        let file = File::open(self.full_path(path))?;
        read_at(&file, offset, size)
    }

    fn read_link(&self, path: &str, _caller: &Caller) -> FsResult<String> {
        let target = fs::read_link(self.full_path(path))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn write(&self, path: &str, offset: u64, data: &[u8], _caller: &Caller) -> FsResult<u32> {
        let file = OpenOptions::new().write(true).open(self.full_path(path))?;
        file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    fn create(&self, path: &str, mode: u32, _caller: &Caller) -> FsResult<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode & 0o7777)
            .open(self.full_path(path))?;
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u32, _caller: &Caller) -> FsResult<()> {
        DirBuilder::new()
            .mode(mode & 0o7777)
            .create(self.full_path(path))?;
        Ok(())
    }

    fn unlink(&self, path: &str, _caller: &Caller) -> FsResult<()> {
        fs::remove_file(self.full_path(path))?;
        Ok(())
    }

    fn rmdir(&self, path: &str, _caller: &Caller) -> FsResult<()> {
        fs::remove_dir(self.full_path(path))?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str, _caller: &Caller) -> FsResult<()> {
        fs::rename(self.full_path(from), self.full_path(to))?;
        Ok(())
    }

    fn symlink(&self, target: &str, path: &str, _caller: &Caller) -> FsResult<()> {
        std::os::unix::fs::symlink(target, self.full_path(path))?;
        Ok(())
    }

    fn truncate(&self, path: &str, size: u64, _caller: &Caller) -> FsResult<()> {
        let file = OpenOptions::new().write(true).open(self.full_path(path))?;
        file.set_len(size)?;
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32, _caller: &Caller) -> FsResult<()> {
        fs::set_permissions(self.full_path(path), fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }
}

/// Fill up to `size` bytes from `offset`, stopping early only at end of file.
pub(crate) fn read_at(file: &File, offset: u64, size: u32) -> FsResult<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Errno::from(e)),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let fs = LoopbackFs::new(dir.path());
        let caller = Caller::default();

        fs.mkdir("sub", 0o755, &caller).unwrap();
        fs.create("sub/a.txt", 0o644, &caller).unwrap();
        assert_eq!(fs.write("sub/a.txt", 0, b"hello", &caller).unwrap(), 5);
        assert_eq!(fs.read("sub/a.txt", 1, 3, &caller).unwrap(), b"ell");
        assert_eq!(fs.read("sub/a.txt", 0, 100, &caller).unwrap(), b"hello");

        let info = fs.get_attr("sub/a.txt", &caller).unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.perm() & 0o644, 0o644);

        let names: Vec<_> = fs
            .read_dir("", &caller)
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(names, vec![("sub".to_string(), FileKind::Directory)]);
    }

    #[test]
    fn test_missing_path_is_enoent() {
        let dir = TempDir::new().unwrap();
        let fs = LoopbackFs::new(dir.path());
        assert_eq!(
            fs.get_attr("nope", &Caller::default()).unwrap_err(),
            Errno::NOENT
        );
    }

    #[test]
    fn test_rename_truncate_symlink() {
        let dir = TempDir::new().unwrap();
        let fs = LoopbackFs::new(dir.path());
        let caller = Caller::default();

        fs.create("a", 0o644, &caller).unwrap();
        fs.write("a", 0, b"abcdef", &caller).unwrap();
        fs.truncate("a", 2, &caller).unwrap();
        fs.rename("a", "b", &caller).unwrap();
        assert_eq!(fs.read("b", 0, 10, &caller).unwrap(), b"ab");

        fs.symlink("b", "link", &caller).unwrap();
        assert_eq!(fs.read_link("link", &caller).unwrap(), "b");
        assert!(fs.get_attr("link", &caller).unwrap().is_symlink());
    }
}
