use common::attr::{FileInfo, FileKind};

use super::{Caller, DirEntry, Errno, FsResult, PathFs};

const NULL: &str = "null";

/// A synthetic `/dev` holding only `null`.
///
/// Writes to `null` are accepted and discarded, reads return nothing. The
/// host's device tree is never touched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevNullFs;

impl DevNullFs {
    pub fn new() -> Self {
        Self
    }

    fn check_null(path: &str) -> FsResult<()> {
        match path.trim_matches('/') {
            NULL => Ok(()),
            "" => Err(Errno::ISDIR),
            _ => Err(Errno::NOENT),
        }
    }
}

impl PathFs for DevNullFs {
    fn get_attr(&self, path: &str, _caller: &Caller) -> FsResult<FileInfo> {
        match path.trim_matches('/') {
            "" => Ok(FileInfo::directory(0o755)),
            NULL => Ok(FileInfo::regular(0o666, 0)),
            _ => Err(Errno::NOENT),
        }
    }

    fn read_dir(&self, path: &str, _caller: &Caller) -> FsResult<Vec<DirEntry>> {
        match path.trim_matches('/') {
            "" => Ok(vec![DirEntry::new(NULL, FileKind::Regular)]),
            NULL => Err(Errno::NOTDIR),
            _ => Err(Errno::NOENT),
        }
    }

    fn read(&self, path: &str, _offset: u64, _size: u32, _caller: &Caller) -> FsResult<Vec<u8>> {
        Self::check_null(path)?;
        Ok(Vec::new())
    }

    fn write(&self, path: &str, _offset: u64, data: &[u8], _caller: &Caller) -> FsResult<u32> {
        Self::check_null(path)?;
        Ok(data.len() as u32)
    }

    // Opening with O_TRUNC truncates first.
    fn truncate(&self, path: &str, _size: u64, _caller: &Caller) -> FsResult<()> {
        Self::check_null(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_is_empty() {
        let fs = DevNullFs::new();
        let caller = Caller::default();

        assert_eq!(fs.write("null", 0, b"ignored", &caller).unwrap(), 7);
        fs.truncate("null", 0, &caller).unwrap();
        assert!(fs.read("null", 0, 4096, &caller).unwrap().is_empty());
    }

    #[test]
    fn test_lists_only_null() {
        let fs = DevNullFs::new();
        let caller = Caller::default();
        let entries = fs.read_dir("", &caller).unwrap();
        assert_eq!(entries, vec![DirEntry::new("null", FileKind::Regular)]);
        assert_eq!(fs.get_attr("zero", &caller), Err(Errno::NOENT));
        assert_eq!(fs.write("zero", 0, b"x", &caller), Err(Errno::NOENT));
        assert_eq!(fs.create("zero", 0o644, &caller), Err(Errno::ROFS));
    }
}
