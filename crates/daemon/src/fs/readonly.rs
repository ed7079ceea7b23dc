use std::sync::Arc;

use common::attr::FileInfo;

use super::{Caller, DirEntry, FsResult, PathFs};

/// Lookups pass through to the wrapped filesystem; writes fail with `EROFS`.
#[derive(Clone)]
pub struct ReadonlyFs {
    inner: Arc<dyn PathFs>,
}

impl ReadonlyFs {
    pub fn new(inner: Arc<dyn PathFs>) -> Self {
        Self { inner }
    }
}

impl PathFs for ReadonlyFs {
    fn get_attr(&self, path: &str, caller: &Caller) -> FsResult<FileInfo> {
        self.inner.get_attr(path, caller)
    }

    fn read_dir(&self, path: &str, caller: &Caller) -> FsResult<Vec<DirEntry>> {
        self.inner.read_dir(path, caller)
    }

    fn read(&self, path: &str, offset: u64, size: u32, caller: &Caller) -> FsResult<Vec<u8>> {
        self.inner.read(path, offset, size, caller)
    }

    fn read_link(&self, path: &str, caller: &Caller) -> FsResult<String> {
        self.inner.read_link(path, caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Errno, LoopbackFs};

    #[test]
    fn test_reads_pass_writes_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();
        let fs = ReadonlyFs::new(Arc::new(LoopbackFs::new(dir.path())));
        let caller = Caller::default();

        assert_eq!(fs.read("f", 0, 10, &caller).unwrap(), b"data");
        assert_eq!(fs.write("f", 0, b"x", &caller), Err(Errno::ROFS));
        assert_eq!(fs.unlink("f", &caller), Err(Errno::ROFS));
        assert!(dir.path().join("f").exists());
    }
}
