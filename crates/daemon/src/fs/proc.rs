use std::path::PathBuf;

use common::attr::{FileInfo, FileKind};

use super::{read_all, window, Caller, DirEntry, Errno, FsResult, LoopbackFs, PathFs};

const SELF: &str = "self";

/// A `/proc` view for sandboxed tasks.
///
/// * `self` is a symlink to the calling process's pid, not the daemon's.
/// * Entries owned by the daemon's user are reported as owned by the
///   unprivileged task user.
/// * The sandbox mount prefix is removed from link targets and file
///   contents, so tasks see paths as they are on the master.
#[derive(Debug, Clone)]
pub struct ProcFs {
    host: LoopbackFs,
    strip_prefix: Option<String>,
    owner: Option<(u32, u32)>,
    daemon_uid: u32,
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Serve from another directory laid out like `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            host: LoopbackFs::new(root),
            strip_prefix: None,
            owner: None,
            // SAFETY: geteuid cannot fail.
            daemon_uid: unsafe { libc::geteuid() },
        }
    }

    /// Remove `prefix` from link targets and contents.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        self.strip_prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    /// Report daemon-owned entries as owned by `uid`/`gid`.
    pub fn remap_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    /// Resolve `self` and `self/...` against the caller's pid.
    fn resolve(path: &str, caller: &Caller) -> String {
        let path = path.trim_matches('/');
        if path == SELF {
            caller.pid.to_string()
        } else if let Some(rest) = path.strip_prefix("self/") {
            format!("{}/{}", caller.pid, rest)
        } else {
            path.to_string()
        }
    }

    fn strip(&self, text: &str) -> String {
        match &self.strip_prefix {
            Some(prefix) => {
                if text == prefix {
                    return "/".to_string();
                }
                text.replace(&format!("{}/", prefix), "/")
            }
            None => text.to_string(),
        }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl PathFs for ProcFs {
    fn get_attr(&self, path: &str, caller: &Caller) -> FsResult<FileInfo> {
        if path.trim_matches('/') == SELF {
            let target = caller.pid.to_string();
            let mut info = FileInfo::regular(0o777, target.len() as u64);
            info.kind = FileKind::Symlink;
            info.mode = libc::S_IFLNK | 0o777;
            return Ok(info);
        }

        let mut info = self.host.get_attr(&Self::resolve(path, caller), caller)?;
        if let Some((uid, gid)) = self.owner {
            if info.uid == self.daemon_uid {
                info.uid = uid;
                info.gid = gid;
            }
        }
        Ok(info)
    }

    fn read_dir(&self, path: &str, caller: &Caller) -> FsResult<Vec<DirEntry>> {
        self.host.read_dir(&Self::resolve(path, caller), caller)
    }

    fn read(&self, path: &str, offset: u64, size: u32, caller: &Caller) -> FsResult<Vec<u8>> {
        let resolved = Self::resolve(path, caller);
        if self.strip_prefix.is_none() {
            return self.host.read(&resolved, offset, size, caller);
        }
        // Proc files report size 0, so read to the end and rewrite.
        let data = read_all(&self.host, &resolved, caller)?;
        let text = String::from_utf8_lossy(&data);
        let stripped = self.strip(&text);
        Ok(window(stripped.as_bytes(), offset, size))
    }

    fn read_link(&self, path: &str, caller: &Caller) -> FsResult<String> {
        if path.trim_matches('/') == SELF {
            return Ok(caller.pid.to_string());
        }
        let target = self.host.read_link(&Self::resolve(path, caller), caller)?;
        Ok(self.strip(&target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_proc() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("42")).unwrap();
        fs::write(
            dir.path().join("42/mounts"),
            "fuse /tmp/termite-task1/mnt/dev fuse rw 0 0\n",
        )
        .unwrap();
        std::os::unix::fs::symlink("/tmp/termite-task1/mnt/src/proj", dir.path().join("42/cwd")).unwrap();
        dir
    }

    fn caller() -> Caller {
        Caller {
            uid: 1000,
            gid: 1000,
            pid: 42,
        }
    }

    #[test]
    fn test_self_is_the_caller() {
        let dir = fake_proc();
        let fs = ProcFs::with_root(dir.path());
        assert_eq!(fs.read_link("self", &caller()).unwrap(), "42");
        assert!(fs.get_attr("self", &caller()).unwrap().is_symlink());
        assert!(fs.get_attr("self/mounts", &caller()).is_ok());
    }

    #[test]
    fn test_prefix_stripped() {
        let dir = fake_proc();
        let fs = ProcFs::with_root(dir.path()).strip_prefix("/tmp/termite-task1/mnt");
        let c = caller();

        assert_eq!(fs.read_link("42/cwd", &c).unwrap(), "/src/proj");
        let mounts = fs.read("self/mounts", 0, 4096, &c).unwrap();
        assert_eq!(mounts, b"fuse /dev fuse rw 0 0\n");
        assert_eq!(fs.read("42/mounts", 5, 4, &c).unwrap(), b"/dev");
    }

    #[test]
    fn test_owner_remapped() {
        let dir = fake_proc();
        let fs = ProcFs::with_root(dir.path()).remap_owner(65534, 65534);
        let info = fs.get_attr("42", &caller()).unwrap();
        assert_eq!(info.uid, 65534);
        assert_eq!(info.gid, 65534);
    }

    #[test]
    fn test_writes_refused() {
        let dir = fake_proc();
        let fs = ProcFs::with_root(dir.path());
        assert_eq!(fs.write("42/mounts", 0, b"x", &caller()), Err(Errno::ROFS));
    }
}
