//! One task's view of the world: the remote tree, a writable overlay and a
//! few synthetic system directories, optionally mounted with FUSE.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use common::attr::FileAttr;

use crate::fs::{
    DevNullFs, Invalidation, LoopbackFs, PathFs, ProcFs, ReadonlyFs, Route, RpcFs, SwitchFs,
    UnionFs,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Build parameters for a [`SandboxFs`].
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Parent of the per-sandbox temp area.
    pub tmp_dir: PathBuf,
    /// Relative path under which tasks may write.
    pub writable_root: String,
    /// Owner reported for daemon-owned `/proc` entries.
    pub nobody: Option<(u32, u32)>,
    pub branch_cache_ttl: Duration,
    pub attr_ttl: Duration,
    pub max_background: u16,
    /// Mount with FUSE. Without it the composed filesystem is only
    /// reachable through [`SandboxFs::fs`].
    pub mount: bool,
    pub proc_root: PathBuf,
    pub sys_root: PathBuf,
}

impl SandboxOptions {
    pub fn new(tmp_dir: impl Into<PathBuf>, writable_root: impl Into<String>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            writable_root: writable_root.into(),
            nobody: None,
            branch_cache_ttl: Duration::from_secs(30),
            attr_ttl: Duration::from_secs(30),
            max_background: 4,
            mount: true,
            proc_root: PathBuf::from("/proc"),
            sys_root: PathBuf::from("/sys"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to prepare sandbox directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to mount sandbox at {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mounting requires the `fuse` feature")]
    MountUnsupported,
}

/// Lifecycle position of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxState {
    Idle,
    Assigned(String),
    Destroyed,
}

fn prepare(path: PathBuf) -> Result<PathBuf, SandboxError> {
    DirBuilder::new()
        .mode(0o700)
        .create(&path)
        .map_err(|source| SandboxError::Prepare {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

/// A task sandbox. Shared between the pool and the update path, so every
/// mutable part sits behind a lock.
pub struct SandboxFs {
    id: u64,
    fs: Arc<SwitchFs>,
    union: Arc<UnionFs>,
    mount_dir: PathBuf,
    task: Mutex<Option<String>>,
    debug: AtomicBool,
    destroyed: AtomicBool,
    // Declared before `dir`: the mount must go before its mountpoint.
    #[cfg(feature = "fuse")]
    mount: Mutex<Option<crate::fs::FuseMount>>,
    dir: Mutex<Option<TempDir>>,
}

impl std::fmt::Debug for SandboxFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxFs")
            .field("id", &self.id)
            .field("mount_dir", &self.mount_dir)
            .field("task", &*self.task.lock())
            .finish()
    }
}

impl SandboxFs {
    /// Lay out a temp area and compose the routing table over `rpc_fs`.
    pub fn new(rpc_fs: Arc<RpcFs>, options: &SandboxOptions) -> Result<Self, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix("termite-task")
            .tempdir_in(&options.tmp_dir)
            .map_err(|source| SandboxError::Prepare {
                path: options.tmp_dir.clone(),
                source,
            })?;
        let rw_dir = prepare(dir.path().join("rw"))?;
        let mount_dir = prepare(dir.path().join("mnt"))?;
        let scratch_dir = prepare(dir.path().join("tmp-backingstore"))?;

        let ro: Arc<dyn PathFs> = rpc_fs;
        let union = UnionFs::new(&rw_dir, ro.clone(), options.branch_cache_ttl).map_err(
            |source| SandboxError::Prepare {
                path: rw_dir.clone(),
                source,
            },
        )?;
        let union = Arc::new(union);
        let scratch: Arc<dyn PathFs> = Arc::new(LoopbackFs::new(&scratch_dir));

        let mut proc = ProcFs::with_root(&options.proc_root)
            .strip_prefix(mount_dir.to_string_lossy().into_owned());
        if let Some((uid, gid)) = options.nobody {
            proc = proc.remap_owner(uid, gid);
        }

        let mut routes = vec![
            Route::new("", ro, false),
            Route::new(&options.writable_root, union.clone(), false),
            Route::new("var/tmp", scratch.clone(), true),
            Route::new("proc", Arc::new(proc), true),
            Route::new(
                "sys",
                Arc::new(ReadonlyFs::new(Arc::new(LoopbackFs::new(&options.sys_root)))),
                true,
            ),
            Route::new("dev", Arc::new(DevNullFs::new()), true),
        ];
        // Non-root test runs keep their temp dirs on the host's /tmp, which
        // may hold the writable root itself.
        // SAFETY: geteuid cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            routes.push(Route::new("tmp", scratch, true));
        }
        let fs = Arc::new(SwitchFs::new(routes));

        let sandbox = Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            fs,
            union,
            mount_dir,
            task: Mutex::new(None),
            debug: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            #[cfg(feature = "fuse")]
            mount: Mutex::new(None),
            dir: Mutex::new(Some(dir)),
        };
        if options.mount {
            sandbox.mount(options)?;
        }
        tracing::debug!(id = sandbox.id, mountpoint = %sandbox.mount_dir.display(), "sandbox created");
        Ok(sandbox)
    }

    #[cfg(feature = "fuse")]
    fn mount(&self, options: &SandboxOptions) -> Result<(), SandboxError> {
        use crate::fs::{FuseFs, MountConfig};

        let config = MountConfig {
            attr_ttl: options.attr_ttl,
            max_background: options.max_background,
            ..MountConfig::default()
        };
        let fs: Arc<dyn PathFs> = self.fs.clone();
        let mount = crate::fs::mount(FuseFs::new(fs, &config), &self.mount_dir, &config)
            .map_err(|source| SandboxError::Mount {
                path: self.mount_dir.clone(),
                source,
            })?;
        *self.mount.lock() = Some(mount);
        Ok(())
    }

    #[cfg(not(feature = "fuse"))]
    fn mount(&self, _options: &SandboxOptions) -> Result<(), SandboxError> {
        Err(SandboxError::MountUnsupported)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Where the sandbox is (or would be) mounted.
    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    /// The composed filesystem, usable without a mount.
    pub fn fs(&self) -> &Arc<SwitchFs> {
        &self.fs
    }

    pub fn assign(&self, task: impl Into<String>) {
        *self.task.lock() = Some(task.into());
    }

    pub fn task(&self) -> Option<String> {
        self.task.lock().clone()
    }

    /// Drop the task association and debug logging.
    pub fn clear(&self) {
        *self.task.lock() = None;
        self.set_debug(false);
    }

    pub fn set_debug(&self, debug: bool) {
        self.debug.store(debug, Ordering::Relaxed);
        #[cfg(feature = "fuse")]
        if let Some(mount) = self.mount.lock().as_ref() {
            mount.set_debug(debug);
        }
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SandboxState {
        if self.is_destroyed() {
            return SandboxState::Destroyed;
        }
        match self.task() {
            Some(task) => SandboxState::Assigned(task),
            None => SandboxState::Idle,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Forget overlay state for pushed paths and tell the kernel.
    /// `invalidations` come from the shared [`RpcFs::apply_update`].
    pub fn apply_update(&self, attrs: &[FileAttr], invalidations: &[Invalidation]) {
        let paths: Vec<String> = attrs
            .iter()
            .map(|a| common::paths::relative(&a.path).to_string())
            .collect();
        self.union.drop_branch_cache(&paths);
        self.union.drop_deletion_cache();

        #[cfg(feature = "fuse")]
        if let Some(mount) = self.mount.lock().as_ref() {
            for invalidation in invalidations {
                mount.invalidate(invalidation);
            }
        }
        #[cfg(not(feature = "fuse"))]
        let _ = invalidations;
    }

    /// Unmount and remove the temp area. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        #[cfg(feature = "fuse")]
        if let Some(mount) = self.mount.lock().take() {
            mount.unmount();
        }
        if let Some(dir) = self.dir.lock().take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(dir = %path.display(), error = %e, "failed to remove sandbox directory");
            }
        }
        tracing::debug!(id = self.id, "sandbox destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::rpc::{FsApi, RpcError};
    use common::attr::{DirListing, Status};
    use content_cache::{ContentCache, ContentHash};

    /// A remote tree holding only the empty directory `/work`.
    struct EmptyTree;

    impl FsApi for EmptyTree {
        fn get_attr(&self, path: &str) -> Result<FileAttr, RpcError> {
            if path == "/" || path == "/work" {
                let mut attr = FileAttr::not_found(path);
                attr.status = Status::Ok;
                attr.info = Some(common::attr::FileInfo::directory(0o755));
                Ok(attr)
            } else {
                Ok(FileAttr::not_found(path))
            }
        }

        fn read_dir(&self, path: &str) -> Result<DirListing, RpcError> {
            let names = if path == "/" {
                vec!["work".to_string()]
            } else {
                Vec::new()
            };
            Ok(DirListing {
                status: Status::Ok,
                names,
            })
        }

        fn fetch_content(&self, _hash: &ContentHash) -> Result<Option<Vec<u8>>, RpcError> {
            Ok(None)
        }

        fn update_files(&self, _attrs: Vec<FileAttr>) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn sandbox(tmp: &Path) -> SandboxFs {
        let cache = ContentCache::new(&tmp.join("cache")).unwrap();
        let rpc_fs = Arc::new(RpcFs::new(Arc::new(EmptyTree), cache));
        let mut options = SandboxOptions::new(tmp, "work");
        options.mount = false;
        SandboxFs::new(rpc_fs, &options).unwrap()
    }

    #[test]
    fn test_layout_and_cleanup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sb = sandbox(tmp.path());
        let area = sb.mount_dir().parent().unwrap().to_path_buf();
        assert!(area
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("termite-task"));
        assert!(area.join("rw").is_dir());
        assert!(area.join("tmp-backingstore").is_dir());

        sb.destroy();
        assert!(sb.is_destroyed());
        assert!(!area.exists());
        sb.destroy();
    }

    #[test]
    fn test_routes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sb = sandbox(tmp.path());
        let caller = crate::fs::Caller::default();
        let fs = sb.fs();

        let names: Vec<String> = fs
            .read_dir("", &caller)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        for expected in ["dev", "proc", "sys", "var", "work"] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }

        // Writable root and scratch space take writes; the rest does not.
        fs.create("work/out.o", 0o644, &caller).unwrap();
        fs.write("work/out.o", 0, b"obj", &caller).unwrap();
        fs.create("var/tmp/scratch", 0o644, &caller).unwrap();
        assert_eq!(
            fs.create("elsewhere", 0o644, &caller),
            Err(crate::fs::Errno::ROFS)
        );
        assert_eq!(fs.write("dev/null", 0, b"gone", &caller).unwrap(), 4);
    }

    #[test]
    fn test_task_label_cleared() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sb = sandbox(tmp.path());
        assert_eq!(sb.state(), SandboxState::Idle);
        sb.assign("cc -c foo.c");
        sb.set_debug(true);
        assert_eq!(sb.state(), SandboxState::Assigned("cc -c foo.c".to_string()));
        sb.clear();
        assert_eq!(sb.task(), None);
        assert!(!sb.debug());
        sb.destroy();
        assert_eq!(sb.state(), SandboxState::Destroyed);
    }
}
