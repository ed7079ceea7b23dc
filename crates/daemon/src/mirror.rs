//! Per-root pool of task sandboxes sharing one remote view.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use common::attr::FileAttr;
use common::status::MirrorStatus;

use crate::fs::RpcFs;
use crate::sandbox::{SandboxError, SandboxFs, SandboxOptions};

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

#[derive(Debug, Default)]
struct Pool {
    idle: Vec<Arc<SandboxFs>>,
    working: HashMap<u64, Arc<SandboxFs>>,
    /// Sandboxes under construction, counted against the grant.
    building: usize,
    waiting: usize,
    shutting_down: bool,
}

/// Sandbox pool for one exported root.
pub struct Mirror {
    root: String,
    rpc_fs: Arc<RpcFs>,
    options: SandboxOptions,
    granted: usize,
    pool: Mutex<Pool>,
    cond: Condvar,
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("root", &self.root)
            .field("granted", &self.granted)
            .field("pool", &*self.pool.lock())
            .finish()
    }
}

impl Mirror {
    pub fn new(
        root: impl Into<String>,
        rpc_fs: Arc<RpcFs>,
        options: SandboxOptions,
        granted: usize,
    ) -> Self {
        Self {
            root: root.into(),
            rpc_fs,
            options,
            granted: granted.max(1),
            pool: Mutex::new(Pool::default()),
            cond: Condvar::new(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn granted(&self) -> usize {
        self.granted
    }

    pub fn rpc_fs(&self) -> &Arc<RpcFs> {
        &self.rpc_fs
    }

    /// Hand out a sandbox for `task`, waiting for a free slot.
    pub fn acquire(&self, task: &str) -> Result<Arc<SandboxFs>, MirrorError> {
        let mut pool = self.pool.lock();
        loop {
            if pool.shutting_down {
                return Err(MirrorError::ShuttingDown);
            }
            if pool.working.len() + pool.building < self.granted {
                break;
            }
            pool.waiting += 1;
            self.cond.wait(&mut pool);
            pool.waiting -= 1;
        }

        if let Some(sandbox) = pool.idle.pop() {
            sandbox.assign(task);
            pool.working.insert(sandbox.id(), sandbox.clone());
            return Ok(sandbox);
        }

        pool.building += 1;
        drop(pool);
        let built = SandboxFs::new(self.rpc_fs.clone(), &self.options);
        let mut pool = self.pool.lock();
        pool.building -= 1;

        let sandbox = match built {
            Ok(sandbox) => Arc::new(sandbox),
            Err(e) => {
                self.cond.notify_all();
                tracing::warn!(root = %self.root, error = %e, "failed to build sandbox");
                return Err(e.into());
            }
        };
        if pool.shutting_down {
            drop(pool);
            sandbox.destroy();
            self.cond.notify_all();
            return Err(MirrorError::ShuttingDown);
        }
        sandbox.assign(task);
        pool.working.insert(sandbox.id(), sandbox.clone());
        tracing::debug!(root = %self.root, id = sandbox.id(), task, "sandbox assigned");
        Ok(sandbox)
    }

    /// Take a sandbox back: recycle it, or destroy it during shutdown.
    ///
    /// Only a sandbox in this mirror's working set is taken back. A stray or
    /// repeated release is logged and otherwise ignored.
    pub fn release(&self, sandbox: Arc<SandboxFs>) {
        let mut pool = self.pool.lock();
        let owned = pool
            .working
            .get(&sandbox.id())
            .is_some_and(|held| Arc::ptr_eq(held, &sandbox));
        if !owned {
            tracing::warn!(root = %self.root, id = sandbox.id(), "released a sandbox this mirror does not own");
            return;
        }
        pool.working.remove(&sandbox.id());
        sandbox.clear();
        if pool.shutting_down {
            drop(pool);
            sandbox.destroy();
        } else {
            pool.idle.push(sandbox);
            drop(pool);
        }
        self.cond.notify_all();
    }

    /// Push changed attributes to the shared view and every sandbox.
    pub fn update(&self, attrs: &[FileAttr]) {
        let invalidations = self.rpc_fs.apply_update(attrs);
        let sandboxes: Vec<Arc<SandboxFs>> = {
            let pool = self.pool.lock();
            pool.idle
                .iter()
                .chain(pool.working.values())
                .cloned()
                .collect()
        };
        tracing::debug!(root = %self.root, files = attrs.len(), sandboxes = sandboxes.len(), "applying update");
        for sandbox in sandboxes {
            sandbox.apply_update(attrs, &invalidations);
        }
    }

    /// Stop handing out sandboxes and destroy the idle ones. Running ones
    /// are destroyed when released.
    pub fn shutdown(&self) {
        let idle = {
            let mut pool = self.pool.lock();
            pool.shutting_down = true;
            std::mem::take(&mut pool.idle)
        };
        for sandbox in idle {
            sandbox.destroy();
        }
        self.cond.notify_all();
    }

    pub fn status(&self) -> MirrorStatus {
        let pool = self.pool.lock();
        let mut running: Vec<String> = pool
            .working
            .values()
            .map(|s| s.task().unwrap_or_default())
            .collect();
        running.sort();
        MirrorStatus {
            root: self.root.clone(),
            granted: self.granted,
            running,
            idle_fses: pool.idle.len(),
            waiting_tasks: pool.waiting,
            shutting_down: pool.shutting_down,
        }
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        let pool = self.pool.get_mut();
        for sandbox in pool.idle.drain(..).chain(pool.working.drain().map(|(_, s)| s)) {
            sandbox.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    use common::attr::{DirListing, FileInfo, Status};
    use common::rpc::{FsApi, RpcError};
    use content_cache::{ContentCache, ContentHash};

    struct RootOnly;

    impl FsApi for RootOnly {
        fn get_attr(&self, path: &str) -> Result<FileAttr, RpcError> {
            let mut attr = FileAttr::not_found(path);
            if path == "/" {
                attr.status = Status::Ok;
                attr.info = Some(FileInfo::directory(0o755));
            }
            Ok(attr)
        }

        fn read_dir(&self, _path: &str) -> Result<DirListing, RpcError> {
            Ok(DirListing {
                status: Status::Ok,
                names: Vec::new(),
            })
        }

        fn fetch_content(&self, _hash: &ContentHash) -> Result<Option<Vec<u8>>, RpcError> {
            Ok(None)
        }

        fn update_files(&self, _attrs: Vec<FileAttr>) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn mirror(tmp: &Path, granted: usize) -> Mirror {
        let cache = ContentCache::new(&tmp.join("cache")).unwrap();
        let rpc_fs = Arc::new(RpcFs::new(Arc::new(RootOnly), cache));
        let mut options = SandboxOptions::new(tmp, "src");
        options.mount = false;
        Mirror::new("/src", rpc_fs, options, granted)
    }

    #[test]
    fn test_release_recycles() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mirror = mirror(tmp.path(), 2);

        let first = mirror.acquire("job-1").unwrap();
        let id = first.id();
        let status = mirror.status();
        assert_eq!(status.running, vec!["job-1"]);
        assert_eq!(status.idle_fses, 0);

        mirror.release(first);
        let status = mirror.status();
        assert!(status.running.is_empty());
        assert_eq!(status.idle_fses, 1);

        let again = mirror.acquire("job-2").unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.task().as_deref(), Some("job-2"));
        mirror.release(again);
    }

    #[test]
    fn test_release_during_shutdown_destroys() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mirror = mirror(tmp.path(), 2);

        let busy = mirror.acquire("job").unwrap();
        let idle = mirror.acquire("other").unwrap();
        mirror.release(idle.clone());

        mirror.shutdown();
        assert!(idle.is_destroyed());
        assert!(!busy.is_destroyed());
        assert!(matches!(
            mirror.acquire("late"),
            Err(MirrorError::ShuttingDown)
        ));

        mirror.release(busy.clone());
        assert!(busy.is_destroyed());
        let status = mirror.status();
        assert!(status.shutting_down);
        assert_eq!(status.idle_fses, 0);
        assert!(status.running.is_empty());
    }

    #[test]
    fn test_acquire_waits_for_grant() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mirror = Arc::new(mirror(tmp.path(), 1));

        let held = mirror.acquire("first").unwrap();
        let waiter = {
            let mirror = mirror.clone();
            thread::spawn(move || {
                let sandbox = mirror.acquire("second").unwrap();
                let task = sandbox.task();
                mirror.release(sandbox);
                task
            })
        };

        // The second caller blocks until the slot frees up.
        while mirror.status().waiting_tasks == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(mirror.status().running, vec!["first"]);

        mirror.release(held);
        assert_eq!(waiter.join().unwrap().as_deref(), Some("second"));
        assert_eq!(mirror.status().waiting_tasks, 0);
    }

    #[test]
    fn test_update_reaches_shared_view() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mirror = mirror(tmp.path(), 1);
        let sandbox = mirror.acquire("job").unwrap();

        let mut attr = FileAttr::not_found("/new.c");
        attr.status = Status::Ok;
        attr.info = Some(FileInfo::regular(0o644, 0));
        mirror.update(&[attr]);

        let caller = crate::fs::Caller::default();
        let info = crate::fs::PathFs::get_attr(sandbox.fs().as_ref(), "new.c", &caller).unwrap();
        assert!(info.is_regular());
        mirror.release(sandbox);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mirror = mirror(tmp.path(), 2);

        let sandbox = mirror.acquire("job").unwrap();
        mirror.release(sandbox.clone());
        mirror.release(sandbox.clone());
        assert_eq!(mirror.status().idle_fses, 1);

        let a = mirror.acquire("t1").unwrap();
        let b = mirror.acquire("t2").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), sandbox.id());
        assert_eq!(mirror.status().running, vec!["t1", "t2"]);
        mirror.release(a);
        mirror.release(b);
        assert_eq!(mirror.status().idle_fses, 2);
    }

    #[test]
    fn test_foreign_sandbox_not_adopted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ours_dir = tempfile::TempDir::new_in(tmp.path()).unwrap();
        let theirs_dir = tempfile::TempDir::new_in(tmp.path()).unwrap();
        let ours = mirror(ours_dir.path(), 1);
        let theirs = mirror(theirs_dir.path(), 1);

        let foreign = theirs.acquire("elsewhere").unwrap();
        ours.release(foreign.clone());
        assert_eq!(ours.status().idle_fses, 0);
        assert_eq!(foreign.task().as_deref(), Some("elsewhere"));
        assert!(!foreign.is_destroyed());
        theirs.release(foreign);
    }
}
