use std::collections::BTreeMap;
use std::sync::Arc;

use common::attr::{FileInfo, FileKind};
use common::paths;

use super::{Caller, DirEntry, Errno, FsResult, PathFs};

/// One entry of a [`SwitchFs`] routing table.
#[derive(Clone)]
pub struct Route {
    /// Relative path the filesystem is mounted at; empty for the root.
    pub prefix: String,
    pub fs: Arc<dyn PathFs>,
    /// Whether the filesystem sees paths relative to `prefix` or whole.
    pub strip: bool,
}

impl Route {
    pub fn new(prefix: &str, fs: Arc<dyn PathFs>, strip: bool) -> Self {
        Self {
            prefix: paths::relative(prefix).to_string(),
            fs,
            strip,
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("prefix", &self.prefix)
            .field("strip", &self.strip)
            .finish()
    }
}

/// Routes each path to the filesystem with the longest matching prefix.
#[derive(Debug, Clone)]
pub struct SwitchFs {
    /// Longest prefix first.
    routes: Vec<Route>,
}

impl SwitchFs {
    pub fn new(mut routes: Vec<Route>) -> Self {
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// The route serving `path` and the path as that route sees it.
    fn resolve(&self, path: &str) -> FsResult<(&Route, String)> {
        let path = paths::relative(path);
        let route = self
            .routes
            .iter()
            .find(|r| paths::has_dir_prefix(path, &r.prefix))
            .ok_or(Errno::NOENT)?;
        let inner = if route.strip {
            path[route.prefix.len()..].trim_start_matches('/').to_string()
        } else {
            path.to_string()
        };
        Ok((route, inner))
    }

    /// First components below `dir` of every mount point under it.
    fn mount_points_under<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.routes.iter().filter_map(move |r| {
            if r.prefix == dir || !paths::has_dir_prefix(&r.prefix, dir) {
                return None;
            }
            let rest = r.prefix[dir.len()..].trim_start_matches('/');
            rest.split('/').next().filter(|name| !name.is_empty())
        })
    }

    /// Whether `path` lies strictly above some mount point.
    fn is_mount_ancestor(&self, path: &str) -> bool {
        self.routes
            .iter()
            .any(|r| r.prefix != path && !r.prefix.is_empty() && paths::has_dir_prefix(&r.prefix, path))
    }
}

impl PathFs for SwitchFs {
    fn get_attr(&self, path: &str, caller: &Caller) -> FsResult<FileInfo> {
        let (route, inner) = self.resolve(path)?;
        match route.fs.get_attr(&inner, caller) {
            Err(Errno::NOENT) if self.is_mount_ancestor(paths::relative(path)) => Ok(FileInfo::directory(0o755)),
            result => result,
        }
    }

    fn read_dir(&self, path: &str, caller: &Caller) -> FsResult<Vec<DirEntry>> {
        let dir = paths::relative(path);
        let (route, inner) = self.resolve(dir)?;
        let mut entries: BTreeMap<String, FileKind> = match route.fs.read_dir(&inner, caller) {
            Ok(entries) => entries.into_iter().map(|e| (e.name, e.kind)).collect(),
            Err(Errno::NOENT) if self.is_mount_ancestor(dir) => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        for name in self.mount_points_under(dir) {
            entries.insert(name.to_string(), FileKind::Directory);
        }
        Ok(entries
            .into_iter()
            .map(|(name, kind)| DirEntry::new(name, kind))
            .collect())
    }

    fn read(&self, path: &str, offset: u64, size: u32, caller: &Caller) -> FsResult<Vec<u8>> {
        let (route, inner) = self.resolve(path)?;
        route.fs.read(&inner, offset, size, caller)
    }

    fn read_link(&self, path: &str, caller: &Caller) -> FsResult<String> {
        let (route, inner) = self.resolve(path)?;
        route.fs.read_link(&inner, caller)
    }

    fn write(&self, path: &str, offset: u64, data: &[u8], caller: &Caller) -> FsResult<u32> {
        let (route, inner) = self.resolve(path)?;
        route.fs.write(&inner, offset, data, caller)
    }

    fn create(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        let (route, inner) = self.resolve(path)?;
        route.fs.create(&inner, mode, caller)
    }

    fn mkdir(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        let (route, inner) = self.resolve(path)?;
        route.fs.mkdir(&inner, mode, caller)
    }

    fn unlink(&self, path: &str, caller: &Caller) -> FsResult<()> {
        let (route, inner) = self.resolve(path)?;
        route.fs.unlink(&inner, caller)
    }

    fn rmdir(&self, path: &str, caller: &Caller) -> FsResult<()> {
        let (route, inner) = self.resolve(path)?;
        route.fs.rmdir(&inner, caller)
    }

    fn rename(&self, from: &str, to: &str, caller: &Caller) -> FsResult<()> {
        let (from_route, from_inner) = self.resolve(from)?;
        let (to_route, to_inner) = self.resolve(to)?;
        if from_route.prefix != to_route.prefix {
            return Err(Errno::XDEV);
        }
        from_route.fs.rename(&from_inner, &to_inner, caller)
    }

    fn symlink(&self, target: &str, path: &str, caller: &Caller) -> FsResult<()> {
        let (route, inner) = self.resolve(path)?;
        route.fs.symlink(target, &inner, caller)
    }

    fn truncate(&self, path: &str, size: u64, caller: &Caller) -> FsResult<()> {
        let (route, inner) = self.resolve(path)?;
        route.fs.truncate(&inner, size, caller)
    }

    fn chmod(&self, path: &str, mode: u32, caller: &Caller) -> FsResult<()> {
        let (route, inner) = self.resolve(path)?;
        route.fs.chmod(&inner, mode, caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{DevNullFs, LoopbackFs, ReadonlyFs};
    use std::fs;
    use tempfile::TempDir;

    fn names(fs: &SwitchFs, path: &str) -> Vec<String> {
        fs.read_dir(path, &Caller::default())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("var/tmp")).unwrap();
        fs::write(root.path().join("var/tmp/hidden"), b"root").unwrap();
        fs::write(scratch.path().join("visible"), b"scratch").unwrap();

        let sw = SwitchFs::new(vec![
            Route::new("", Arc::new(ReadonlyFs::new(Arc::new(LoopbackFs::new(root.path())))), false),
            Route::new("var/tmp", Arc::new(LoopbackFs::new(scratch.path())), true),
        ]);
        let c = Caller::default();

        assert_eq!(names(&sw, "var/tmp"), vec!["visible"]);
        assert_eq!(sw.read("var/tmp/visible", 0, 100, &c).unwrap(), b"scratch");
        assert_eq!(sw.get_attr("var/tmp/hidden", &c), Err(Errno::NOENT));

        // Writes reach the scratch space but not the read-only root.
        sw.create("var/tmp/out", 0o644, &c).unwrap();
        assert!(scratch.path().join("out").exists());
        assert_eq!(sw.create("var/out", 0o644, &c), Err(Errno::ROFS));
        assert_eq!(sw.rename("var/tmp/out", "var/out", &c), Err(Errno::XDEV));
    }

    #[test]
    fn test_mount_points_listed_in_parent() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("file.txt"), b"x").unwrap();
        let sw = SwitchFs::new(vec![
            Route::new("", Arc::new(LoopbackFs::new(root.path())), false),
            Route::new("dev", Arc::new(DevNullFs::new()), true),
            Route::new("a/b/mnt", Arc::new(DevNullFs::new()), true),
        ]);
        let c = Caller::default();

        assert_eq!(names(&sw, ""), vec!["a", "dev", "file.txt"]);
        assert!(sw.get_attr("a", &c).unwrap().is_dir());
        assert_eq!(names(&sw, "a/b"), vec!["mnt"]);
        assert_eq!(names(&sw, "dev"), vec!["null"]);
        assert!(sw.read("dev/null", 0, 10, &c).unwrap().is_empty());
    }

    #[test]
    fn test_unstripped_route_sees_full_path() {
        let root = TempDir::new().unwrap();
        let rw = TempDir::new().unwrap();
        fs::create_dir_all(rw.path().join("home/src")).unwrap();
        fs::write(rw.path().join("home/src/f"), b"rw").unwrap();
        let sw = SwitchFs::new(vec![
            Route::new("", Arc::new(LoopbackFs::new(root.path())), false),
            Route::new("home/src", Arc::new(LoopbackFs::new(rw.path())), false),
        ]);
        assert_eq!(
            sw.read("home/src/f", 0, 10, &Caller::default()).unwrap(),
            b"rw"
        );
    }
}
