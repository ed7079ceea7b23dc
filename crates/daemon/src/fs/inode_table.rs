//! Inode numbers for the FUSE adapter.
//!
//! The kernel addresses files by 64-bit inode; every [`PathFs`](super::PathFs)
//! addresses them by relative path. Numbers are handed out on first lookup
//! and stay stable until the path disappears.

use std::collections::HashMap;

use common::paths;

#[derive(Debug)]
pub struct InodeTable {
    by_path: HashMap<String, u64>,
    by_inode: HashMap<u64, String>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// FUSE reserves 1 for the mount root.
    pub const ROOT: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            by_path: HashMap::new(),
            by_inode: HashMap::new(),
            next: Self::ROOT + 1,
        };
        table.by_path.insert(String::new(), Self::ROOT);
        table.by_inode.insert(Self::ROOT, String::new());
        table
    }

    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }

    /// The inode of `path`, allocating one on first sight.
    pub fn lookup(&mut self, path: &str) -> u64 {
        let path = paths::relative(path);
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(path.to_string(), ino);
        self.by_inode.insert(ino, path.to_string());
        ino
    }

    pub fn inode(&self, path: &str) -> Option<u64> {
        self.by_path.get(paths::relative(path)).copied()
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.by_inode.get(&ino).map(String::as_str)
    }

    /// Path of child `name` of directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.path(parent).map(|dir| paths::join_relative(dir, name))
    }

    /// Forget `path` and everything below it. The root is never forgotten.
    pub fn remove(&mut self, path: &str) {
        let path = paths::relative(path);
        if path.is_empty() {
            return;
        }
        let doomed: Vec<String> = self
            .by_path
            .keys()
            .filter(|p| paths::has_dir_prefix(p, path))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(ino) = self.by_path.remove(&p) {
                self.by_inode.remove(&ino);
            }
        }
    }

    /// Move `from` and its descendants to `to`, keeping their inodes.
    pub fn rename(&mut self, from: &str, to: &str) {
        let from = paths::relative(from);
        let to = paths::relative(to);
        if from.is_empty() || from == to {
            return;
        }
        self.remove(to);
        let moved: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|(p, _)| paths::has_dir_prefix(p, from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            self.by_path.remove(&old);
            self.by_path.insert(new.clone(), ino);
            self.by_inode.insert(ino, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preallocated() {
        let table = InodeTable::new();
        assert_eq!(table.inode(""), Some(InodeTable::ROOT));
        assert_eq!(table.inode("/"), Some(InodeTable::ROOT));
        assert_eq!(table.path(InodeTable::ROOT), Some(""));
    }

    #[test]
    fn test_lookup_is_stable() {
        let mut table = InodeTable::new();
        let a = table.lookup("a");
        assert_eq!(table.lookup("/a/"), a);
        let b = table.lookup("b");
        assert_ne!(a, b);
        assert_ne!(a, InodeTable::ROOT);
        assert_eq!(table.child_path(a, "x").as_deref(), Some("a/x"));
        assert_eq!(table.child_path(InodeTable::ROOT, "x").as_deref(), Some("x"));
    }

    #[test]
    fn test_remove_takes_descendants() {
        let mut table = InodeTable::new();
        table.lookup("dir");
        table.lookup("dir/f");
        let keep = table.lookup("dirt");

        table.remove("dir");
        assert!(table.inode("dir").is_none());
        assert!(table.inode("dir/f").is_none());
        assert_eq!(table.inode("dirt"), Some(keep));

        table.remove("");
        assert_eq!(table.inode(""), Some(InodeTable::ROOT));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let mut table = InodeTable::new();
        let dir = table.lookup("old");
        let file = table.lookup("old/f");
        table.lookup("new");

        table.rename("old", "new");
        assert_eq!(table.inode("new"), Some(dir));
        assert_eq!(table.path(file), Some("new/f"));
        assert!(table.inode("old/f").is_none());
        assert_eq!(table.len(), 3);
    }
}
