//! Inode numbers for virtual paths.
//!
//! The kernel talks in inodes while the database is keyed by path. Every
//! path gets a number the first time it is looked up and keeps it until
//! unmount; the tree is immutable, so nothing is ever reclaimed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

pub const ROOT_INODE: u64 = 1;

pub struct InodeTable {
    next: AtomicU64,
    paths: RwLock<HashMap<u64, PathBuf>>,
    inodes: RwLock<HashMap<PathBuf, u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        Self {
            next: AtomicU64::new(ROOT_INODE + 1),
            paths: RwLock::new(HashMap::from([(ROOT_INODE, root.clone())])),
            inodes: RwLock::new(HashMap::from([(root, ROOT_INODE)])),
        }
    }

    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ino)
            .cloned()
    }

    /// Inode of `path`, assigning a fresh one on first use.
    pub fn ino_of(&self, path: &Path) -> u64 {
        if let Some(ino) = self
            .inodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return *ino;
        }

        let mut inodes = self.inodes.write().unwrap_or_else(PoisonError::into_inner);
        // raced with another lookup of the same path
        if let Some(ino) = inodes.get(path) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        inodes.insert(path.to_path_buf(), ino);
        self.paths
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ino, path.to_path_buf());
        ino
    }

    /// Number of inodes handed out, root included.
    pub fn len(&self) -> usize {
        self.paths.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual path of `name` inside `parent`. `..` climbs, stopping at the root.
pub fn child_path(parent: &Path, name: &std::ffi::OsStr) -> PathBuf {
    if name == ".." {
        return parent.parent().unwrap_or(parent).to_path_buf();
    }
    if name == "." {
        return parent.to_path_buf();
    }
    parent.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::sync::Arc;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INODE).unwrap(), Path::new("/"));
        assert_eq!(table.ino_of(Path::new("/")), ROOT_INODE);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn numbers_are_stable_and_distinct() {
        let table = InodeTable::new();
        let a = table.ino_of(Path::new("/a"));
        let b = table.ino_of(Path::new("/a/b"));
        assert_ne!(a, b);
        assert_ne!(a, ROOT_INODE);
        assert_eq!(table.ino_of(Path::new("/a")), a);
        assert_eq!(table.path_of(b).unwrap(), Path::new("/a/b"));
        assert!(table.path_of(9999).is_none());
    }

    #[test]
    fn concurrent_assignment_agrees() {
        let table = Arc::new(InodeTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| table.ino_of(&PathBuf::from(format!("/d/{i}"))))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
        assert_eq!(table.len(), 101);
    }

    #[test]
    fn child_path_handles_dot_entries() {
        let dir = Path::new("/a/b");
        assert_eq!(child_path(dir, OsStr::new("c")), Path::new("/a/b/c"));
        assert_eq!(child_path(dir, OsStr::new("..")), Path::new("/a"));
        assert_eq!(child_path(dir, OsStr::new(".")), dir);
        assert_eq!(child_path(Path::new("/"), OsStr::new("..")), Path::new("/"));
    }
}
