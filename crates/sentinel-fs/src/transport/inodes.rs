//! Inode bookkeeping for the transport: the kernel speaks inode numbers, the
//! engine speaks virtual paths. Numbers are handed out on first lookup and
//! never reused.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Inode number of the mount root (`/`).
pub const ROOT_INO: u64 = 1;

pub struct InodeTable {
    inner: RwLock<Tables>,
}

struct Tables {
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INO, root.clone());
        by_path.insert(root, ROOT_INO);
        Self {
            inner: RwLock::new(Tables {
                by_ino,
                by_path,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    /// Virtual path registered for `ino`, if the kernel ever looked it up.
    pub fn vpath(&self, ino: u64) -> Option<PathBuf> {
        self.inner.read().by_ino.get(&ino).cloned()
    }

    /// Inode for `vpath`, allocating one on first sight.
    pub fn assign(&self, vpath: &Path) -> u64 {
        if let Some(&ino) = self.inner.read().by_path.get(vpath) {
            return ino;
        }
        let mut tables = self.inner.write();
        if let Some(&ino) = tables.by_path.get(vpath) {
            return ino;
        }
        let ino = tables.next_ino;
        tables.next_ino += 1;
        tables.by_ino.insert(ino, vpath.to_path_buf());
        tables.by_path.insert(vpath.to_path_buf(), ino);
        ino
    }

    /// Drop the mapping for an unlinked or removed path.
    pub fn remove(&self, vpath: &Path) {
        let mut tables = self.inner.write();
        if let Some(ino) = tables.by_path.remove(vpath) {
            tables.by_ino.remove(&ino);
        }
    }

    /// Remap `from` (and, for directories, everything beneath it) to `to`.
    /// A clobbered rename target loses its mapping first.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut tables = self.inner.write();
        if let Some(old_ino) = tables.by_path.remove(to) {
            tables.by_ino.remove(&old_ino);
        }
        let moved: Vec<PathBuf> = tables
            .by_path
            .keys()
            .filter(|path| path.starts_with(from))
            .cloned()
            .collect();
        for old_path in moved {
            let new_path = match old_path.strip_prefix(from) {
                Ok(suffix) if suffix.as_os_str().is_empty() => to.to_path_buf(),
                Ok(suffix) => to.join(suffix),
                Err(_) => continue,
            };
            if let Some(ino) = tables.by_path.remove(&old_path) {
                tables.by_ino.insert(ino, new_path.clone());
                tables.by_path.insert(new_path, ino);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.vpath(ROOT_INO), Some(PathBuf::from("/")));
        assert_eq!(table.assign(Path::new("/")), ROOT_INO);
    }

    #[test]
    fn assignment_is_stable() {
        let table = InodeTable::new();
        let a = table.assign(Path::new("/a.txt"));
        let b = table.assign(Path::new("/b.txt"));
        assert_ne!(a, b);
        assert_eq!(table.assign(Path::new("/a.txt")), a);
        assert_eq!(table.vpath(a), Some(PathBuf::from("/a.txt")));
    }

    #[test]
    fn removal_forgets_the_path() {
        let table = InodeTable::new();
        let ino = table.assign(Path::new("/gone.txt"));
        table.remove(Path::new("/gone.txt"));
        assert_eq!(table.vpath(ino), None);
    }

    #[test]
    fn rename_remaps_descendants() {
        let table = InodeTable::new();
        let dir = table.assign(Path::new("/old"));
        let child = table.assign(Path::new("/old/nested/file.txt"));
        table.rename(Path::new("/old"), Path::new("/new"));
        assert_eq!(table.vpath(dir), Some(PathBuf::from("/new")));
        assert_eq!(table.vpath(child), Some(PathBuf::from("/new/nested/file.txt")));
        assert_eq!(table.assign(Path::new("/new")), dir);
    }

    #[test]
    fn rename_over_an_existing_target_drops_it() {
        let table = InodeTable::new();
        let winner = table.assign(Path::new("/src.txt"));
        let loser = table.assign(Path::new("/dst.txt"));
        table.rename(Path::new("/src.txt"), Path::new("/dst.txt"));
        assert_eq!(table.vpath(winner), Some(PathBuf::from("/dst.txt")));
        assert_eq!(table.vpath(loser), None);
    }
}
