use std::collections::HashMap;
use std::sync::Mutex;

use crate::fs_types::FileDescriptor;

/// Inode number the kernel expects for the mount root.
pub const ROOT_INO: u64 = 1;

/// Lookup table keyed by virtual path, populated during directory
/// traversal and never pruned for the life of the mount.
///
/// Also hands out inode numbers: the kernel addresses objects by inode
/// while the rest of this daemon is path-keyed. The root is pinned to
/// inode 1 and carries no descriptor; its attributes come from the
/// mountpoint itself.
pub struct PathTable {
    inner: Mutex<Inner>,
}

struct Inner {
    by_path: HashMap<String, Slot>,
    paths: HashMap<u64, String>,
    next_ino: u64,
}

struct Slot {
    ino: u64,
    desc: FileDescriptor,
}

impl PathTable {
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_INO, "/".to_string());
        PathTable {
            inner: Mutex::new(Inner {
                by_path: HashMap::new(),
                paths,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    /// Records a descriptor under its path and returns the inode.
    ///
    /// Re-inserting an existing path keeps its inode and replaces the
    /// descriptor with the fresh one.
    pub fn insert(&self, desc: FileDescriptor) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.by_path.get_mut(&desc.path) {
            slot.desc = desc;
            return slot.ino;
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.paths.insert(ino, desc.path.clone());
        inner.by_path.insert(desc.path.clone(), Slot { ino, desc });
        ino
    }

    /// Descriptor for a path, if its parent directory was ever listed.
    pub fn lookup(&self, path: &str) -> Option<FileDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner.by_path.get(path).map(|slot| slot.desc.clone())
    }

    pub fn ino_of(&self, path: &str) -> Option<u64> {
        if path == "/" {
            return Some(ROOT_INO);
        }
        let inner = self.inner.lock().unwrap();
        inner.by_path.get(path).map(|slot| slot.ino)
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.paths.get(&ino).cloned()
    }

    pub fn descriptor_by_ino(&self, ino: u64) -> Option<FileDescriptor> {
        let inner = self.inner.lock().unwrap();
        let path = inner.paths.get(&ino)?;
        inner.by_path.get(path).map(|slot| slot.desc.clone())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_path.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Joins a directory path with one child name.
pub fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// True when a remote name can stand as a single path component.
/// Separators or dot entries in a name would let a listing place its
/// cache file outside the cache root.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}
