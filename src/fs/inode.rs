//! Inode table for mapping archive paths to stable inode numbers
//!
//! FUSE requires stable inode numbers for the lifetime of a mount. The
//! archive is read-only, so inodes are only ever added.

use std::collections::HashMap;

/// Root inode number (always 1 per FUSE convention)
pub const ROOT_INO: u64 = 1;

/// Manages path-to-inode mapping for the filesystem
pub struct InodeTable {
    /// Map from path (relative to the mounted archive directory) to inode number
    path_to_ino: HashMap<String, u64>,
    /// Map from inode number to path
    ino_to_path: HashMap<u64, String>,
    /// Next available inode number
    next_ino: u64,
}

impl InodeTable {
    /// Create a new inode table with root inode initialized
    pub fn new() -> Self {
        let mut table = Self {
            path_to_ino: HashMap::new(),
            ino_to_path: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };

        // Empty path = mounted archive directory
        table.path_to_ino.insert(String::new(), ROOT_INO);
        table.ino_to_path.insert(ROOT_INO, String::new());

        table
    }

    /// Look up an inode for a path, creating one if it doesn't exist
    pub fn lookup_or_create(&mut self, path: &str) -> u64 {
        let normalized = Self::normalize_path(path);

        if let Some(&ino) = self.path_to_ino.get(&normalized) {
            return ino;
        }

        let ino = self.next_ino;
        self.next_ino += 1;

        self.path_to_ino.insert(normalized.clone(), ino);
        self.ino_to_path.insert(ino, normalized);

        ino
    }

    /// Get the path for an inode number
    pub fn get_path(&self, ino: u64) -> Option<&str> {
        self.ino_to_path.get(&ino).map(|s| s.as_str())
    }

    /// Get the inode for a path (without creating)
    pub fn get_ino(&self, path: &str) -> Option<u64> {
        let normalized = Self::normalize_path(path);
        self.path_to_ino.get(&normalized).copied()
    }

    /// Get parent inode for a given inode
    pub fn get_parent_ino(&self, ino: u64) -> u64 {
        let Some(path) = self.get_path(ino) else {
            return ROOT_INO;
        };

        match path.rfind('/') {
            Some(last_slash) => self
                .path_to_ino
                .get(&path[..last_slash])
                .copied()
                .unwrap_or(ROOT_INO),
            None => ROOT_INO,
        }
    }

    /// Number of known inodes, root included
    pub fn len(&self) -> usize {
        self.ino_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ino_to_path.is_empty()
    }

    /// Relative path of `name` inside the directory at `parent_path`
    pub fn child_path(parent_path: &str, name: &str) -> String {
        if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_path, name)
        }
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
