//! ECFS listing types and FileAttr conversion
//!
//! Defines the parsed form of `els` output and conversion to FUSE attributes.

use fuser::{FileAttr, FileType};
use serde::Serialize;
use std::time::SystemTime;
use tracing::warn;

/// Kind of an archive entry, taken from the first character of its permission string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other(char),
}

impl EntryKind {
    /// Classify a permission string such as `drwxr-xr-x`
    ///
    /// `o` is not documented by the archive tools; entries carrying it behave like plain files.
    pub fn from_permissions(permissions: &str) -> Option<Self> {
        let code = permissions.chars().next()?;
        let kind = match code {
            'd' => EntryKind::Directory,
            '-' | 'o' => EntryKind::File,
            'l' => EntryKind::Symlink,
            other => {
                warn!(code = %other, permissions = permissions, "Unknown archive entry type code");
                EntryKind::Other(other)
            }
        };
        Some(kind)
    }

    pub fn file_type(&self) -> FileType {
        match self {
            EntryKind::Directory => FileType::Directory,
            EntryKind::Symlink => FileType::Symlink,
            EntryKind::File | EntryKind::Other(_) => FileType::RegularFile,
        }
    }
}

/// One line of an `els` listing
///
/// Detail columns are empty/zero when the listing was requested without `-l`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingEntry {
    pub permissions: String,
    pub links: u32,
    pub owner: String,
    pub group: String,
    pub size: u64,
    /// Month, day and time columns as printed by the tool
    pub modified: String,
    /// Absolute archive path of the entry
    pub path: String,
}

impl ListingEntry {
    /// Entry with only a path (plain `els` output)
    pub fn plain(path: impl Into<String>) -> Self {
        Self {
            permissions: String::new(),
            links: 0,
            owner: String::new(),
            group: String::new(),
            size: 0,
            modified: String::new(),
            path: path.into(),
        }
    }

    pub fn kind(&self) -> Option<EntryKind> {
        EntryKind::from_permissions(&self.permissions)
    }

    pub fn has_detail(&self) -> bool {
        !self.permissions.is_empty()
    }

    /// Get the base name (last component of path)
    pub fn base_name(&self) -> &str {
        let name = self.path.trim_end_matches('/');
        name.rsplit('/').next().unwrap_or(name)
    }
}

/// Entry information returned to catalog consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Absolute archive path
    pub name: String,
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub kind: Option<EntryKind>,
}

impl FileInfo {
    pub fn from_entry(entry: &ListingEntry, detail: bool) -> Self {
        if detail && entry.has_detail() {
            Self {
                name: entry.path.clone(),
                size: Some(entry.size),
                kind: entry.kind(),
            }
        } else {
            Self {
                name: entry.path.clone(),
                size: None,
                kind: None,
            }
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == Some(EntryKind::Directory)
    }
}

/// Join an archive directory and an entry name
pub fn join_archive_path(dir: &str, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    let dir = dir.trim_end_matches('/');
    format!("{}/{}", dir, name)
}

/// Whether `path` is `root` itself or lies below it, comparing whole components
pub fn is_within(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Parse the stdout of `els [-l] [-R] <root>`
///
/// Skips blank and `total N` lines. In recursive output a line ending in `:`
/// opens a directory section and the following names are relative to it.
/// Names are resolved to absolute archive paths.
pub fn parse_listing(root: &str, output: &str, detail: bool) -> Vec<ListingEntry> {
    let mut entries = Vec::new();
    let mut current_dir = root.to_string();

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("total ") {
            continue;
        }

        let columns: Vec<&str> = line.split_whitespace().collect();
        if line.ends_with(':') && (!detail || columns.len() < 9) {
            current_dir = join_archive_path(root, line.trim_end_matches(':'));
            continue;
        }

        if !detail {
            entries.push(ListingEntry::plain(join_archive_path(&current_dir, line.trim())));
            continue;
        }

        if columns.len() < 9 {
            warn!(line = line, "Skipping malformed listing line");
            continue;
        }

        let mut name = columns[8..].join(" ");
        if columns[0].starts_with('l') {
            if let Some(idx) = name.find(" -> ") {
                name.truncate(idx);
            }
        }

        entries.push(ListingEntry {
            permissions: columns[0].to_string(),
            links: columns[1].parse().unwrap_or(0),
            owner: columns[2].to_string(),
            group: columns[3].to_string(),
            size: columns[4].parse().unwrap_or(0),
            modified: columns[5..8].join(" "),
            path: join_archive_path(&current_dir, &name),
        });
    }

    entries
}

/// Convert an archive FileInfo to FUSE FileAttr
///
/// The archive is exposed read-only: 0o755 for directories, 0o444 for files.
pub fn file_info_to_attr(ino: u64, info: &FileInfo) -> FileAttr {
    let kind = info
        .kind
        .map(|k| k.file_type())
        .unwrap_or(FileType::RegularFile);
    let is_dir = kind == FileType::Directory;
    let size = info.size.unwrap_or(0);
    let now = SystemTime::now();
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind,
        perm: if is_dir { 0o755 } else { 0o444 },
        nlink: if is_dir { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Create a FileAttr for a directory with current time
pub fn directory_attr(ino: u64) -> FileAttr {
    file_info_to_attr(
        ino,
        &FileInfo {
            name: String::new(),
            size: Some(0),
            kind: Some(EntryKind::Directory),
        },
    )
}
