//! Archive FUSE Filesystem Implementation
//!
//! Implements the fuser::Filesystem trait to expose an archive directory as a
//! read-only local volume. Opening a file only queues it for staging; the
//! first read stages it, so files opened together are retrieved together.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, Request,
};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use super::catalog::ArchiveCatalog;
use super::handles::{read_at, HandleTable};
use super::inode::{InodeTable, ROOT_INO};
use crate::ecfs::{file_info_to_attr, io_errno, join_archive_path, EcfsError, EntryKind, FileInfo};

/// TTL for file attributes
const TTL: Duration = Duration::from_secs(1);

/// Directory entry returned by readdir
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileType,
}

/// Archive Filesystem - mounts an archive directory as a FUSE volume
pub struct ArchiveFilesystem {
    /// Inode table for path/inode mapping
    inode_table: Mutex<InodeTable>,
    /// Listing and staging entry point
    catalog: Arc<ArchiveCatalog>,
    /// Archive directory shown at the mount root
    root: String,
    /// Runtime whose blocking pool serves reads
    runtime: Handle,
    /// File info by relative path, filled by readdir and lookup
    file_cache: Mutex<HashMap<String, FileInfo>>,
    /// Open file handles
    handles: Mutex<HandleTable>,
}

impl ArchiveFilesystem {
    /// Create a filesystem for `root` on the current tokio runtime
    pub fn new(catalog: Arc<ArchiveCatalog>, root: &str) -> Self {
        Self::with_runtime(catalog, root, Handle::current())
    }

    pub fn with_runtime(catalog: Arc<ArchiveCatalog>, root: &str, runtime: Handle) -> Self {
        let root = format!("/{}", root.trim_matches('/'));
        Self {
            inode_table: Mutex::new(InodeTable::new()),
            catalog,
            root,
            runtime,
            file_cache: Mutex::new(HashMap::new()),
            handles: Mutex::new(HandleTable::new()),
        }
    }

    /// Archive path for a path relative to the mount root
    fn archive_path(&self, relative: &str) -> String {
        if relative.is_empty() {
            self.root.clone()
        } else {
            join_archive_path(&self.root, relative)
        }
    }

    fn path_for_inode(&self, ino: u64) -> Result<String, EcfsError> {
        let inode_table = self.inode_table.lock().unwrap();
        inode_table
            .get_path(ino)
            .map(str::to_string)
            .ok_or_else(|| EcfsError::NotFound(format!("inode {}", ino)))
    }

    /// File info for a relative path, from the cache or a fresh listing
    fn info_for(&self, relative: &str) -> Result<FileInfo, EcfsError> {
        if relative.is_empty() {
            return Ok(FileInfo {
                name: self.root.clone(),
                size: Some(0),
                kind: Some(EntryKind::Directory),
            });
        }

        if let Some(info) = self.file_cache.lock().unwrap().get(relative) {
            return Ok(info.clone());
        }

        let info = self.catalog.info(&self.archive_path(relative))?;
        self.file_cache
            .lock()
            .unwrap()
            .insert(relative.to_string(), info.clone());
        Ok(info)
    }

    fn attr_for_inode(&self, ino: u64) -> Result<FileAttr, EcfsError> {
        let path = self.path_for_inode(ino)?;
        let info = self.info_for(&path)?;
        Ok(file_info_to_attr(ino, &info))
    }

    /// Resolve `name` inside `parent`, allocating an inode for it
    fn lookup_child(&self, parent: u64, name: &str) -> Result<FileAttr, EcfsError> {
        let parent_path = self.path_for_inode(parent)?;
        let child_path = InodeTable::child_path(&parent_path, name);
        let info = self.info_for(&child_path)?;

        let ino = {
            let mut inode_table = self.inode_table.lock().unwrap();
            inode_table.lookup_or_create(&child_path)
        };
        Ok(file_info_to_attr(ino, &info))
    }

    /// List directory contents from the archive
    fn list_directory(&self, dir_ino: u64) -> Result<Vec<DirEntry>, EcfsError> {
        let dir_path = self.path_for_inode(dir_ino)?;
        let archive_dir = self.archive_path(&dir_path);

        let parent_ino = {
            let inode_table = self.inode_table.lock().unwrap();
            inode_table.get_parent_ino(dir_ino)
        };
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                ino: dir_ino,
                kind: FileType::Directory,
            },
            DirEntry {
                name: "..".to_string(),
                ino: parent_ino,
                kind: FileType::Directory,
            },
        ];

        let listing = self.catalog.ls(&archive_dir, true, false)?;
        debug!(count = listing.len(), dir = %archive_dir, "Got archive listing");

        for info in listing {
            if info.name == archive_dir {
                continue;
            }
            let name = match info.name.rsplit('/').next() {
                Some(name) if !name.is_empty() && name != "." && name != ".." => name.to_string(),
                _ => continue,
            };

            let child_path = InodeTable::child_path(&dir_path, &name);
            let ino = {
                let mut inode_table = self.inode_table.lock().unwrap();
                inode_table.lookup_or_create(&child_path)
            };
            let kind = info
                .kind
                .map(|k| k.file_type())
                .unwrap_or(FileType::RegularFile);
            self.file_cache.lock().unwrap().insert(child_path, info);

            entries.push(DirEntry { name, ino, kind });
        }

        Ok(entries)
    }

    /// Open a file read-only; staging is deferred to the first read
    fn open_file(&self, ino: u64, flags: i32) -> Result<u64, EcfsError> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(EcfsError::write_unsupported());
        }
        let path = self.path_for_inode(ino)?;
        if self.info_for(&path)?.is_directory() {
            return Err(EcfsError::UnsupportedOperation(format!(
                "{} is a directory",
                self.archive_path(&path)
            )));
        }

        let archive_path = self.archive_path(&path);
        let handle = self.catalog.open(&archive_path, "rb")?;
        Ok(self.handles.lock().unwrap().open(ino, archive_path, handle))
    }
}

impl Filesystem for ArchiveFilesystem {
    /// Get file attributes
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!(ino = ino, "getattr");

        let attr = if ino == ROOT_INO {
            self.info_for("").map(|info| file_info_to_attr(ino, &info))
        } else {
            self.attr_for_inode(ino)
        };
        match attr {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => {
                warn!(ino = ino, error = %e, "getattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    /// Look up a file by name in a directory
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name_str = name.to_string_lossy();
        debug!(parent = parent, name = %name_str, "lookup");

        match self.lookup_child(parent, &name_str) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// Read directory contents
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!(ino = ino, offset = offset, "readdir");

        let entries = match self.list_directory(ino) {
            Ok(entries) => entries,
            Err(e) => {
                error!(ino = ino, error = %e, "Failed to list archive directory");
                reply.error(e.to_errno());
                return;
            }
        };

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            // reply.add returns true if buffer is full
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }

        reply.ok();
    }

    /// Open a directory
    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!(ino = ino, "opendir");

        if self.path_for_inode(ino).is_err() {
            reply.error(libc::ENOENT);
            return;
        }
        reply.opened(0, 0);
    }

    /// Release (close) a directory
    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        debug!(ino = ino, "releasedir");
        reply.ok();
    }

    /// Open a file; write access is refused
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!(ino = ino, flags = flags, "open");

        match self.open_file(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => {
                debug!(ino = ino, error = %e, "open refused");
                reply.error(e.to_errno());
            }
        }
    }

    /// Read from an open file
    ///
    /// Served on the blocking pool: the first read of a pending file waits
    /// out the batching window and the archive copy.
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!(ino = ino, fh = fh, offset = offset, size = size, "read");

        let handle = match self.handles.lock().unwrap().get(fh) {
            Some(open_file) => Arc::clone(&open_file.handle),
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        self.runtime.spawn_blocking(move || {
            let mut handle = handle.lock().unwrap();
            match read_at(&mut handle, offset.max(0) as u64, size as usize) {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    warn!(remote = %handle.remote_path(), error = %e, "read failed");
                    reply.error(io_errno(&e));
                }
            }
        });
    }

    /// Release (close) a file
    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!(ino = ino, fh = fh, "release");
        let open_file = self.handles.lock().unwrap().close(fh);
        // Dropped after the table lock is released
        drop(open_file);
        reply.ok();
    }
}
