//! File Handle Tracking
//!
//! Manages open file handles for the FUSE filesystem.
//! Each open() call creates a handle, read() uses it, release() removes it.
//! Handles are shared with the worker threads that serve reads, so a read
//! blocked on staging does not hold up other requests.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::stage::CachedFileHandle;

/// Represents an open file handle
pub struct OpenFile {
    /// Inode number of the open file
    pub ino: u64,
    /// Archive path of the file
    pub path: String,
    /// Deferred-staging handle for the cached copy
    pub handle: Arc<Mutex<CachedFileHandle>>,
}

/// Manages all open file handles
pub struct HandleTable {
    /// Map from file handle ID to OpenFile
    handles: HashMap<u64, OpenFile>,
    /// Next file handle ID to assign
    next_fh: AtomicU64,
}

impl HandleTable {
    /// Create a new empty handle table
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            // Start at 1 (0 is sometimes special in FUSE)
            next_fh: AtomicU64::new(1),
        }
    }

    /// Register an opened archive file and return its file handle ID
    pub fn open(&mut self, ino: u64, path: String, handle: CachedFileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        debug!(fh = fh, ino = ino, path = %path, staged = handle.is_staged(), "Opened file handle");

        self.handles.insert(
            fh,
            OpenFile {
                ino,
                path,
                handle: Arc::new(Mutex::new(handle)),
            },
        );
        fh
    }

    /// Get a reference to an open file
    pub fn get(&self, fh: u64) -> Option<&OpenFile> {
        self.handles.get(&fh)
    }

    /// Remove a file handle and return the handle data
    ///
    /// The handle itself is not locked here: a read may still hold it. The
    /// cached file closes when the last reference is dropped.
    pub fn close(&mut self, fh: u64) -> Option<OpenFile> {
        let open_file = self.handles.remove(&fh)?;
        debug!(fh = fh, ino = open_file.ino, path = %open_file.path, "Closed file handle");
        Some(open_file)
    }

    /// Get the number of open handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if there are no open handles
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Read up to `size` bytes at `offset`, staging the file first if needed
pub fn read_at(handle: &mut CachedFileHandle, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    handle.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(size);
    handle.by_ref().take(size as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::testing::ScriptedArchive;
    use crate::stage::{RetrievalCoordinator, StagingPolicy};
    use std::time::Duration;

    fn open_handle(cache: &std::path::Path, archive: &Arc<ScriptedArchive>, remote: &str) -> CachedFileHandle {
        let coordinator = Arc::new(RetrievalCoordinator::new(archive.clone()));
        let policy = StagingPolicy {
            delay: Duration::from_millis(0),
            permissions: 0o644,
            ..StagingPolicy::default()
        };
        CachedFileHandle::open(coordinator, cache, remote, "rb", &policy).unwrap()
    }

    #[test]
    fn test_open_and_close() {
        let cache = tempfile::tempdir().unwrap();
        let archive = ScriptedArchive::with_files(&[("/a/1.dat", "0123456789")]);
        let mut table = HandleTable::new();

        let fh1 = table.open(2, "/a/1.dat".to_string(), open_handle(cache.path(), &archive, "/a/1.dat"));
        let fh2 = table.open(2, "/a/1.dat".to_string(), open_handle(cache.path(), &archive, "/a/1.dat"));
        assert_ne!(fh1, fh2);
        assert_eq!(table.len(), 2);

        let closed = table.close(fh1).unwrap();
        assert_eq!(closed.path, "/a/1.dat");
        assert!(table.get(fh1).is_none());
        assert!(table.close(fh1).is_none());
        assert_eq!(table.len(), 1);
        assert!(archive.copies().is_empty());
    }

    #[test]
    fn test_close_does_not_wait_for_busy_handle() {
        let cache = tempfile::tempdir().unwrap();
        let archive = ScriptedArchive::with_files(&[("/a/1.dat", "0123456789")]);
        let mut table = HandleTable::new();
        let fh = table.open(2, "/a/1.dat".to_string(), open_handle(cache.path(), &archive, "/a/1.dat"));

        // A read in flight holds the handle's lock
        let busy = Arc::clone(&table.get(fh).unwrap().handle);
        let guard = busy.lock().unwrap();

        let closed = table.close(fh).unwrap();
        assert!(table.is_empty());
        assert!(guard.is_pending());
        drop(guard);

        drop(closed);
        assert!(busy.lock().unwrap().is_pending());
        drop(busy);
        assert!(archive.copies().is_empty());
    }

    #[test]
    fn test_read_at_stages_and_reads_ranges() {
        let cache = tempfile::tempdir().unwrap();
        let archive = ScriptedArchive::with_files(&[("/a/1.dat", "0123456789")]);
        let mut handle = open_handle(cache.path(), &archive, "/a/1.dat");

        assert_eq!(read_at(&mut handle, 2, 3).unwrap(), b"234");
        assert_eq!(read_at(&mut handle, 8, 10).unwrap(), b"89");
        assert_eq!(read_at(&mut handle, 0, 1).unwrap(), b"0");
        assert!(read_at(&mut handle, 20, 4).unwrap().is_empty());
        assert_eq!(archive.copies().len(), 1);
    }

    #[test]
    fn test_read_at_reports_staging_failure() {
        let cache = tempfile::tempdir().unwrap();
        let archive = ScriptedArchive::with_files(&[("/a/1.dat", "x")]);
        archive.fail_on("/a/1.dat");
        let mut handle = open_handle(cache.path(), &archive, "/a/1.dat");

        let err = read_at(&mut handle, 0, 1).unwrap_err();
        assert_eq!(crate::ecfs::io_errno(&err), libc::EIO);
    }
}
