//! Cached File Handle
//!
//! A read-only handle on an archive file. Opening never blocks on the archive:
//! if the file is missing from the local cache the handle queues a retrieval
//! request and stays pending until the first positional or read call, which
//! waits out the batching window, drains the coordinator and opens the staged copy.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use filetime::FileTime;
use tracing::{debug, warn};

use super::coordinator::RetrievalCoordinator;
use super::queue::{RetrievalRequest, Ticket};
use crate::ecfs::EcfsError;

/// How a handle reads its staged file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Binary,
    Text,
}

impl OpenMode {
    /// Parse a mode string such as `rb`, `r` or `rt`
    ///
    /// Anything that could write (`w`, `a`, `x`, `+`) is rejected.
    pub fn parse(mode: &str) -> Result<Self, EcfsError> {
        if !mode.contains('r') || mode.chars().any(|c| !matches!(c, 'r' | 'b' | 't')) {
            return Err(EcfsError::write_unsupported());
        }
        match (mode.contains('b'), mode.contains('t')) {
            (true, true) => Err(EcfsError::UnsupportedOperation(format!(
                "mode '{}' mixes binary and text",
                mode
            ))),
            (true, false) => Ok(OpenMode::Binary),
            (false, _) => Ok(OpenMode::Text),
        }
    }
}

/// Cache policies applied when a handle is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPolicy {
    /// Stage again even if the cached copy exists
    pub override_existing: bool,
    /// Refresh the mtime of an existing cached copy
    pub touch: bool,
    /// Permission bits of staged files
    pub permissions: u32,
    /// Batching window before a drain
    pub delay: Duration,
}

impl Default for StagingPolicy {
    fn default() -> Self {
        Self {
            override_existing: false,
            touch: true,
            permissions: 0o3777,
            delay: Duration::from_secs(2),
        }
    }
}

enum HandleState {
    /// Queued under this ticket, no local descriptor yet
    Pending(Ticket),
    Staged(BufReader<File>),
    /// Staging failed; the handle cannot be used again
    Failed(String),
    Closed,
}

/// Local cache path mirroring `remote_path` under `cache_root`
pub fn mirror_path(cache_root: &Path, remote_path: &str) -> PathBuf {
    cache_root.join(remote_path.trim_start_matches('/'))
}

/// Read-only handle on one archive file
pub struct CachedFileHandle {
    remote_path: String,
    local_path: PathBuf,
    mode: OpenMode,
    policy: StagingPolicy,
    coordinator: Arc<RetrievalCoordinator>,
    state: HandleState,
}

impl CachedFileHandle {
    /// Open `remote_path`, staging it under `cache_root` on first use
    ///
    /// # Arguments
    /// * `coordinator` - Coordinator shared by every handle that should batch together
    /// * `cache_root` - Root of the local cache
    /// * `remote_path` - Absolute archive path
    /// * `mode` - Read mode string; write modes fail before anything is queued
    /// * `policy` - Override, touch, permission and delay settings
    pub fn open(
        coordinator: Arc<RetrievalCoordinator>,
        cache_root: &Path,
        remote_path: &str,
        mode: &str,
        policy: &StagingPolicy,
    ) -> Result<Self, EcfsError> {
        let mode = OpenMode::parse(mode)?;
        let local_path = mirror_path(cache_root, remote_path);

        let state = if !local_path.exists() || policy.override_existing {
            let destination_dir = local_path
                .parent()
                .unwrap_or(cache_root)
                .to_path_buf();
            let ticket = coordinator.enqueue(RetrievalRequest {
                remote_path: remote_path.to_string(),
                destination_dir,
                permissions: policy.permissions,
            });
            debug!(remote = remote_path, ticket = ticket, "Queued file for staging");
            HandleState::Pending(ticket)
        } else {
            if policy.touch {
                filetime::set_file_mtime(&local_path, FileTime::now())?;
            }
            debug!(remote = remote_path, local = %local_path.display(), "File cache HIT");
            HandleState::Staged(BufReader::new(File::open(&local_path)?))
        };

        Ok(Self {
            remote_path: remote_path.to_string(),
            local_path,
            mode,
            policy: policy.clone(),
            coordinator,
            state,
        })
    }

    /// Local path once staged, the archive path before
    pub fn name(&self) -> &str {
        match self.state {
            HandleState::Staged(_) => self.local_path.to_str().unwrap_or(&self.remote_path),
            _ => &self.remote_path,
        }
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_staged(&self) -> bool {
        matches!(self.state, HandleState::Staged(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, HandleState::Pending(_))
    }

    pub fn readable(&self) -> bool {
        true
    }

    pub fn seekable(&self) -> bool {
        true
    }

    pub fn writable(&self) -> bool {
        false
    }

    /// Path of the staged copy, staging it first if needed
    pub fn local_path(&mut self) -> Result<&Path, EcfsError> {
        self.ensure_staged()?;
        Ok(&self.local_path)
    }

    /// Current read position
    pub fn position(&mut self) -> Result<u64, EcfsError> {
        Ok(self.ensure_staged()?.stream_position()?)
    }

    /// Up to `size` bytes from the read buffer without consuming them
    ///
    /// `size == 0` returns whatever is buffered.
    pub fn peek(&mut self, size: usize) -> Result<Vec<u8>, EcfsError> {
        let buffer = self.ensure_staged()?.fill_buf()?;
        let len = if size == 0 { buffer.len() } else { size.min(buffer.len()) };
        Ok(buffer[..len].to_vec())
    }

    /// Read the rest of a text-mode handle as UTF-8
    pub fn read_text(&mut self) -> Result<String, EcfsError> {
        if self.mode == OpenMode::Binary {
            return Err(EcfsError::UnsupportedOperation(
                "handle was opened in binary mode".to_string(),
            ));
        }
        let mut text = String::new();
        self.ensure_staged()?.read_to_string(&mut text)?;
        Ok(text)
    }

    /// Release the local descriptor if one is open
    pub fn close(&mut self) {
        match self.state {
            HandleState::Staged(_) => debug!(remote = %self.remote_path, "Closed cached file handle"),
            HandleState::Pending(ticket) => self.coordinator.queue().abandon(ticket),
            _ => {}
        }
        self.state = HandleState::Closed;
    }

    /// Stage the file if still pending and return the open reader
    fn ensure_staged(&mut self) -> Result<&mut BufReader<File>, EcfsError> {
        if let HandleState::Pending(ticket) = self.state {
            match self.stage(ticket) {
                Ok(reader) => self.state = HandleState::Staged(reader),
                Err(e) => {
                    warn!(remote = %self.remote_path, error = %e, "Staging failed");
                    self.state = HandleState::Failed(e.to_string());
                    return Err(e);
                }
            }
        }

        match &mut self.state {
            HandleState::Staged(reader) => Ok(reader),
            HandleState::Failed(message) => Err(EcfsError::RetrievalFailed(message.clone())),
            HandleState::Closed => Err(EcfsError::Io(io::Error::other(
                "I/O operation on closed file",
            ))),
            HandleState::Pending(_) => Err(EcfsError::RetrievalFailed(format!(
                "{} is still pending",
                self.remote_path
            ))),
        }
    }

    fn stage(&self, ticket: Ticket) -> Result<BufReader<File>, EcfsError> {
        thread::sleep(self.policy.delay);
        let drained = self.coordinator.drain_and_stage();
        let queue = self.coordinator.queue();
        queue.wait_consumed(ticket);
        let failure = queue.take_failure(ticket);
        drained?;
        if let Some(message) = failure {
            return Err(EcfsError::RetrievalFailed(message));
        }

        match File::open(&self.local_path) {
            Ok(file) => {
                debug!(remote = %self.remote_path, local = %self.local_path.display(), "Opened staged file");
                Ok(BufReader::new(file))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(EcfsError::RetrievalFailed(
                format!("{} was not staged to {}", self.remote_path, self.local_path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for CachedFileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            HandleState::Pending(_) => "pending",
            HandleState::Staged(_) => "staged",
            HandleState::Failed(_) => "failed",
            HandleState::Closed => "closed",
        };
        f.debug_struct("CachedFileHandle")
            .field("remote_path", &self.remote_path)
            .field("local_path", &self.local_path)
            .field("mode", &self.mode)
            .field("state", &state)
            .finish()
    }
}

impl Read for CachedFileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.ensure_staged()?.read(buf)?)
    }
}

impl BufRead for CachedFileHandle {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Ok(self.ensure_staged()?.fill_buf()?)
    }

    fn consume(&mut self, amt: usize) {
        if let HandleState::Staged(reader) = &mut self.state {
            reader.consume(amt);
        }
    }
}

impl Seek for CachedFileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.ensure_staged()?.seek(pos)?)
    }
}

impl Write for CachedFileHandle {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(EcfsError::write_unsupported().into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CachedFileHandle {
    fn drop(&mut self) {
        self.close();
    }
}
