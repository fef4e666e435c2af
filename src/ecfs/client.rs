//! ECFS Archive Client
//!
//! Runs the archive command line tools (`els`, `ecp`) to list and stage files.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::errors::EcfsError;
use super::types::{parse_listing, ListingEntry};

/// URL scheme understood by the archive tools
const ARCHIVE_SCHEME: &str = "ec:";

/// Default listing tool
pub const DEFAULT_LIST_TOOL: &str = "els";

/// Default copy tool
pub const DEFAULT_COPY_TOOL: &str = "ecp";

/// Backoff between retries of a failed archive command
const BACKOFF_MS: [u64; 3] = [500, 1000, 2000];

/// The two archive operations the staging core depends on
///
/// Both calls block until the archive answers.
pub trait ArchivePrimitives: Send + Sync {
    /// List `path`, returning entries with absolute archive paths
    fn list(&self, path: &str, detail: bool, recursive: bool)
        -> Result<Vec<ListingEntry>, EcfsError>;

    /// Copy the archive file `remote_path` to `local_path`, creating parent directories
    fn copy(&self, remote_path: &str, local_path: &Path) -> Result<(), EcfsError>;
}

/// Subprocess-backed archive client
#[derive(Debug, Clone)]
pub struct EcfsClient {
    /// Listing binary
    list_tool: String,
    /// Copy binary
    copy_tool: String,
    /// Retries for retryable failures (0 disables retrying)
    max_retries: u32,
}

impl EcfsClient {
    /// Create a client using `els` and `ecp` from `PATH`
    pub fn new() -> Self {
        Self::with_tools(DEFAULT_LIST_TOOL, DEFAULT_COPY_TOOL, 0)
    }

    /// Create a client with custom tool binaries and retry count
    ///
    /// # Arguments
    /// * `list_tool` - Binary used for listings
    /// * `copy_tool` - Binary used for copies
    /// * `max_retries` - Additional attempts after a retryable failure
    pub fn with_tools(list_tool: &str, copy_tool: &str, max_retries: u32) -> Self {
        Self {
            list_tool: list_tool.to_string(),
            copy_tool: copy_tool.to_string(),
            max_retries,
        }
    }

    /// Execute an archive command with retry logic and fixed backoff
    fn with_retry<T, F>(&self, operation: &str, path: &str, f: F) -> Result<T, EcfsError>
    where
        F: Fn() -> Result<T, EcfsError>,
    {
        let mut attempt = 0;
        loop {
            match f() {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() || attempt >= self.max_retries => {
                    error!(operation = operation, path = path, error = %e, "Archive command failed");
                    return Err(e);
                }
                Err(e) => {
                    let delay = BACKOFF_MS
                        .get(attempt as usize)
                        .copied()
                        .unwrap_or(2000);
                    warn!(
                        operation = operation,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        delay_ms = delay,
                        error = %e,
                        "Retrying archive command"
                    );
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
            }
        }
    }

    /// Run a tool and turn its exit status and stderr into a result
    fn run(&self, path: &str, command: &mut Command) -> Result<String, EcfsError> {
        debug!(command = ?command, "Running archive command");
        let output = command
            .output()
            .map_err(|e| EcfsError::RetrievalFailed(format!("failed to run {:?}: {}", command, e)))?;
        check_output(path, output)
    }
}

impl Default for EcfsClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Any stderr text or a non-zero exit is an error
fn check_output(path: &str, output: Output) -> Result<String, EcfsError> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !stderr.trim().is_empty() {
        return Err(EcfsError::from_diagnostic(path, &stderr));
    }
    if !output.status.success() {
        let diagnostic = if stdout.trim().is_empty() {
            format!("exited with {}", output.status)
        } else {
            stdout
        };
        return Err(EcfsError::from_diagnostic(path, &diagnostic));
    }

    Ok(stdout)
}

impl ArchivePrimitives for EcfsClient {
    fn list(
        &self,
        path: &str,
        detail: bool,
        recursive: bool,
    ) -> Result<Vec<ListingEntry>, EcfsError> {
        if recursive {
            warn!(path = path, "Recursive listings of large archive trees may time out");
        }

        let stdout = self.with_retry("list", path, || {
            let mut command = Command::new(&self.list_tool);
            if detail {
                command.arg("-l");
            }
            if recursive {
                command.arg("-R");
            }
            command.arg(format!("{}{}", ARCHIVE_SCHEME, path));
            self.run(path, &mut command)
        })?;

        let entries = parse_listing(path, &stdout, detail);
        debug!(path = path, count = entries.len(), recursive = recursive, "Listed archive path");
        Ok(entries)
    }

    fn copy(&self, remote_path: &str, local_path: &Path) -> Result<(), EcfsError> {
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)?;
        }

        self.with_retry("copy", remote_path, || {
            let mut command = Command::new(&self.copy_tool);
            command
                .arg(format!("{}{}", ARCHIVE_SCHEME, remote_path))
                .arg(local_path);
            self.run(remote_path, &mut command).map(|_| ())
        })?;

        info!(remote = remote_path, local = %local_path.display(), "Copied file from archive");
        Ok(())
    }
}
