//! ECFS Error Types
//!
//! Structured error handling for archive listing, staging and cached reads.
//! Maps archive tool diagnostics to specific error variants for retry and errno decisions.

use std::io;

/// ECFS error types
#[derive(Debug, thiserror::Error)]
pub enum EcfsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Retrieval failed: {0}")]
    RetrievalFailed(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Local cache I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Message used for every write attempt on the read-only archive
pub const WRITE_UNSUPPORTED: &str = "write mode is not supported";

impl EcfsError {
    /// Map an ECFS error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            EcfsError::NotFound(_) => libc::ENOENT,
            EcfsError::PermissionDenied(_) => libc::EACCES,
            EcfsError::RetrievalFailed(_) => libc::EIO,
            EcfsError::UnsupportedOperation(_) => libc::EROFS,
            EcfsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether this error is retryable
    ///
    /// Missing paths and refused access will not change between attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EcfsError::RetrievalFailed(_))
    }

    /// Shorthand for the error every write path returns
    pub fn write_unsupported() -> Self {
        EcfsError::UnsupportedOperation(WRITE_UNSUPPORTED.to_string())
    }

    /// Classify the diagnostic output of an archive tool
    ///
    /// # Arguments
    /// * `path` - Archive path the command operated on
    /// * `diagnostic` - Captured stderr (or a synthesized exit message)
    pub fn from_diagnostic(path: &str, diagnostic: &str) -> Self {
        let lowered = diagnostic.to_ascii_lowercase();
        if lowered.contains("no such file")
            || lowered.contains("not found")
            || lowered.contains("does not exist")
        {
            EcfsError::NotFound(path.to_string())
        } else if lowered.contains("permission denied") {
            EcfsError::PermissionDenied(path.to_string())
        } else {
            EcfsError::RetrievalFailed(format!("{}: {}", path, diagnostic.trim()))
        }
    }
}

/// Map an I/O error surfaced by a cached read to a libc errno
pub fn io_errno(err: &io::Error) -> i32 {
    if let Some(code) = err.raw_os_error() {
        return code;
    }
    match err.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::Unsupported => libc::EROFS,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        _ => libc::EIO,
    }
}

impl From<EcfsError> for io::Error {
    fn from(err: EcfsError) -> Self {
        match err {
            EcfsError::Io(e) => e,
            EcfsError::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, err),
            EcfsError::PermissionDenied(_) => io::Error::new(io::ErrorKind::PermissionDenied, err),
            EcfsError::UnsupportedOperation(_) => io::Error::new(io::ErrorKind::Unsupported, err),
            EcfsError::RetrievalFailed(_) => io::Error::other(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_classification() {
        let err = EcfsError::from_diagnostic("/a/1.dat", "els: /a/1.dat: No such file or directory");
        assert!(matches!(err, EcfsError::NotFound(ref p) if p == "/a/1.dat"));

        let err = EcfsError::from_diagnostic("/a", "ecp: Permission denied");
        assert!(matches!(err, EcfsError::PermissionDenied(_)));

        let err = EcfsError::from_diagnostic("/a", "tape drive offline\n");
        match err {
            EcfsError::RetrievalFailed(msg) => assert_eq!(msg, "/a: tape drive offline"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_errno_and_retry() {
        assert_eq!(EcfsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(EcfsError::write_unsupported().to_errno(), libc::EROFS);
        assert!(EcfsError::RetrievalFailed("x".into()).is_retryable());
        assert!(!EcfsError::PermissionDenied("x".into()).is_retryable());
    }

    #[test]
    fn test_io_conversion_keeps_kind() {
        let io_err: io::Error = EcfsError::write_unsupported().into();
        assert_eq!(io_err.kind(), io::ErrorKind::Unsupported);

        let io_err: io::Error = EcfsError::NotFound("/x".into()).into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
        assert_eq!(io_errno(&io_err), libc::ENOENT);

        let staged: io::Error = EcfsError::RetrievalFailed("/x: tape".into()).into();
        assert_eq!(io_errno(&staged), libc::EIO);
        assert_eq!(io_errno(&io::Error::from_raw_os_error(libc::ENOSPC)), libc::ENOSPC);
    }
}
