//! Error types for replio
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for replio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for replio
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object metadata not found: {fqn}")]
    MetaNotFound { fqn: String },

    #[error("bad data checksum: expected [{expected}], got [{got}]")]
    BadDataChecksum { expected: String, got: String },

    // Replica errors
    #[error("{lom}(num: {num}): copy {copy} does not exist")]
    CopyDoesNotExist { lom: String, num: usize, copy: String },

    // Mountpath errors
    #[error("no mountpath found for: {0}")]
    MpathNotFound(String),

    #[error("no available mountpaths")]
    NoMountpaths,

    // Bucket errors
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket {0} does not exist anymore")]
    BucketNought(String),

    // Async task errors
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("task {0} is gone")]
    TaskGone(String),

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// errno values that indicate storage misbehavior severe enough to run
/// the filesystem health checker against the offending path
const IO_ERRNOS: [i32; 10] = [
    libc::EIO,
    libc::ENOTDIR,
    libc::EBUSY,
    libc::ENXIO,
    libc::EBADF,
    libc::ENODEV,
    libc::EROFS,
    libc::EDQUOT,
    libc::ESTALE,
    libc::ENOSPC,
];

impl Error {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error was generated by an I/O operation and is
    /// severe enough to warrant mountpath health testing
    #[must_use]
    pub fn is_io_error(&self) -> bool {
        let Self::Io(err) = self else {
            return false;
        };
        if err.kind() == std::io::ErrorKind::WriteZero {
            // short write
            return true;
        }
        match err.raw_os_error() {
            Some(errno) => IO_ERRNOS.contains(&errno),
            None => false,
        }
    }

    /// Check if this is a missing-metadata error ("load failed, try restore")
    #[must_use]
    pub fn is_meta_not_found(&self) -> bool {
        matches!(self, Self::MetaNotFound { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::MetaNotFound { .. }
                | Self::BucketNotFound(_)
                | Self::TaskNotFound(_)
                | Self::MpathNotFound(_)
        ) || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Check if the bucket disappeared under a running operation
    #[must_use]
    pub fn is_bucket_nought(&self) -> bool {
        matches!(self, Self::BucketNought(_))
    }

    /// Check if a task was evicted between renewal and use (retried once
    /// by the dispatcher)
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::TaskGone(_))
    }

    /// Get the HTTP status code to surface this error with
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::CopyDoesNotExist { .. } | Self::BadDataChecksum { .. } => 400,

            Self::MetaNotFound { .. }
            | Self::BucketNotFound(_)
            | Self::TaskNotFound(_)
            | Self::MpathNotFound(_) => 404,

            Self::BucketNought(_) | Self::TaskGone(_) => 410,

            Self::NoMountpaths => 503,

            Self::Io(_) | Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_classification() {
        let enospc = Error::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(enospc.is_io_error());

        let erofs = Error::Io(io::Error::from_raw_os_error(libc::EROFS));
        assert!(erofs.is_io_error());

        let short = Error::Io(io::Error::new(io::ErrorKind::WriteZero, "short write"));
        assert!(short.is_io_error());

        let not_found = Error::Io(io::Error::from_raw_os_error(libc::ENOENT));
        assert!(!not_found.is_io_error());

        assert!(!Error::internal("nope").is_io_error());
    }

    #[test]
    fn test_not_found() {
        assert!(Error::BucketNotFound("b".into()).is_not_found());
        assert!(Error::MetaNotFound { fqn: "x".into() }.is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(Error::invalid_request("x").http_status_code(), 400);
        assert_eq!(Error::TaskNotFound("u".into()).http_status_code(), 404);
        assert_eq!(Error::BucketNought("b".into()).http_status_code(), 410);
        assert_eq!(Error::internal("x").http_status_code(), 500);
    }
}
