//! Error types for kqnotify
//!
//! Every fallible operation of the library returns [`Result`]. The variants
//! follow the errno values an inotify caller would see, see [`Error::errno`].

use std::io;

use thiserror::Error;

/// Result type for kqnotify - convenience wrapper around Result<T, Error>
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Path or watch descriptor unknown
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Descriptor or memory limits hit
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation against a session or watch that was already torn down
    #[error("Already closed")]
    AlreadyClosed,

    /// Directory could not be enumerated; retried on the next scan
    #[error("Listing failed: {0}")]
    ListingFailed(String),

    /// Internal invariant broken, fatal to the worker
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("IO error: {0}")]
    Io(io::Error),
}

impl Error {
    /// The errno an inotify caller gets for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::ResourceExhausted(_) => libc::ENOSPC,
            Self::AlreadyClosed => libc::EBADF,
            Self::ListingFailed(_) => libc::EIO,
            Self::ProtocolViolation(_) => libc::EIO,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Attach the offending path (or watch) to an I/O failure.
    pub(crate) fn from_io(err: io::Error, what: impl std::fmt::Display) -> Self {
        let what = what.to_string();
        match err.raw_os_error() {
            Some(libc::ENOENT) => Self::NotFound(what),
            Some(libc::EACCES) | Some(libc::EPERM) => Self::PermissionDenied(what),
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) | Some(libc::ENOSPC) => {
                Self::ResourceExhausted(format!("{what}: {err}"))
            }
            Some(libc::ENOTDIR) => Self::NotADirectory(what),
            _ => Self::Io(err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let what = err.to_string();
        Self::from_io(err, what)
    }
}
