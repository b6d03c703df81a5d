//! Error types reported by the disk task and its collaborators.

use std::{fmt, io, path::PathBuf, sync::Arc};

use crate::PieceIndex;

/// An internal result type used by most fallible functions in the crate.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The top level error type for the disk task itself (as opposed to the
/// outcome of individual jobs, which is [`JobError`]).
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A channel between the disk task and the engine was unexpectedly
    /// closed. This usually means one of the halves was dropped during
    /// shutdown.
    Channel,
    /// The torrent id in a command does not refer to an allocated torrent.
    InvalidTorrentId,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Channel => write!(f, "disk channel error"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
        }
    }
}

impl std::error::Error for Error {}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

/// An error reported by the storage backend, carrying the offending path
/// when known.
#[derive(Debug)]
pub struct StorageError {
    /// The file the operation failed on, if the failure concerned one.
    pub path: Option<PathBuf>,
    /// The underlying IO error.
    pub source: io::Error,
}

impl StorageError {
    pub fn new(source: io::Error) -> Self {
        Self { path: None, source }
    }

    pub fn with_path(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: Some(path.into()),
            source,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "storage error on {:?}: {}", path, self.source),
            None => write!(f, "storage error: {}", self.source),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<io::Error> for StorageError {
    fn from(source: io::Error) -> Self {
        Self::new(source)
    }
}

impl From<nix::Error> for StorageError {
    fn from(e: nix::Error) -> Self {
        Self::new(
            e.as_errno()
                .map(|errno| io::Error::from_raw_os_error(errno as i32))
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, e)),
        )
    }
}

/// The error value carried by job completions.
///
/// Every waiter attached to a failed block range receives a clone of the
/// same error, which is why the backend error is reference counted.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum JobError {
    /// The buffer pool was exhausted and eviction could not free enough
    /// blocks.
    NoMemory,
    /// The storage backend reported a failure.
    Io(Arc<StorageError>),
    /// A read returned fewer bytes than requested without being at a
    /// legitimate end of file.
    FileTooShort,
    /// The job was cancelled by shutdown, a clear-piece, or a destructive
    /// operation that removed its target.
    Aborted,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of disk cache memory"),
            Self::Io(e) => e.fmt(f),
            Self::FileTooShort => write!(f, "file too short"),
            Self::Aborted => write!(f, "operation aborted"),
        }
    }
}

impl std::error::Error for JobError {}

impl From<StorageError> for JobError {
    fn from(e: StorageError) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Error type returned on failed torrent allocations.
#[derive(Debug)]
#[non_exhaustive]
pub enum NewTorrentError {
    /// The torrent entry already exists in the disk task.
    AlreadyExists,
    /// The torrent's storage could not be initialized.
    Storage(StorageError),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Storage(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for NewTorrentError {}

impl From<StorageError> for NewTorrentError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Error type returned when a piece index is out of bounds for a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPieceIndex(pub PieceIndex);

impl fmt::Display for InvalidPieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid piece index {}", self.0)
    }
}

impl std::error::Error for InvalidPieceIndex {}
