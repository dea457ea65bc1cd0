//! Error types for the arcfs kernel.
//!
//! All fallible kernel operations return a [`FsResult<T>`], an alias for
//! `Result<T, FsError>`. The variants fall into three groups:
//!
//! - **Surface errors** (`NoSuchEntry`, `AlreadyExists`, `ReadOnly`, ...)
//!   are reported to the caller unchanged.
//! - **Control-flow errors** (`NeedsWriteLock`, `NeedsLockRetry`,
//!   `FalsePositive`, `PersistentFalsePositive`) coordinate the controller
//!   decorator stack and must never escape it; [`FsError::is_control_flow`]
//!   identifies them.
//! - **Sync busy conditions** (`CurrentThreadBusy`, `ThreadsBusy`) are
//!   produced by the resource accountant during `sync` and end up inside a
//!   composite [`FsSyncError`].
//!
//! [`FsSyncError`]: crate::sync::FsSyncError

/// Result type alias for kernel operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Error kinds for file system operations.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// A URI could not be parsed into a mount point, path or entry name.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// The addressed entry does not exist.
    #[error("no such entry: {0:?}")]
    NoSuchEntry(String),

    /// The entry exists and the operation required that it does not.
    #[error("entry already exists: {0:?}")]
    AlreadyExists(String),

    /// A path component exists but is not a directory.
    #[error("not a directory: {0:?}")]
    NotDirectory(String),

    /// The entry is a directory and the operation requires a non-directory.
    #[error("is a directory: {0:?}")]
    IsDirectory(String),

    /// A directory could not be removed because it has children.
    #[error("directory not empty: {0:?}")]
    DirectoryNotEmpty(String),

    /// The file system or entry is read-only.
    #[error("read-only: {0:?}")]
    ReadOnly(String),

    /// The requested access is not permitted.
    #[error("access denied: {0:?}")]
    AccessDenied(String),

    /// No key is available for an encrypted archive, or the key is wrong.
    #[error("invalid or missing key for {0}")]
    BadKey(String),

    /// An encrypted archive failed its integrity check.
    #[error("authentication failed for {0}")]
    AuthenticationFailed(String),

    /// The target looks like an archive by name but not by content.
    ///
    /// Control flow only: the outermost controller reroutes the operation
    /// to the parent file system. The probe may be repeated on the next
    /// operation.
    #[error("false positive archive")]
    FalsePositive(#[source] Box<FsError>),

    /// Like [`FsError::FalsePositive`], but cached on the file system model
    /// until the next sync.
    #[error("persistent false positive archive")]
    PersistentFalsePositive(#[source] Box<FsError>),

    /// An entry is busy with other I/O, e.g. an output stream is already
    /// open for it.
    #[error("entry is busy: {0:?}")]
    BusyResource(String),

    /// Sync found open resources owned by the calling thread.
    #[error("{0} open I/O resource(s) owned by the current thread")]
    CurrentThreadBusy(usize),

    /// Sync timed out waiting for open resources owned by other threads.
    #[error("{total} open I/O resource(s), {local} of them owned by the current thread")]
    ThreadsBusy { total: usize, local: usize },

    /// Control flow only: the operation must be re-issued under the write
    /// lock of the same file system.
    #[error("operation needs the write lock")]
    NeedsWriteLock,

    /// Control flow only: all locks must be released and the operation
    /// retried from the top of the controller stack.
    #[error("operation needs a lock retry")]
    NeedsLockRetry,

    /// The archive container is structurally damaged.
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    /// The operation is not supported by this controller or driver.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// An I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Returns true for variants that coordinate the decorator stack and
    /// must never surface to user code.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            FsError::NeedsWriteLock
                | FsError::NeedsLockRetry
                | FsError::FalsePositive(_)
                | FsError::PersistentFalsePositive(_)
        )
    }

    /// Returns true for both false-positive variants.
    pub fn is_false_positive(&self) -> bool {
        matches!(
            self,
            FsError::FalsePositive(_) | FsError::PersistentFalsePositive(_)
        )
    }

    /// Returns true for the busy conditions raised by the resource
    /// accountant during sync.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            FsError::BusyResource(_)
                | FsError::CurrentThreadBusy(_)
                | FsError::ThreadsBusy { .. }
        )
    }

    /// Wraps this error as a transient false positive.
    pub fn into_false_positive(self) -> FsError {
        FsError::FalsePositive(Box::new(self))
    }

    /// Wraps this error as a false positive that is cached until sync.
    pub fn into_persistent_false_positive(self) -> FsError {
        FsError::PersistentFalsePositive(Box::new(self))
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Io(e) => e,
            FsError::NoSuchEntry(_) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, err.to_string())
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_flow_classification() {
        assert!(FsError::NeedsWriteLock.is_control_flow());
        assert!(FsError::NeedsLockRetry.is_control_flow());
        assert!(FsError::NoSuchEntry("x".into())
            .into_false_positive()
            .is_control_flow());
        assert!(!FsError::ReadOnly("x".into()).is_control_flow());
        assert!(!FsError::CurrentThreadBusy(1).is_control_flow());
    }

    #[test]
    fn test_busy_classification() {
        assert!(FsError::CurrentThreadBusy(1).is_busy());
        assert!(FsError::ThreadsBusy { total: 2, local: 0 }.is_busy());
        assert!(!FsError::NeedsLockRetry.is_busy());
    }

    #[test]
    fn test_io_error_round_trip() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let fs: FsError = io.into();
        let back: std::io::Error = fs.into();
        assert_eq!(back.kind(), std::io::ErrorKind::NotFound);
    }
}
