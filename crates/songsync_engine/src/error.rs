//! Engine errors.
//!
//! Replication itself never fails loudly: conflicts are recorded as data and
//! lost messages are re-requested. Errors are reserved for misconfiguration,
//! a dead broker connection and the file system.

use songsync_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by the engine, its transports and its storage.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A payload could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted sync state is unreadable.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The author name cannot be embedded in version strings or topics.
    #[error("invalid author {0:?}: must be non-empty and free of ',', '/', '+' and '#'")]
    InvalidAuthor(String),

    /// A blob name is not a plain file name.
    #[error("invalid blob name {0:?}")]
    InvalidBlobName(String),

    /// A requested blob is missing or empty.
    #[error("blob {0:?} not available")]
    BlobUnavailable(String),

    /// The engine was closed.
    #[error("sync engine closed")]
    Closed,

    /// The client lost its broker connection.
    #[error("not connected to broker")]
    NotConnected,
}

impl SyncError {
    /// Returns true if repeating the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::NotConnected => true,
            SyncError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::NotConnected.is_retryable());
        assert!(SyncError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_retryable());
        assert!(!SyncError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_retryable());
        assert!(!SyncError::Closed.is_retryable());
        assert!(!SyncError::InvalidAuthor("a,b".into()).is_retryable());
        assert!(!SyncError::Persistence("corrupt".into()).is_retryable());
    }

    #[test]
    fn messages_name_the_culprit() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to broker");
        assert_eq!(
            SyncError::BlobUnavailable("cover.png".into()).to_string(),
            "blob \"cover.png\" not available"
        );

        let err: SyncError = ProtocolError::malformed_version("x").into();
        assert!(err.to_string().contains("malformed version"));
    }
}
