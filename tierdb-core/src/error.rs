//! Error types for TierDB

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for TierDB operations
pub type Result<T> = std::result::Result<T, TierError>;

/// TierDB error types
#[derive(Error, Debug)]
pub enum TierError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected (manifest, WAL or table)
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Caller passed an argument the engine cannot honor
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not supported by this build or configuration
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A queued write or wait exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// The engine is temporarily unable to accept the request
    #[error("Busy: {0}")]
    Busy(String),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// The database is closing
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Latched background error; every write fails with it until reopen
    #[error("Background error: {0}")]
    Background(Arc<TierError>),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TierError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TierError::Io(_) | TierError::Timeout | TierError::Busy(_) => true,
            TierError::Background(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        match self {
            TierError::Corruption(_)
            | TierError::ChecksumMismatch { .. }
            | TierError::InvalidFormat(_) => true,
            TierError::Background(inner) => inner.is_corruption(),
            _ => false,
        }
    }

    /// Check if the condition will not clear by retrying the same call
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    /// Check if error is the deadline-exceeded condition
    pub fn is_timeout(&self) -> bool {
        matches!(self, TierError::Timeout)
    }

    /// A copy of this error for another caller that shares the same failure
    /// (every writer folded into one failed write group gets one)
    pub(crate) fn duplicate(&self) -> TierError {
        match self {
            TierError::Io(e) => TierError::Io(std::io::Error::new(e.kind(), e.to_string())),
            TierError::Corruption(s) => TierError::Corruption(s.clone()),
            TierError::ChecksumMismatch { expected, actual } => TierError::ChecksumMismatch {
                expected: *expected,
                actual: *actual,
            },
            TierError::InvalidFormat(s) => TierError::InvalidFormat(s.clone()),
            TierError::InvalidArgument(s) => TierError::InvalidArgument(s.clone()),
            TierError::NotSupported(s) => TierError::NotSupported(s.clone()),
            TierError::Timeout => TierError::Timeout,
            TierError::Busy(s) => TierError::Busy(s.clone()),
            TierError::ColumnFamilyNotFound(s) => TierError::ColumnFamilyNotFound(s.clone()),
            TierError::ShutdownInProgress => TierError::ShutdownInProgress,
            TierError::Background(inner) => TierError::Background(Arc::clone(inner)),
            TierError::Internal(s) => TierError::Internal(s.clone()),
        }
    }
}

impl From<bincode::Error> for TierError {
    fn from(e: bincode::Error) -> Self {
        TierError::InvalidFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = TierError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let corrupt = TierError::Corruption("bad record".into());
        assert!(corrupt.is_terminal());
        assert!(corrupt.is_corruption());

        assert!(TierError::Timeout.is_retryable());
        assert!(TierError::Timeout.is_timeout());
        assert!(TierError::ShutdownInProgress.is_terminal());
    }

    #[test]
    fn test_background_error_delegates() {
        let latched = Arc::new(TierError::ChecksumMismatch {
            expected: 1,
            actual: 2,
        });
        let err = TierError::Background(latched.clone());
        assert!(err.is_corruption());
        assert!(err.is_terminal());

        let err = TierError::Background(Arc::new(TierError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "flush failed",
        ))));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("flush failed"));
    }

    #[test]
    fn test_duplicate_keeps_kind() {
        let io = TierError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        match io.duplicate() {
            TierError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected {:?}", other),
        }
        assert!(TierError::Timeout.duplicate().is_timeout());
    }
}
