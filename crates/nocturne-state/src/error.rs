//! Error types for nocturne-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested key is absent from the backend
    #[error("not found: {key}")]
    NotFound { key: String },

    /// Hex string is not a valid 32-byte digest
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Attempt to overwrite an immutable item (issued proof, tombstone)
    #[error("refusing to overwrite immutable {key}")]
    Immutable { key: String },

    /// Persisted data could not be decoded
    #[error("corrupt data in {location}: {reason}")]
    Corrupt { location: String, reason: String },
}

impl StorageError {
    /// Whether retrying the same write may succeed.
    ///
    /// Only I/O failures qualify; decode and lookup failures are deterministic.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidData
                    | std::io::ErrorKind::InvalidInput
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let interrupted = StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "signal",
        ));
        assert!(interrupted.is_transient());

        let denied = StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "ro",
        ));
        assert!(!denied.is_transient());

        let missing = StorageError::NotFound { key: "x".into() };
        assert!(!missing.is_transient());
    }

    #[test]
    fn test_display() {
        let err = StorageError::Corrupt {
            location: "ledger.jsonl:3".into(),
            reason: "truncated".into(),
        };
        assert!(err.to_string().contains("ledger.jsonl:3"));
        assert!(err.to_string().contains("truncated"));
    }
}
