//! Domain-level error taxonomy for NOCTURNE.

use nocturne_state::StorageError;
use serde::{Deserialize, Serialize};

/// Why a forget proof failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ProofRejection {
    #[error("proof target does not match the record id")]
    TargetMismatch,

    #[error("proof entry is not a forgotten event")]
    NotAForgetEntry,

    #[error("proof entry digest does not match the record digest")]
    DigestMismatch,

    #[error("inclusion path does not reproduce the merkle root")]
    PathMismatch,

    #[error("merkle root is not a published root for the proof's tree size")]
    UnknownRoot,

    #[error("proof entry is not in the ledger at its leaf index")]
    NotInLedger,

    #[error("signature does not verify under the proof-signing key")]
    BadSignature,

    #[error("proof is malformed")]
    Malformed,
}

/// Fieldless mirror of [`NocturneError`] for summaries and error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyForgotten,
    InvalidProof,
    InsufficientSignal,
    UnsupportedStrategy,
    UnsupportedFormat,
    Timeout,
    InvalidPolicy,
    InvalidMetadata,
    InvalidConfig,
    Storage,
    Serialization,
    Signing,
}

/// NOCTURNE domain errors.
#[derive(Debug, thiserror::Error)]
pub enum NocturneError {
    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("record already forgotten: {id}")]
    AlreadyForgotten { id: String },

    #[error("invalid proof: {reason}")]
    InvalidProof { reason: ProofRejection },

    #[error("insufficient signal: {0}")]
    InsufficientSignal(String),

    #[error("unsupported strategy: {0}")]
    UnsupportedStrategy(String),

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("{op} timed out after {after_ms}ms")]
    Timeout { op: &'static str, after_ms: u64 },

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("signing error: {0}")]
    Signing(String),
}

impl NocturneError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NocturneError::NotFound { .. } => ErrorKind::NotFound,
            NocturneError::AlreadyForgotten { .. } => ErrorKind::AlreadyForgotten,
            NocturneError::InvalidProof { .. } => ErrorKind::InvalidProof,
            NocturneError::InsufficientSignal(_) => ErrorKind::InsufficientSignal,
            NocturneError::UnsupportedStrategy(_) => ErrorKind::UnsupportedStrategy,
            NocturneError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            NocturneError::Timeout { .. } => ErrorKind::Timeout,
            NocturneError::InvalidPolicy(_) => ErrorKind::InvalidPolicy,
            NocturneError::InvalidMetadata(_) => ErrorKind::InvalidMetadata,
            NocturneError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            NocturneError::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            NocturneError::Storage(_) => ErrorKind::Storage,
            NocturneError::Serialization(_) => ErrorKind::Serialization,
            NocturneError::Signing(_) => ErrorKind::Signing,
        }
    }

    pub(crate) fn not_found(id: impl ToString) -> Self {
        NocturneError::NotFound { id: id.to_string() }
    }

    pub(crate) fn already_forgotten(id: impl ToString) -> Self {
        NocturneError::AlreadyForgotten { id: id.to_string() }
    }
}

impl From<ProofRejection> for NocturneError {
    fn from(reason: ProofRejection) -> Self {
        NocturneError::InvalidProof { reason }
    }
}

/// Result type for NOCTURNE domain operations.
pub type Result<T> = std::result::Result<T, NocturneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_proof_display_carries_reason() {
        let err = NocturneError::from(ProofRejection::BadSignature);
        assert!(err.to_string().starts_with("invalid proof"));
        assert!(err.to_string().contains("signature"));
        assert_eq!(err.kind(), ErrorKind::InvalidProof);
    }

    #[test]
    fn test_storage_not_found_maps_to_not_found_kind() {
        let err = NocturneError::from(StorageError::NotFound {
            key: "proof p-1".into(),
        });
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = NocturneError::from(StorageError::Serialization("bad".into()));
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_timeout_is_distinct_from_not_found() {
        let err = NocturneError::Timeout {
            op: "forget",
            after_ms: 50,
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "forget timed out after 50ms");
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AlreadyForgotten).unwrap();
        assert_eq!(json, "\"already_forgotten\"");
        let json = serde_json::to_string(&ProofRejection::PathMismatch).unwrap();
        assert_eq!(json, "\"path_mismatch\"");
    }
}
