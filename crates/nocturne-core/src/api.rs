//! Request/response shapes a surrounding transport carries.
//!
//! Serde types only; transport, framing and authentication live outside the
//! engine. Byte payloads are base64 in JSON.

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use nocturne_state::schema::base64_bytes;
use nocturne_state::{ForgetProof, MerkleHash, Metadata, Record, RecordId};
use serde::{Deserialize, Serialize};

use crate::domain::error::{ErrorKind, NocturneError, ProofRejection};
use crate::proof::verify_forget_proof;
use crate::store::{DeleteOutcome, IngestOutcome, IngestRequest, IngestStatus, RecordQuery};

/// Body of an ingest call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub allow_recreate: bool,
}

impl From<IngestPayload> for IngestRequest {
    fn from(payload: IngestPayload) -> Self {
        IngestRequest::new(payload.content, payload.metadata).allow_recreate(payload.allow_recreate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub record_id: RecordId,
    pub status: IngestStatus,
}

impl From<IngestOutcome> for IngestResponse {
    fn from(outcome: IngestOutcome) -> Self {
        Self {
            record_id: outcome.id,
            status: outcome.status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    /// Exclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl From<QueryRequest> for RecordQuery {
    fn from(req: QueryRequest) -> Self {
        RecordQuery {
            tag: req.tag,
            start: req.start_date,
            end: req.end_date,
            limit: req.limit,
        }
    }
}

/// One query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub id: RecordId,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl From<Record> for RecordView {
    fn from(record: Record) -> Self {
        Self {
            id: record.id,
            content: record.content,
            metadata: record.metadata,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub id: RecordId,
    pub proof: ForgetProof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted_count: u32,
    pub status: DeleteStatus,
}

impl From<DeleteOutcome> for DeleteResponse {
    fn from(outcome: DeleteOutcome) -> Self {
        Self {
            deleted_count: outcome.deleted_count,
            status: DeleteStatus::Deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub format: String,
}

/// Public verification call: needs no store access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub proof: ForgetProof,
    /// Published roots; entry `n - 1` is the root after `n` ledger entries.
    pub root_history: Vec<MerkleHash>,
}

impl VerifyRequest {
    pub fn verify(&self, key: &VerifyingKey) -> VerifyResponse {
        match verify_forget_proof(&self.proof, key, &self.root_history) {
            Ok(()) => VerifyResponse {
                valid: true,
                reason: None,
            },
            Err(reason) => VerifyResponse {
                valid: false,
                reason: Some(reason),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ProofRejection>,
}

/// Error body carrying the taxonomy kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&NocturneError> for ErrorResponse {
    fn from(err: &NocturneError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
