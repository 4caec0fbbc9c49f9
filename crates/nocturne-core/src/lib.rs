//! NOCTURNE core library
//!
//! A storage engine for sensitive records that must be forgotten on a
//! schedule and leave verifiable evidence behind:
//!
//! - [`address`]: content-derived record ids
//! - [`store`]: records, tombstones, queries and export
//! - [`ledger`] / [`merkle`]: append-only ledger hashed into a Merkle tree
//! - [`policy`]: pure keep/forget decisions
//! - [`coordinator`]: sweeps that forget records and issue signed proofs
//! - [`proof`]: proof signing and store-free verification
//! - [`engine`]: everything wired over memory or filesystem backends

pub mod address;
pub mod api;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod engine;
pub mod ledger;
pub mod merkle;
pub mod metrics;
pub mod obs;
pub mod policy;
pub mod proof;
pub mod store;
pub mod telemetry;
pub mod timeout;

pub use address::{address_of, digest_of, lineage_id, validate_metadata};
pub use api::{
    DeleteRequest, DeleteResponse, DeleteStatus, ErrorResponse, ExportRequest, IngestPayload,
    IngestResponse, QueryRequest, RecordView, VerifyRequest, VerifyResponse,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use coordinator::{ForgetCoordinator, RecoveryReport, SweepCancel, SweepIssue, SweepSummary};
pub use domain::{
    canonical_bytes, canonical_json, compute_digest, ErrorKind, NocturneError, ProofRejection,
    Result,
};
pub use engine::Engine;
pub use ledger::MerkleLedger;
pub use merkle::{InclusionPath, MerkleTree};
pub use policy::{
    evaluate, evaluate_with, Decision, NoRiskSignal, Policy, RiskScore, RiskSignalSource, Signals,
    Strategy,
};
pub use proof::{
    decode_verifying_key, encode_verifying_key, is_valid_forget_proof, verify_forget_proof,
    ProofSigner,
};
pub use store::{
    DeleteOutcome, ExportFormat, ForgetLane, IngestOutcome, IngestRequest, IngestStatus,
    RecordCursor, RecordQuery, RecordStore, StoreOptions,
};

pub use nocturne_state::{
    ContentDigest, ForgetProof, LedgerEntry, LedgerEvent, MerkleHash, Metadata, MetadataValue,
    ProofId, Record, RecordId, Slot, Tombstone,
};

pub use metrics::METRICS;
pub use telemetry::{init_from_env, init_tracing};

/// NOCTURNE version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
