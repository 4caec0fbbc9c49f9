//! Storage trait definitions for NOCTURNE
//!
//! These traits define the three persisted tables:
//! - `RecordTable`: one slot (live record or tombstone) per record id
//! - `LedgerLog`: the append-only ledger, in insertion order
//! - `ProofArchive`: issued forget proofs keyed by proof id
//!
//! All traits are async and backend-agnostic. In-memory implementations live
//! in `fakes`, filesystem implementations in `fs`.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{ForgetProof, LedgerEntry, ProofId, RecordId, Slot};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Record table keyed by `RecordId`.
///
/// Guarantees:
/// - `put` upserts the slot for `slot.id()`.
/// - A tombstoned slot is never overwritten; `put` returns
///   `StorageError::Immutable` instead.
#[async_trait]
pub trait RecordTable: Send + Sync {
    /// Insert or replace the slot for its id.
    async fn put(&self, slot: &Slot) -> StorageResult<()>;

    /// Fetch the slot for `id`, if any.
    async fn get(&self, id: &RecordId) -> StorageResult<Option<Slot>>;

    /// Load every slot (used when a store is opened).
    async fn load_all(&self) -> StorageResult<Vec<Slot>>;
}

/// Append-only ledger log.
///
/// Guarantees:
/// - `append` returns the entry's zero-based position, which equals the
///   number of entries before it.
/// - Entries are never removed or reordered.
#[async_trait]
pub trait LedgerLog: Send + Sync {
    /// Append an entry, returning its index.
    async fn append(&self, entry: &LedgerEntry) -> StorageResult<u64>;

    /// Load all entries in insertion order.
    async fn load_all(&self) -> StorageResult<Vec<LedgerEntry>>;

    /// Number of entries in the log.
    async fn len(&self) -> StorageResult<u64>;
}

/// Archive of issued proofs. Proofs are evidence and are retained forever.
///
/// Guarantees:
/// - `put` of an identical proof twice is a no-op.
/// - `put` of a different proof under an existing id returns
///   `StorageError::Immutable`.
#[async_trait]
pub trait ProofArchive: Send + Sync {
    /// Archive a proof.
    async fn put(&self, proof: &ForgetProof) -> StorageResult<()>;

    /// Retrieve a proof. Returns `StorageError::NotFound` if absent.
    async fn get(&self, proof_id: &ProofId) -> StorageResult<ForgetProof>;

    /// All archived proofs, ordered by ledger position.
    async fn list(&self) -> StorageResult<Vec<ForgetProof>>;
}
