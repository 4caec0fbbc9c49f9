//! Nocturne-State: persistence for the NOCTURNE record engine
//!
//! This crate provides the persistence layer for the trauma record engine:
//! the record table, the append-only ledger log, and the proof archive.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durable slots, append-only history, immutable evidence.
//!
//! ## Key Components
//!
//! - `Slot`: a live `Record` or its `Tombstone`, one per `RecordId`
//! - `LedgerEntry`: an `inserted` / `forgotten` event in the ledger log
//! - `ForgetProof`: signed evidence of a deletion, kept forever
//! - `fakes`: in-memory backends, `fs`: filesystem backends

mod error;
pub mod fakes;
pub mod fs;
pub mod schema;
pub mod storage_traits;

pub use error::StorageError;
pub use schema::{
    tags_of, ContentDigest, ForgetProof, LedgerEntry, LedgerEvent, MerkleHash, Metadata,
    MetadataValue, ProofId, Record, RecordId, Slot, Tombstone, TAGS_KEY,
};
pub use storage_traits::{LedgerLog, ProofArchive, RecordTable, StorageResult};
