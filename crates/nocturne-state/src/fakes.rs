//! In-memory storage backends
//!
//! Provides `MemoryRecordTable`, `MemoryLedgerLog`, and `MemoryProofArchive`
//! that satisfy the trait contracts without touching the filesystem. Used for
//! in-memory engines and in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{ForgetProof, LedgerEntry, ProofId, RecordId, Slot};
use crate::storage_traits::*;

fn poisoned(what: &str) -> StorageError {
    StorageError::Corrupt {
        location: what.to_string(),
        reason: "lock poisoned".to_string(),
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordTable
// ---------------------------------------------------------------------------

/// In-memory record table backed by a `HashMap<id, Slot>`.
#[derive(Debug, Default)]
pub struct MemoryRecordTable {
    slots: Mutex<HashMap<RecordId, Slot>>,
}

impl MemoryRecordTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordTable for MemoryRecordTable {
    async fn put(&self, slot: &Slot) -> StorageResult<()> {
        let mut slots = self.slots.lock().map_err(|_| poisoned("records"))?;
        if let Some(Slot::Tombstoned(existing)) = slots.get(slot.id()) {
            if Slot::Tombstoned(existing.clone()) != *slot {
                return Err(StorageError::Immutable {
                    key: format!("tombstone {}", slot.id()),
                });
            }
        }
        slots.insert(slot.id().clone(), slot.clone());
        Ok(())
    }

    async fn get(&self, id: &RecordId) -> StorageResult<Option<Slot>> {
        let slots = self.slots.lock().map_err(|_| poisoned("records"))?;
        Ok(slots.get(id).cloned())
    }

    async fn load_all(&self) -> StorageResult<Vec<Slot>> {
        let slots = self.slots.lock().map_err(|_| poisoned("records"))?;
        Ok(slots.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryLedgerLog
// ---------------------------------------------------------------------------

/// In-memory ledger log backed by a `Vec<LedgerEntry>`.
#[derive(Debug, Default)]
pub struct MemoryLedgerLog {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedgerLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerLog for MemoryLedgerLog {
    async fn append(&self, entry: &LedgerEntry) -> StorageResult<u64> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("ledger"))?;
        entries.push(entry.clone());
        Ok((entries.len() - 1) as u64)
    }

    async fn load_all(&self) -> StorageResult<Vec<LedgerEntry>> {
        let entries = self.entries.lock().map_err(|_| poisoned("ledger"))?;
        Ok(entries.clone())
    }

    async fn len(&self) -> StorageResult<u64> {
        let entries = self.entries.lock().map_err(|_| poisoned("ledger"))?;
        Ok(entries.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// MemoryProofArchive
// ---------------------------------------------------------------------------

/// In-memory proof archive backed by a `HashMap<ProofId, ForgetProof>`.
#[derive(Debug, Default)]
pub struct MemoryProofArchive {
    proofs: Mutex<HashMap<ProofId, ForgetProof>>,
}

impl MemoryProofArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProofArchive for MemoryProofArchive {
    async fn put(&self, proof: &ForgetProof) -> StorageResult<()> {
        let mut proofs = self.proofs.lock().map_err(|_| poisoned("proofs"))?;
        match proofs.get(&proof.proof_id) {
            Some(existing) if existing == proof => Ok(()),
            Some(_) => Err(StorageError::Immutable {
                key: format!("proof {}", proof.proof_id),
            }),
            None => {
                proofs.insert(proof.proof_id.clone(), proof.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, proof_id: &ProofId) -> StorageResult<ForgetProof> {
        let proofs = self.proofs.lock().map_err(|_| poisoned("proofs"))?;
        proofs
            .get(proof_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: format!("proof {proof_id}"),
            })
    }

    async fn list(&self) -> StorageResult<Vec<ForgetProof>> {
        let proofs = self.proofs.lock().map_err(|_| poisoned("proofs"))?;
        let mut all: Vec<ForgetProof> = proofs.values().cloned().collect();
        all.sort_by_key(|p| p.leaf_index);
        Ok(all)
    }
}
