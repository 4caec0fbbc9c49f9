//! MerkleLedger: the append-only, hashed history of every insert and forget.
//!
//! Appends are serialized process-wide behind one async mutex: the log write,
//! the tree extension and the root-history push happen as one step, so leaf
//! indices and roots are globally ordered. That step runs on its own task and
//! completes even if the caller stops waiting for it. Readers see the tree
//! through a separate lock that is never held across a log write, so a slow
//! backend delays appends but never reads. Entries are never removed, even
//! when the record they describe has since been forgotten.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use nocturne_state::{LedgerEntry, LedgerEvent, LedgerLog, MerkleHash, RecordId, StorageError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::error::{NocturneError, Result};
use crate::merkle::{leaf_hash, InclusionPath, MerkleTree};

struct LedgerState {
    entries: Vec<LedgerEntry>,
    tree: MerkleTree,
    /// `roots[n - 1]` is the root after `n` entries.
    roots: Vec<MerkleHash>,
    /// Ids with an `inserted` entry.
    inserted: HashSet<RecordId>,
}

impl LedgerState {
    fn push(&mut self, entry: LedgerEntry, leaf: MerkleHash) -> u64 {
        let leaf_index = self.tree.push(leaf);
        self.roots.push(self.tree.root());
        if entry.event == LedgerEvent::Inserted {
            self.inserted.insert(entry.record_id.clone());
        }
        self.entries.push(entry);
        leaf_index
    }
}

/// Append-only Merkle ledger backed by a [`LedgerLog`].
pub struct MerkleLedger {
    log: Arc<dyn LedgerLog>,
    /// Held for the whole of one append, log write included.
    appends: Arc<Mutex<()>>,
    state: Arc<RwLock<LedgerState>>,
}

impl MerkleLedger {
    /// Open the ledger, replaying every persisted entry into the tree.
    pub async fn open(log: Arc<dyn LedgerLog>) -> Result<Self> {
        let persisted = log.load_all().await?;
        let mut state = LedgerState {
            entries: Vec::with_capacity(persisted.len()),
            tree: MerkleTree::new(),
            roots: Vec::with_capacity(persisted.len()),
            inserted: HashSet::new(),
        };
        for entry in persisted {
            let leaf = leaf_hash(&entry)?;
            state.push(entry, leaf);
        }
        info!(entries = state.entries.len(), root = %state.tree.root(), "ledger replayed");

        Ok(Self {
            log,
            appends: Arc::new(Mutex::new(())),
            state: Arc::new(RwLock::new(state)),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Append an entry and extend the tree. Returns the entry's leaf index.
    pub async fn append(&self, entry: LedgerEntry) -> Result<u64> {
        let leaf = leaf_hash(&entry)?;
        let log = self.log.clone();
        let appends = self.appends.clone();
        let state = self.state.clone();

        let task = tokio::spawn(async move {
            let _serialized = appends.lock_owned().await;
            let persisted_at = log.append(&entry).await?;

            let mut state = state.write().unwrap_or_else(|p| p.into_inner());
            if persisted_at != state.tree.len() {
                return Err(NocturneError::from(StorageError::Corrupt {
                    location: "ledger".to_string(),
                    reason: format!(
                        "log index {persisted_at} != tree size {}",
                        state.tree.len()
                    ),
                }));
            }
            let leaf_index = state.push(entry, leaf);
            debug!(leaf_index, root = %state.tree.root(), "ledger entry appended");
            Ok(leaf_index)
        });
        task.await.map_err(|err| {
            NocturneError::from(StorageError::Io(std::io::Error::other(format!(
                "ledger append task failed: {err}"
            ))))
        })?
    }

    /// Whether `id` has an `inserted` entry.
    pub async fn has_inserted(&self, id: &RecordId) -> bool {
        self.read().inserted.contains(id)
    }

    /// Root after the most recent append (all zeros when empty).
    pub async fn current_root(&self) -> MerkleHash {
        self.read().tree.root()
    }

    pub async fn len(&self) -> u64 {
        self.read().tree.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sibling chain from `leaf_index` to the current root.
    pub async fn prove_inclusion(&self, leaf_index: u64) -> Result<InclusionPath> {
        self.read()
            .tree
            .path(leaf_index)
            .ok_or_else(|| NocturneError::not_found(format!("ledger leaf {leaf_index}")))
    }

    /// Sibling chain from `leaf_index` to the root of the first `tree_size`
    /// entries.
    pub async fn prove_inclusion_at(&self, leaf_index: u64, tree_size: u64) -> Result<InclusionPath> {
        self.read().tree.path_at(leaf_index, tree_size).ok_or_else(|| {
            NocturneError::not_found(format!("ledger leaf {leaf_index} at size {tree_size}"))
        })
    }

    /// Root the ledger had when it held `tree_size` entries.
    pub async fn root_at(&self, tree_size: u64) -> Option<MerkleHash> {
        if tree_size == 0 {
            return Some(MerkleHash::ZERO);
        }
        self.read().roots.get(tree_size as usize - 1).copied()
    }

    /// Every root the ledger has had, oldest first.
    pub async fn root_history(&self) -> Vec<MerkleHash> {
        self.read().roots.clone()
    }

    pub async fn entry_at(&self, leaf_index: u64) -> Option<LedgerEntry> {
        self.read().entries.get(leaf_index as usize).cloned()
    }

    /// Recompute `root` from `entry` and `path` without consulting any
    /// ledger state.
    pub fn verify(entry: &LedgerEntry, path: &InclusionPath, root: &MerkleHash) -> bool {
        match leaf_hash(entry) {
            Ok(leaf) => path.root_for(leaf).as_ref() == Some(root),
            Err(_) => false,
        }
    }
}
