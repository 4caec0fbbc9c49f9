//! Filesystem storage backends
//!
//! Layout under a data directory:
//!
//! ```text
//! <root>/records/<first 2 hex chars>/<remaining hex chars>.json
//! <root>/ledger.jsonl
//! <root>/proofs/<proof id>.json
//! ```
//!
//! Record and proof files are written atomically (temp file in the same
//! directory, fsync, rename). The ledger is a newline-delimited JSON log; a
//! torn final line left by a crash is truncated when the log is opened.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::schema::{ForgetProof, LedgerEntry, ProofId, RecordId, Slot};
use crate::storage_traits::*;

/// Write `data` to `path` atomically: temp file in the same directory, then rename.
async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = path.parent().ok_or_else(|| StorageError::Corrupt {
        location: path.display().to_string(),
        reason: "path has no parent directory".to_string(),
    })?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

async fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn decode<T: serde::de::DeserializeOwned>(path: &Path, bytes: &[u8]) -> StorageResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
        location: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Collect `*.json` files directly inside `dir`, skipping temp files.
async fn json_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            out.push(path);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// FsRecordTable
// ---------------------------------------------------------------------------

/// Filesystem record table with git-style 2-char sharding.
pub struct FsRecordTable {
    records_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FsRecordTable {
    /// Open (creating if needed) `root/records/`.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let records_dir = root.as_ref().join("records");
        tokio::fs::create_dir_all(&records_dir).await?;
        Ok(Self {
            records_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn slot_path(&self, id: &RecordId) -> PathBuf {
        let hex = id.as_str();
        self.records_dir
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]))
    }

    async fn read_slot(&self, path: &Path) -> StorageResult<Option<Slot>> {
        match read_optional(path).await? {
            Some(bytes) => Ok(Some(decode(path, &bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RecordTable for FsRecordTable {
    async fn put(&self, slot: &Slot) -> StorageResult<()> {
        let path = self.slot_path(slot.id());
        // Serializes the read-check-write so a tombstone can't be raced over.
        let _guard = self.write_lock.lock().await;

        if let Some(existing @ Slot::Tombstoned(_)) = self.read_slot(&path).await? {
            if existing != *slot {
                return Err(StorageError::Immutable {
                    key: format!("tombstone {}", slot.id()),
                });
            }
        }

        let bytes = serde_json::to_vec_pretty(slot)?;
        write_atomic(&path, &bytes).await?;
        debug!(record_id = %slot.id().short(), live = slot.is_live(), "slot persisted");
        Ok(())
    }

    async fn get(&self, id: &RecordId) -> StorageResult<Option<Slot>> {
        self.read_slot(&self.slot_path(id)).await
    }

    async fn load_all(&self) -> StorageResult<Vec<Slot>> {
        let mut slots = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.records_dir).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            for path in json_files(&shard.path()).await? {
                let bytes = tokio::fs::read(&path).await?;
                slots.push(decode(&path, &bytes)?);
            }
        }
        Ok(slots)
    }
}

// ---------------------------------------------------------------------------
// FsLedgerLog
// ---------------------------------------------------------------------------

struct LogState {
    file: tokio::fs::File,
    len: u64,
}

/// Append-only newline-delimited JSON ledger log.
pub struct FsLedgerLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl FsLedgerLog {
    /// Open (creating if needed) `root/ledger.jsonl`.
    ///
    /// A final line without a trailing newline is a torn write and is
    /// truncated; any other undecodable line is reported as corruption.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        tokio::fs::create_dir_all(root.as_ref()).await?;
        let path = root.as_ref().join("ledger.jsonl");

        let bytes = read_optional(&path).await?.unwrap_or_default();
        let complete = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        if complete < bytes.len() {
            warn!(
                path = %path.display(),
                torn_bytes = bytes.len() - complete,
                "truncating torn ledger tail"
            );
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await?;
            file.set_len(complete as u64).await?;
            file.sync_all().await?;
        }

        let len = bytes[..complete]
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .count() as u64;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            state: Mutex::new(LogState { file, len }),
        })
    }
}

#[async_trait]
impl LedgerLog for FsLedgerLog {
    async fn append(&self, entry: &LedgerEntry) -> StorageResult<u64> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut state = self.state.lock().await;
        state.file.write_all(&line).await?;
        state.file.sync_data().await?;
        let index = state.len;
        state.len += 1;
        Ok(index)
    }

    async fn load_all(&self) -> StorageResult<Vec<LedgerEntry>> {
        // Hold the append lock so a concurrent append can't be half-read.
        let _state = self.state.lock().await;
        let bytes = read_optional(&self.path).await?.unwrap_or_default();
        bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_slice(line).map_err(|e| StorageError::Corrupt {
                    location: format!("{}:{}", self.path.display(), i + 1),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn len(&self) -> StorageResult<u64> {
        Ok(self.state.lock().await.len)
    }
}

// ---------------------------------------------------------------------------
// FsProofArchive
// ---------------------------------------------------------------------------

/// One JSON file per proof under `root/proofs/`.
pub struct FsProofArchive {
    proofs_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FsProofArchive {
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let proofs_dir = root.as_ref().join("proofs");
        tokio::fs::create_dir_all(&proofs_dir).await?;
        Ok(Self {
            proofs_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn proof_path(&self, proof_id: &ProofId) -> StorageResult<PathBuf> {
        let id = proof_id.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(StorageError::NotFound {
                key: format!("proof {id}"),
            });
        }
        Ok(self.proofs_dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl ProofArchive for FsProofArchive {
    async fn put(&self, proof: &ForgetProof) -> StorageResult<()> {
        let path = self.proof_path(&proof.proof_id)?;
        let _guard = self.write_lock.lock().await;

        if let Some(bytes) = read_optional(&path).await? {
            let existing: ForgetProof = decode(&path, &bytes)?;
            if existing == *proof {
                return Ok(());
            }
            return Err(StorageError::Immutable {
                key: format!("proof {}", proof.proof_id),
            });
        }

        let bytes = serde_json::to_vec_pretty(proof)?;
        write_atomic(&path, &bytes).await
    }

    async fn get(&self, proof_id: &ProofId) -> StorageResult<ForgetProof> {
        let path = self.proof_path(proof_id)?;
        match read_optional(&path).await? {
            Some(bytes) => decode(&path, &bytes),
            None => Err(StorageError::NotFound {
                key: format!("proof {proof_id}"),
            }),
        }
    }

    async fn list(&self) -> StorageResult<Vec<ForgetProof>> {
        let mut proofs = Vec::new();
        for path in json_files(&self.proofs_dir).await? {
            let bytes = tokio::fs::read(&path).await?;
            proofs.push(decode::<ForgetProof>(&path, &bytes)?);
        }
        proofs.sort_by_key(|p| p.leaf_index);
        Ok(proofs)
    }
}
