//! Engine: wires store, ledger, proof archive, signer and coordinator over
//! in-memory or filesystem backends.
//!
//! On-disk layout under `data_dir`:
//!
//! ```text
//! records/<2 hex>/<62 hex>.json   one slot per id
//! ledger.jsonl                    append-only ledger log
//! proofs/<proof_id>.json          proof archive
//! signing.key                     hex Ed25519 seed
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;
use nocturne_state::fakes::{MemoryLedgerLog, MemoryProofArchive, MemoryRecordTable};
use nocturne_state::fs::{FsLedgerLog, FsProofArchive, FsRecordTable};
use nocturne_state::{
    ForgetProof, LedgerLog, MerkleHash, ProofArchive, Record, RecordId, RecordTable, StorageError,
};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{DeleteRequest, DeleteResponse, VerifyRequest, VerifyResponse};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::coordinator::{ForgetCoordinator, RecoveryReport, SweepCancel, SweepSummary};
use crate::domain::error::Result;
use crate::ledger::MerkleLedger;
use crate::policy::{NoRiskSignal, Policy, RiskSignalSource};
use crate::proof::ProofSigner;
use crate::store::{IngestOutcome, IngestRequest, RecordQuery, RecordStore};

pub const SIGNING_KEY_FILE: &str = "signing.key";

struct Backends {
    table: Arc<dyn RecordTable>,
    log: Arc<dyn LedgerLog>,
    archive: Arc<dyn ProofArchive>,
}

impl Backends {
    fn memory() -> Self {
        Self {
            table: Arc::new(MemoryRecordTable::new()),
            log: Arc::new(MemoryLedgerLog::new()),
            archive: Arc::new(MemoryProofArchive::new()),
        }
    }

    async fn fs(dir: &Path) -> Result<Self> {
        Ok(Self {
            table: Arc::new(FsRecordTable::open(dir).await?),
            log: Arc::new(FsLedgerLog::open(dir).await?),
            archive: Arc::new(FsProofArchive::open(dir).await?),
        })
    }
}

/// Signing key: explicit config first, then `<data_dir>/signing.key`
/// (created on first open), else a fresh per-process key.
async fn load_signer(config: &EngineConfig) -> Result<ProofSigner> {
    if let Some(seed_hex) = &config.signing_key {
        return ProofSigner::from_hex(seed_hex);
    }
    let Some(dir) = &config.data_dir else {
        return Ok(ProofSigner::generate());
    };

    let path = dir.join(SIGNING_KEY_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => ProofSigner::from_hex(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let signer = ProofSigner::generate();
            write_key_file(&path, &signer.seed_hex()).await?;
            info!(path = %path.display(), "generated proof-signing key");
            Ok(signer)
        }
        Err(e) => Err(StorageError::Io(e).into()),
    }
}

async fn write_key_file(path: &Path, seed_hex: &str) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await.map_err(StorageError::from)?;
    file.write_all(seed_hex.as_bytes())
        .await
        .map_err(StorageError::from)?;
    file.sync_all().await.map_err(StorageError::from)?;
    Ok(())
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<RecordStore>,
    ledger: Arc<MerkleLedger>,
    coordinator: Arc<ForgetCoordinator>,
    verifying_key: VerifyingKey,
}

impl Engine {
    /// Volatile engine with a fresh signing key.
    pub async fn in_memory() -> Result<Self> {
        Self::open(EngineConfig::default()).await
    }

    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with(config, Arc::new(SystemClock), Arc::new(NoRiskSignal)).await
    }

    /// Open with an explicit clock and risk signal source. Any forget
    /// interrupted after its proof was archived is completed before this
    /// returns.
    pub async fn open_with(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        signals: Arc<dyn RiskSignalSource>,
    ) -> Result<Self> {
        config.validate()?;
        let backends = match &config.data_dir {
            Some(dir) => Backends::fs(dir).await?,
            None => Backends::memory(),
        };
        let signer = Arc::new(load_signer(&config).await?);
        let verifying_key = signer.verifying_key();

        let ledger = Arc::new(MerkleLedger::open(backends.log).await?);
        let store = Arc::new(
            RecordStore::open(
                backends.table,
                ledger.clone(),
                verifying_key,
                clock.clone(),
                config.store_options(),
            )
            .await?,
        );
        let coordinator = Arc::new(ForgetCoordinator::new(
            store.clone(),
            ledger.clone(),
            backends.archive,
            signer,
            clock,
            signals,
        ));

        let recovery = coordinator.recover().await?;
        let live_records = store.live_count().await?;
        info!(
            event = "engine.opened",
            persistent = config.data_dir.is_some(),
            live_records,
            ledger_size = ledger.len().await,
            rolled_forward = recovery.rolled_forward.len(),
            deferred = recovery.deferred.len(),
        );

        Ok(Self {
            config,
            store,
            ledger,
            coordinator,
            verifying_key,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<MerkleLedger> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &Arc<ForgetCoordinator> {
        &self.coordinator
    }

    /// Key third parties verify proofs with.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome> {
        self.store.ingest(request).await
    }

    pub async fn get(&self, id: &RecordId) -> Result<Record> {
        self.store.get(id).await
    }

    /// Materialize a query. Use [`RecordStore::query`] for a lazy cursor.
    pub async fn query(&self, query: impl Into<RecordQuery>) -> Result<Vec<Record>> {
        self.store.query(query.into()).await?.collect_all().await
    }

    /// Issue and archive a proof for `id`, ready for [`delete`](Self::delete).
    pub async fn prepare_forget(&self, id: &RecordId) -> Result<ForgetProof> {
        self.coordinator.prepare_forget(id).await
    }

    pub async fn forget_now(&self, id: &RecordId) -> Result<ForgetProof> {
        self.coordinator.forget_now(id).await
    }

    pub async fn delete(&self, request: &DeleteRequest) -> Result<DeleteResponse> {
        let outcome = self.store.forget(&request.id, &request.proof).await?;
        Ok(outcome.into())
    }

    pub async fn export(&self, format: &str) -> Result<Vec<u8>> {
        self.store.export(format).await
    }

    pub async fn sweep(&self, policy: &Policy, cancel: &SweepCancel) -> Result<SweepSummary> {
        self.coordinator.sweep(policy, cancel).await
    }

    pub fn spawn_periodic(&self, policy: Policy, every: Duration, cancel: SweepCancel) -> JoinHandle<u64> {
        self.coordinator.clone().spawn_periodic(policy, every, cancel)
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.coordinator.recover().await
    }

    /// Every root the ledger has had, for publication.
    pub async fn root_history(&self) -> Vec<MerkleHash> {
        self.ledger.root_history().await
    }

    /// Verify against the request's root history only.
    pub fn verify(&self, request: &VerifyRequest) -> VerifyResponse {
        request.verify(&self.verifying_key)
    }
}
