//! ForgetCoordinator: policy sweeps that forget records and issue proofs.
//!
//! For each record forgotten the coordinator, while holding that record's
//! write lane:
//!
//! 1. appends a `forgotten` entry to the ledger,
//! 2. signs a [`ForgetProof`] over the entry's inclusion path and root,
//! 3. archives the proof,
//! 4. commits the tombstone.
//!
//! A proof signed in step 2 stays pending until its tombstone commits. Any
//! later attempt to forget the same record, in-process, reuses the pending
//! proof instead of appending another entry. A crash after step 3 leaves an
//! archived proof for a live record; [`ForgetCoordinator::recover`] rolls
//! those forward. A crash before step 3 leaves only an unreferenced ledger
//! entry and the record stays live.
//!
//! One record's failure never aborts a sweep; it is reported in the
//! [`SweepSummary`]. Sweeps check for cancellation before each record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nocturne_state::{ForgetProof, LedgerEntry, ProofArchive, Record, RecordId, Slot, StorageError};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::error::{ErrorKind, NocturneError, Result};
use crate::ledger::MerkleLedger;
use crate::metrics::METRICS;
use crate::obs;
use crate::policy::{evaluate_with, Decision, Policy, RiskSignalSource, Signals, Strategy};
use crate::proof::ProofSigner;
use crate::store::{ForgetLane, RecordQuery, RecordStore};
use crate::timeout::{retry_transient, with_timeout};

/// Cooperative cancellation for sweeps. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct SweepCancel {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl SweepCancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop at the next record boundary. Work already done stays done.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A record the sweep skipped or failed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepIssue {
    pub record_id: RecordId,
    pub kind: ErrorKind,
    pub message: String,
}

impl SweepIssue {
    fn new(record_id: &RecordId, err: &NocturneError) -> Self {
        Self {
            record_id: record_id.clone(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub sweep_id: Uuid,
    /// The single instant every age in this sweep was measured against.
    pub reference_time: DateTime<Utc>,
    /// Records a decision was reached for.
    pub evaluated: u64,
    pub kept: u64,
    pub forgotten: u64,
    /// Records that disappeared or were forgotten by someone else mid-sweep.
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub proofs: Vec<ForgetProof>,
    pub skips: Vec<SweepIssue>,
    pub failures: Vec<SweepIssue>,
}

impl SweepSummary {
    fn new(sweep_id: Uuid, reference_time: DateTime<Utc>) -> Self {
        Self {
            sweep_id,
            reference_time,
            evaluated: 0,
            kept: 0,
            forgotten: 0,
            skipped: 0,
            failed: 0,
            cancelled: false,
            proofs: Vec::new(),
            skips: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn skip(&mut self, id: &RecordId, err: &NocturneError) {
        obs::emit_sweep_record_skipped(id, err);
        self.skipped += 1;
        self.skips.push(SweepIssue::new(id, err));
    }

    fn fail(&mut self, id: &RecordId, err: &NocturneError) {
        obs::emit_sweep_record_failed(id, err);
        self.failed += 1;
        self.failures.push(SweepIssue::new(id, err));
    }
}

/// Result of [`ForgetCoordinator::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Archived proofs looked at.
    pub examined: u64,
    /// Records tombstoned from an archived proof.
    pub rolled_forward: Vec<RecordId>,
    /// Records whose archived proof no longer verifies.
    pub rejected: Vec<RecordId>,
    /// Records whose tombstone could not be written yet. Their proof stays
    /// pending and is reused by the next forget.
    pub deferred: Vec<RecordId>,
}

pub struct ForgetCoordinator {
    store: Arc<RecordStore>,
    ledger: Arc<MerkleLedger>,
    archive: Arc<dyn ProofArchive>,
    signer: Arc<ProofSigner>,
    clock: Arc<dyn Clock>,
    signals: Arc<dyn RiskSignalSource>,
    /// Signed proofs whose tombstone has not committed yet.
    pending: StdMutex<HashMap<RecordId, ForgetProof>>,
}

impl ForgetCoordinator {
    pub fn new(
        store: Arc<RecordStore>,
        ledger: Arc<MerkleLedger>,
        archive: Arc<dyn ProofArchive>,
        signer: Arc<ProofSigner>,
        clock: Arc<dyn Clock>,
        signals: Arc<dyn RiskSignalSource>,
    ) -> Self {
        Self {
            store,
            ledger,
            archive,
            signer,
            clock,
            signals,
            pending: StdMutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<RecordId, ForgetProof>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Proofs signed but not yet committed.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn settle(&self, proof: &ForgetProof) {
        let mut pending = self.pending();
        if pending
            .get(&proof.target_id)
            .is_some_and(|held| held.proof_id == proof.proof_id)
        {
            pending.remove(&proof.target_id);
        }
    }

    /// Evaluate every live record against `policy` and forget those it
    /// condemns.
    pub async fn sweep(&self, policy: &Policy, cancel: &SweepCancel) -> Result<SweepSummary> {
        let sweep_id = Uuid::new_v4();
        self.run_sweep(sweep_id, policy, cancel)
            .instrument(obs::sweep_span(sweep_id))
            .await
    }

    async fn run_sweep(
        &self,
        sweep_id: Uuid,
        policy: &Policy,
        cancel: &SweepCancel,
    ) -> Result<SweepSummary> {
        let reference_time = self.clock.now();
        let mut summary = SweepSummary::new(sweep_id, reference_time);
        obs::emit_sweep_started(sweep_id, policy.strategy().as_str(), policy.retention_days());

        let ids = self.store.query(RecordQuery::all()).await?.ids().to_vec();
        debug!(candidates = ids.len(), "sweep snapshot taken");

        for id in ids {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let record = match self.store.get(&id).await {
                Ok(record) => record,
                Err(err @ NocturneError::NotFound { .. }) => {
                    summary.skip(&id, &err);
                    continue;
                }
                Err(err) => {
                    summary.fail(&id, &err);
                    continue;
                }
            };

            let age_days = (reference_time - record.created_at).num_days().max(0) as u64;
            let decision = match self.decide(policy, &record, age_days).await {
                Ok(decision) => decision,
                Err(err) => {
                    summary.fail(&id, &err);
                    continue;
                }
            };
            summary.evaluated += 1;

            match decision {
                Decision::Keep => summary.kept += 1,
                Decision::Forget => match self.forget_record(&id).await {
                    Ok(proof) => {
                        summary.forgotten += 1;
                        summary.proofs.push(proof);
                    }
                    Err(
                        err @ (NocturneError::NotFound { .. }
                        | NocturneError::AlreadyForgotten { .. }),
                    ) => summary.skip(&id, &err),
                    Err(err) => summary.fail(&id, &err),
                },
            }
        }

        METRICS.inc_sweeps_completed();
        METRICS.add_sweep_failures(summary.failed);
        obs::emit_sweep_finished(
            sweep_id,
            summary.evaluated,
            summary.forgotten,
            summary.skipped,
            summary.failed,
            summary.cancelled,
        );
        Ok(summary)
    }

    async fn decide(&self, policy: &Policy, record: &Record, age_days: u64) -> Result<Decision> {
        let tags = record.tags();
        let needs_signal =
            policy.strategy() == Strategy::RiskBased && policy.exempt_tags().is_disjoint(&tags);
        let signals = if needs_signal {
            Signals {
                risk: self.signals.risk_score(record).await?,
            }
        } else {
            Signals::default()
        };
        evaluate_with(policy, &tags, age_days, &signals)
    }

    /// Forget `id` now, regardless of any policy.
    pub async fn forget_now(&self, id: &RecordId) -> Result<ForgetProof> {
        self.forget_record(id).await
    }

    /// Issue and archive a proof for `id` without tombstoning it. The record
    /// is forgotten once the proof is presented to [`RecordStore::forget`],
    /// or by the next [`recover`](Self::recover).
    pub async fn prepare_forget(&self, id: &RecordId) -> Result<ForgetProof> {
        let lane = self.begin_forget(id).await?;
        self.issue_proof(&lane).await
    }

    async fn forget_record(&self, id: &RecordId) -> Result<ForgetProof> {
        let lane = self.begin_forget(id).await?;
        let proof = self.issue_proof(&lane).await?;
        self.commit(lane, &proof).await?;
        Ok(proof)
    }

    async fn begin_forget(&self, id: &RecordId) -> Result<ForgetLane<'_>> {
        let lane = self.store.begin_forget(id).await;
        if let Err(NocturneError::AlreadyForgotten { .. } | NocturneError::NotFound { .. }) = &lane {
            self.pending().remove(id);
        }
        lane
    }

    /// Tombstone under `proof`. A proof the store rejects is dropped; any
    /// other failure leaves it pending.
    async fn commit(&self, lane: ForgetLane<'_>, proof: &ForgetProof) -> Result<()> {
        match lane.commit(proof).await {
            Ok(_) => {
                self.settle(proof);
                Ok(())
            }
            Err(err @ NocturneError::InvalidProof { .. }) => {
                self.settle(proof);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Proof for the record `lane` holds: the pending one if a previous
    /// attempt signed one, otherwise a fresh ledger append and signature.
    /// Either way the proof is archived before it is returned.
    async fn issue_proof(&self, lane: &ForgetLane<'_>) -> Result<ForgetProof> {
        let record = lane.record();
        let op_timeout = self.store.options().op_timeout;
        let reused = self.pending().get(&record.id).cloned();

        let proof = match reused {
            Some(proof) => {
                debug!(record_id = %record.id, proof_id = %proof.proof_id, "reusing pending proof");
                proof
            }
            None => {
                let entry =
                    LedgerEntry::forgotten(record.id.clone(), record.digest.clone(), self.clock.now());
                let (path, root) = with_timeout("append forget entry", op_timeout, async {
                    let leaf_index = self.ledger.append(entry.clone()).await?;
                    let path = self.ledger.prove_inclusion(leaf_index).await?;
                    let root = self.ledger.root_at(path.tree_size).await.ok_or_else(|| {
                        NocturneError::from(StorageError::Corrupt {
                            location: "ledger".to_string(),
                            reason: format!("no root for tree size {}", path.tree_size),
                        })
                    })?;
                    Ok::<_, NocturneError>((path, root))
                })
                .await?;

                let proof = self.signer.issue(entry, path, root);
                obs::emit_proof_issued(&record.id, &proof.proof_id, proof.tree_size);
                METRICS.inc_proofs_issued();
                self.pending().insert(record.id.clone(), proof.clone());
                proof
            }
        };

        let retries = self.store.options().write_retries;
        with_timeout(
            "archive proof",
            op_timeout,
            retry_transient("archive proof", retries, || self.archive.put(&proof)),
        )
        .await?;
        Ok(proof)
    }

    /// Tombstone every record that has an archived proof but is still live.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let op_timeout = self.store.options().op_timeout;
        let archived = with_timeout("list proofs", op_timeout, async {
            Ok::<_, NocturneError>(self.archive.list().await?)
        })
        .await?;

        for proof in archived {
            report.examined += 1;
            if !matches!(self.store.slot(&proof.target_id).await?, Some(Slot::Live(_))) {
                continue;
            }
            let lane = match self.begin_forget(&proof.target_id).await {
                Ok(lane) => lane,
                Err(NocturneError::AlreadyForgotten { .. }) => continue,
                Err(err) => return Err(err),
            };
            self.pending()
                .entry(proof.target_id.clone())
                .or_insert_with(|| proof.clone());
            match self.commit(lane, &proof).await {
                Ok(()) => {
                    obs::emit_recovery_rolled_forward(&proof.target_id, &proof.proof_id);
                    report.rolled_forward.push(proof.target_id.clone());
                }
                Err(NocturneError::InvalidProof { .. }) => {
                    report.rejected.push(proof.target_id.clone());
                }
                Err(err) => {
                    warn!(
                        event = "recovery.deferred",
                        record_id = %proof.target_id,
                        error = %err,
                        "tombstone not written; proof kept pending"
                    );
                    report.deferred.push(proof.target_id.clone());
                }
            }
        }
        Ok(report)
    }

    /// Run `policy` every `every` until `cancel` fires. Resolves to the
    /// number of sweeps completed.
    pub fn spawn_periodic(
        self: Arc<Self>,
        policy: Policy,
        every: Duration,
        cancel: SweepCancel,
    ) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut completed = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.sweep(&policy, &cancel).await {
                            Ok(summary) => {
                                completed += 1;
                                if summary.cancelled {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(event = "sweep.error", error = %err, "periodic sweep failed");
                            }
                        }
                    }
                }
            }
            completed
        })
    }
}
