//! Structured observability hooks for record and sweep lifecycle events.
//!
//! - A sweep-scoped span, [`sweep_span`], to instrument a sweep future
//! - One emitter per lifecycle event, each tagged with a stable `event` field
//!
//! Record ids are logged; record content and metadata never are.
//! For JSON output set `NOCTURNE_LOG_FORMAT=json`.

use std::fmt::Display;

use nocturne_state::{ProofId, RecordId};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::error::ProofRejection;
use crate::store::IngestStatus;

/// Span tagging everything logged during one sweep with its id.
///
/// Attach with `tracing::Instrument`; an entered guard must not be held
/// across `.await`.
pub fn sweep_span(sweep_id: Uuid) -> tracing::Span {
    tracing::info_span!("nocturne.sweep", sweep_id = %sweep_id)
}

pub fn emit_record_ingested(id: &RecordId, status: IngestStatus, generation: u32) {
    info!(
        event = "record.ingested",
        record_id = %id,
        status = status.as_str(),
        generation,
    );
}

pub fn emit_record_forgotten(id: &RecordId, proof_id: &ProofId, leaf_index: u64) {
    info!(
        event = "record.forgotten",
        record_id = %id,
        proof_id = %proof_id,
        leaf_index,
    );
}

pub fn emit_proof_issued(id: &RecordId, proof_id: &ProofId, tree_size: u64) {
    info!(
        event = "proof.issued",
        record_id = %id,
        proof_id = %proof_id,
        tree_size,
    );
}

pub fn emit_proof_rejected(id: &RecordId, reason: ProofRejection) {
    warn!(event = "proof.rejected", record_id = %id, reason = %reason);
}

pub fn emit_sweep_started(sweep_id: Uuid, strategy: &str, retention_days: u32) {
    info!(
        event = "sweep.started",
        sweep_id = %sweep_id,
        strategy,
        retention_days,
    );
}

pub fn emit_sweep_finished(
    sweep_id: Uuid,
    evaluated: u64,
    forgotten: u64,
    skipped: u64,
    failed: u64,
    cancelled: bool,
) {
    info!(
        event = "sweep.finished",
        sweep_id = %sweep_id,
        evaluated,
        forgotten,
        skipped,
        failed,
        cancelled,
    );
}

pub fn emit_sweep_record_skipped(id: &RecordId, reason: &dyn Display) {
    info!(event = "sweep.record_skipped", record_id = %id, reason = %reason);
}

pub fn emit_sweep_record_failed(id: &RecordId, error: &dyn Display) {
    warn!(event = "sweep.record_failed", record_id = %id, error = %error);
}

pub fn emit_recovery_rolled_forward(id: &RecordId, proof_id: &ProofId) {
    warn!(
        event = "recovery.rolled_forward",
        record_id = %id,
        proof_id = %proof_id,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_span_create() {
        let _entered = sweep_span(Uuid::new_v4()).entered();
        emit_sweep_started(Uuid::new_v4(), "time_based", 30);
    }
}
