//! Structured events and counters for record and sweep lifecycles.

use nocturne_core::metrics::Metrics;
use nocturne_core::obs::{
    emit_proof_issued, emit_proof_rejected, emit_record_forgotten, emit_recovery_rolled_forward,
    emit_sweep_finished, emit_sweep_record_failed, emit_sweep_started, sweep_span,
};
use nocturne_core::{
    init_tracing, Engine, IngestRequest, Metadata, NocturneError, Policy, ProofId,
    ProofRejection, RecordId, SweepCancel, METRICS,
};
use tracing::Level;
use uuid::Uuid;

#[test]
fn test_emitters_run_under_a_json_subscriber() {
    init_tracing(true, Level::DEBUG);
    let id = RecordId::from_digest_bytes(&[3u8; 32]);
    let proof_id = ProofId::new();
    let sweep_id = Uuid::new_v4();

    let _entered = sweep_span(sweep_id).entered();
    emit_sweep_started(sweep_id, "time_based", 30);
    emit_proof_issued(&id, &proof_id, 4);
    emit_record_forgotten(&id, &proof_id, 3);
    emit_proof_rejected(&id, ProofRejection::BadSignature);
    emit_sweep_record_failed(&id, &NocturneError::InsufficientSignal("no score".into()));
    emit_recovery_rolled_forward(&id, &proof_id);
    emit_sweep_finished(sweep_id, 10, 2, 1, 1, false);
}

#[test]
fn test_local_counters_flush() {
    let metrics = Metrics::new();
    metrics.inc_records_ingested();
    metrics.inc_proofs_issued();
    metrics.flush();
    assert_eq!(metrics.records_ingested(), 1);
    assert_eq!(metrics.proofs_issued(), 1);
}

#[tokio::test]
async fn test_engine_activity_moves_global_counters() {
    let before_ingested = METRICS.records_ingested();
    let before_forgotten = METRICS.records_forgotten();
    let before_sweeps = METRICS.sweeps_completed();

    let engine = Engine::in_memory().await.unwrap();
    let id = engine
        .ingest(IngestRequest::new("counted", Metadata::new()))
        .await
        .unwrap()
        .id;
    engine.forget_now(&id).await.unwrap();
    engine
        .sweep(&Policy::time_based(30), &SweepCancel::new())
        .await
        .unwrap();

    assert!(METRICS.records_ingested() > before_ingested);
    assert!(METRICS.records_forgotten() > before_forgotten);
    assert!(METRICS.sweeps_completed() > before_sweeps);
}
