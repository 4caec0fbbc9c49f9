//! Process-wide atomic counters for the engine.
//!
//! Call sites increment silently; [`Metrics::flush`] emits every value as a
//! single `tracing::info!` event, e.g. at the end of a sweep.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    records_ingested: AtomicU64,
    duplicates: AtomicU64,
    records_forgotten: AtomicU64,
    proofs_issued: AtomicU64,
    sweeps_completed: AtomicU64,
    sweep_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            records_ingested: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            records_forgotten: AtomicU64::new(0),
            proofs_issued: AtomicU64::new(0),
            sweeps_completed: AtomicU64::new(0),
            sweep_failures: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, metric: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric, "counter incremented");
    }

    pub fn inc_records_ingested(&self) {
        Self::bump(&self.records_ingested, "records_ingested");
    }

    /// An ingest that matched an existing live record.
    pub fn inc_duplicates(&self) {
        Self::bump(&self.duplicates, "duplicates");
    }

    pub fn inc_records_forgotten(&self) {
        Self::bump(&self.records_forgotten, "records_forgotten");
    }

    pub fn inc_proofs_issued(&self) {
        Self::bump(&self.proofs_issued, "proofs_issued");
    }

    pub fn inc_sweeps_completed(&self) {
        Self::bump(&self.sweeps_completed, "sweeps_completed");
    }

    /// Per-record failures across all sweeps.
    pub fn add_sweep_failures(&self, n: u64) {
        if n > 0 {
            self.sweep_failures.fetch_add(n, Ordering::Relaxed);
            tracing::trace!(metric = "sweep_failures", n, "counter incremented");
        }
    }

    /// Emit all current counter values as one `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            records_ingested = self.records_ingested(),
            duplicates = self.duplicates(),
            records_forgotten = self.records_forgotten(),
            proofs_issued = self.proofs_issued(),
            sweeps_completed = self.sweeps_completed(),
            sweep_failures = self.sweep_failures(),
        );
    }

    pub fn records_ingested(&self) -> u64 {
        self.records_ingested.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn records_forgotten(&self) -> u64 {
        self.records_forgotten.load(Ordering::Relaxed)
    }

    pub fn proofs_issued(&self) -> u64 {
        self.proofs_issued.load(Ordering::Relaxed)
    }

    pub fn sweeps_completed(&self) -> u64 {
        self.sweeps_completed.load(Ordering::Relaxed)
    }

    pub fn sweep_failures(&self) -> u64 {
        self.sweep_failures.load(Ordering::Relaxed)
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        for counter in [
            &self.records_ingested,
            &self.duplicates,
            &self.records_forgotten,
            &self.proofs_issued,
            &self.sweeps_completed,
            &self.sweep_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
