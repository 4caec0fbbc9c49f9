//! RecordStore: content-addressed records with tombstoning.
//!
//! Each id holds exactly one slot, a live record or its tombstone, never
//! both. Readers share an `RwLock` over the slot map; writers take a permit
//! from a bounded pool and then the id's own lane lock, so the Live ->
//! Tombstoned transition for one id is serialized while other ids proceed.
//!
//! An insert persists its slot before its `inserted` ledger entry, and the
//! in-memory map is updated last. A slot whose ledger entry never landed gets
//! one when the store is next opened, and a retried insert never appends a
//! second one. Every lock wait and every backend call is bounded by the
//! configured operation timeout. The slot map itself is never held across a
//! backend call.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use futures::Stream;
use nocturne_state::{
    ForgetProof, LedgerEntry, MerkleHash, Metadata, Record, RecordId, RecordTable, Slot,
    StorageError, Tombstone,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::address::{address_of, digest_of, lineage_id};
use crate::clock::Clock;
use crate::domain::error::{NocturneError, ProofRejection, Result};
use crate::ledger::MerkleLedger;
use crate::metrics::METRICS;
use crate::obs;
use crate::proof::check_proof;
use crate::timeout::{retry_transient, with_timeout};

/// Tunables for a [`RecordStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Upper bound on each lock wait and each backend call (retries
    /// included) inside a store operation.
    pub op_timeout: Duration,
    /// Extra attempts for transient persistence failures.
    pub write_retries: u32,
    /// Concurrent writers admitted at once.
    pub max_writers: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(5_000),
            write_retries: 3,
            max_writers: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

/// A record to ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRequest {
    pub content: Vec<u8>,
    pub metadata: Metadata,
    allow_recreate: bool,
    created_at: Option<DateTime<Utc>>,
}

impl IngestRequest {
    pub fn new(content: impl Into<Vec<u8>>, metadata: Metadata) -> Self {
        Self {
            content: content.into(),
            metadata,
            allow_recreate: false,
            created_at: None,
        }
    }

    /// Permit re-ingesting forgotten content under a new lineage id.
    pub fn allow_recreate(mut self, allow: bool) -> Self {
        self.allow_recreate = allow;
        self
    }

    /// Backdate the record (imports). Defaults to the store clock.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ingested,
    Duplicate,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Ingested => "ingested",
            IngestStatus::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub id: RecordId,
    pub status: IngestStatus,
    pub generation: u32,
}

/// Tag / creation-date filter for [`RecordStore::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    pub tag: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    /// Every live record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &Record) -> bool {
        if let Some(tag) = &self.tag {
            if !record.tags().contains(tag) {
                return false;
            }
        }
        if self.start.is_some_and(|start| record.created_at < start) {
            return false;
        }
        if self.end.is_some_and(|end| record.created_at >= end) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted_count: u32,
    pub tombstone: Tombstone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// `{"records":[...]}`
    Json,
    /// One record per line.
    Ndjson,
}

impl FromStr for ExportFormat {
    type Err = NocturneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "ndjson" | "jsonl" => Ok(ExportFormat::Ndjson),
            _ => Err(NocturneError::UnsupportedFormat(s.to_string())),
        }
    }
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    records: &'a [Record],
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

type LaneMap = StdMutex<HashMap<RecordId, Arc<Mutex<()>>>>;

pub struct RecordStore {
    table: Arc<dyn RecordTable>,
    ledger: Arc<MerkleLedger>,
    verifying_key: VerifyingKey,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    slots: RwLock<HashMap<RecordId, Slot>>,
    /// Only ids with a holder or a waiter have an entry.
    lanes: LaneMap,
    writers: Semaphore,
}

/// Held lane for one id. Dropping the last handle to a lane removes it from
/// the map.
struct LaneGuard<'a> {
    lanes: &'a LaneMap,
    id: RecordId,
    lane: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
        // One handle in the map, one here: nobody else holds or awaits it.
        let idle = lanes
            .get(&self.id)
            .is_some_and(|held| Arc::ptr_eq(held, &self.lane) && Arc::strong_count(&self.lane) == 2);
        if idle {
            lanes.remove(&self.id);
        }
    }
}

impl RecordStore {
    /// Load every slot from `table`. Live records whose content no longer
    /// matches their digest are reported as corruption.
    pub async fn open(
        table: Arc<dyn RecordTable>,
        ledger: Arc<MerkleLedger>,
        verifying_key: VerifyingKey,
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> Result<Self> {
        let mut slots = HashMap::new();
        for slot in table.load_all().await? {
            if let Slot::Live(record) = &slot {
                if digest_of(&record.content) != record.digest {
                    return Err(StorageError::Corrupt {
                        location: format!("record {}", record.id),
                        reason: "content does not match digest".to_string(),
                    }
                    .into());
                }
            }
            slots.insert(slot.id().clone(), slot);
        }
        debug!(slots = slots.len(), "record store loaded");

        let mut unledgered = 0usize;
        for record in slots.values().filter_map(Slot::as_live) {
            if !ledger.has_inserted(&record.id).await {
                let entry = LedgerEntry::inserted(record.id.clone(), record.digest.clone(), clock.now());
                ledger.append(entry).await?;
                unledgered += 1;
            }
        }
        if unledgered > 0 {
            warn!(
                event = "store.ledger_reconciled",
                records = unledgered,
                "appended missing inserted entries"
            );
        }

        let writers = Semaphore::new(options.max_writers.max(1));
        Ok(Self {
            table,
            ledger,
            verifying_key,
            clock,
            options,
            slots: RwLock::new(slots),
            lanes: StdMutex::new(HashMap::new()),
            writers,
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    async fn read_slots(&self, op: &'static str) -> Result<RwLockReadGuard<'_, HashMap<RecordId, Slot>>> {
        with_timeout(op, self.options.op_timeout, async { Ok(self.slots.read().await) }).await
    }

    async fn writer_permit(&self) -> Result<SemaphorePermit<'_>> {
        with_timeout("acquire writer", self.options.op_timeout, async {
            self.writers.acquire().await.map_err(|_| {
                NocturneError::from(StorageError::Corrupt {
                    location: "record store".to_string(),
                    reason: "writer pool closed".to_string(),
                })
            })
        })
        .await
    }

    async fn lock_lane(&self, id: &RecordId) -> Result<LaneGuard<'_>> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|p| p.into_inner());
            lanes.entry(id.clone()).or_default().clone()
        };
        let mut held = LaneGuard {
            lanes: &self.lanes,
            id: id.clone(),
            lane,
            guard: None,
        };
        let lane = held.lane.clone();
        let guard = with_timeout("lock record", self.options.op_timeout, async move {
            Ok(lane.lock_owned().await)
        })
        .await?;
        held.guard = Some(guard);
        Ok(held)
    }

    /// Current slot for `id`, live or tombstoned.
    pub async fn slot(&self, id: &RecordId) -> Result<Option<Slot>> {
        Ok(self.read_slots("read slot").await?.get(id).cloned())
    }

    pub async fn tombstone(&self, id: &RecordId) -> Result<Option<Tombstone>> {
        match self.slot(id).await? {
            Some(Slot::Tombstoned(t)) => Ok(Some(t)),
            _ => Ok(None),
        }
    }

    pub async fn live_count(&self) -> Result<usize> {
        let slots = self.read_slots("count records").await?;
        Ok(slots.values().filter(|s| s.is_live()).count())
    }

    /// Ingest content, returning its id. Identical content + metadata is a
    /// no-op returning the existing id.
    pub async fn insert(&self, content: impl Into<Vec<u8>>, metadata: Metadata) -> Result<RecordId> {
        Ok(self.ingest(IngestRequest::new(content, metadata)).await?.id)
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome> {
        let base_id = address_of(&request.content, &request.metadata)?;
        let digest = digest_of(&request.content);

        let _permit = self.writer_permit().await?;
        let _base_lane = self.lock_lane(&base_id).await?;

        let (id, generation, _lineage_lane) = match self.slot(&base_id).await? {
            None => (base_id.clone(), 0, None),
            Some(Slot::Live(_)) => return Ok(self.duplicate(base_id, 0)),
            Some(Slot::Tombstoned(_)) if !request.allow_recreate => {
                return Err(NocturneError::already_forgotten(&base_id));
            }
            Some(Slot::Tombstoned(_)) => {
                let mut generation = 1u32;
                loop {
                    let candidate = lineage_id(&base_id, generation);
                    let lane = self.lock_lane(&candidate).await?;
                    match self.slot(&candidate).await? {
                        None => break (candidate, generation, Some(lane)),
                        Some(Slot::Live(_)) => return Ok(self.duplicate(candidate, generation)),
                        Some(Slot::Tombstoned(_)) => {
                            generation = generation.checked_add(1).ok_or_else(|| {
                                NocturneError::already_forgotten(&base_id)
                            })?;
                        }
                    }
                }
            }
        };

        let now = self.clock.now();
        let record = Record {
            id: id.clone(),
            digest: digest.clone(),
            content: request.content,
            metadata: request.metadata,
            created_at: request.created_at.unwrap_or(now),
            generation,
        };

        let slot = Slot::Live(record);
        with_timeout("persist record", self.options.op_timeout, async {
            retry_transient("put record", self.options.write_retries, || {
                self.table.put(&slot)
            })
            .await?;
            // An earlier attempt may have reached the ledger before failing.
            if !self.ledger.has_inserted(&id).await {
                self.ledger
                    .append(LedgerEntry::inserted(id.clone(), digest, now))
                    .await?;
            }
            Ok::<(), NocturneError>(())
        })
        .await?;
        self.slots.write().await.insert(id.clone(), slot);

        obs::emit_record_ingested(&id, IngestStatus::Ingested, generation);
        METRICS.inc_records_ingested();
        Ok(IngestOutcome {
            id,
            status: IngestStatus::Ingested,
            generation,
        })
    }

    fn duplicate(&self, id: RecordId, generation: u32) -> IngestOutcome {
        obs::emit_record_ingested(&id, IngestStatus::Duplicate, generation);
        METRICS.inc_duplicates();
        IngestOutcome {
            id,
            status: IngestStatus::Duplicate,
            generation,
        }
    }

    /// Live record for `id`. Tombstoned ids are `NotFound`: their content is gone.
    pub async fn get(&self, id: &RecordId) -> Result<Record> {
        let slots = self.read_slots("get").await?;
        match slots.get(id) {
            Some(Slot::Live(record)) => Ok(record.clone()),
            _ => Err(NocturneError::not_found(id)),
        }
    }

    /// Snapshot the ids of live records matching `query`, ordered by
    /// `(created_at, id)`. Records are fetched lazily as the cursor advances.
    pub async fn query(&self, query: RecordQuery) -> Result<RecordCursor<'_>> {
        let slots = self.read_slots("query").await?;
        let mut hits: Vec<(DateTime<Utc>, RecordId)> = slots
            .values()
            .filter_map(Slot::as_live)
            .filter(|r| query.matches(r))
            .map(|r| (r.created_at, r.id.clone()))
            .collect();
        drop(slots);
        hits.sort();

        Ok(RecordCursor {
            store: self,
            ids: hits.into_iter().map(|(_, id)| id).collect(),
            position: 0,
            yielded: 0,
            limit: query.limit,
        })
    }

    /// Tombstone `id` under a valid, previously issued proof.
    pub async fn forget(&self, id: &RecordId, proof: &ForgetProof) -> Result<DeleteOutcome> {
        let _permit = self.writer_permit().await?;
        let _lane = self.lock_lane(id).await?;
        self.commit_forget(id, proof).await
    }

    /// Take the write lane for a live record. The lane holds off every other
    /// writer for that id until it is committed or dropped.
    pub async fn begin_forget(&self, id: &RecordId) -> Result<ForgetLane<'_>> {
        let permit = self.writer_permit().await?;
        let guard = self.lock_lane(id).await?;
        let record = match self.slot(id).await? {
            Some(Slot::Live(record)) => record,
            Some(Slot::Tombstoned(_)) => return Err(NocturneError::already_forgotten(id)),
            None => return Err(NocturneError::not_found(id)),
        };
        Ok(ForgetLane {
            store: self,
            record,
            _guard: guard,
            _permit: permit,
        })
    }

    /// `published` is the ledger root at the proof's tree size and `recorded`
    /// the ledger entry at its leaf index.
    fn validate_proof(
        &self,
        record: &Record,
        proof: &ForgetProof,
        published: Option<MerkleHash>,
        recorded: Option<LedgerEntry>,
    ) -> std::result::Result<(), ProofRejection> {
        if proof.target_id != record.id {
            return Err(ProofRejection::TargetMismatch);
        }
        check_proof(proof, &self.verifying_key, published)?;
        if proof.entry.digest != record.digest {
            return Err(ProofRejection::DigestMismatch);
        }
        if recorded.as_ref() != Some(&proof.entry) {
            return Err(ProofRejection::NotInLedger);
        }
        Ok(())
    }

    /// Caller holds the lane for `id`.
    async fn commit_forget(&self, id: &RecordId, proof: &ForgetProof) -> Result<DeleteOutcome> {
        let record = match self.slot(id).await? {
            Some(Slot::Live(record)) => record,
            Some(Slot::Tombstoned(_)) => return Err(NocturneError::already_forgotten(id)),
            None => return Err(NocturneError::not_found(id)),
        };
        let (published, recorded) = with_timeout("read ledger", self.options.op_timeout, async {
            Ok((
                self.ledger.root_at(proof.tree_size).await,
                self.ledger.entry_at(proof.leaf_index).await,
            ))
        })
        .await?;
        if let Err(reason) = self.validate_proof(&record, proof, published, recorded) {
            obs::emit_proof_rejected(id, reason);
            return Err(reason.into());
        }

        let tombstone = Tombstone {
            id: id.clone(),
            digest: record.digest,
            generation: record.generation,
            forgotten_at: proof.entry.at,
            proof_id: proof.proof_id.clone(),
            leaf_index: proof.leaf_index,
        };
        let slot = Slot::Tombstoned(tombstone.clone());
        with_timeout(
            "put tombstone",
            self.options.op_timeout,
            retry_transient("put tombstone", self.options.write_retries, || {
                self.table.put(&slot)
            }),
        )
        .await?;
        self.slots.write().await.insert(id.clone(), slot);

        obs::emit_record_forgotten(id, &proof.proof_id, proof.leaf_index);
        METRICS.inc_records_forgotten();
        Ok(DeleteOutcome {
            deleted_count: 1,
            tombstone,
        })
    }

    /// Serialize every live record. Tombstones never appear.
    pub async fn export(&self, format: &str) -> Result<Vec<u8>> {
        let format: ExportFormat = format.parse()?;
        let records = self.query(RecordQuery::all()).await?.collect_all().await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_vec(&ExportDocument { records: &records })?),
            ExportFormat::Ndjson => {
                let mut out = Vec::new();
                for record in &records {
                    serde_json::to_writer(&mut out, record)?;
                    out.push(b'\n');
                }
                Ok(out)
            }
        }
    }
}

/// Exclusive write lane for one live record, from [`RecordStore::begin_forget`].
pub struct ForgetLane<'a> {
    store: &'a RecordStore,
    record: Record,
    _guard: LaneGuard<'a>,
    _permit: SemaphorePermit<'a>,
}

impl ForgetLane<'_> {
    /// The record as it was when the lane was taken.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Verify `proof` and tombstone the record.
    pub async fn commit(self, proof: &ForgetProof) -> Result<DeleteOutcome> {
        self.store.commit_forget(&self.record.id, proof).await
    }
}

/// Lazy, finite, restartable sequence of live records.
pub struct RecordCursor<'a> {
    store: &'a RecordStore,
    ids: Vec<RecordId>,
    position: usize,
    yielded: usize,
    limit: Option<usize>,
}

impl<'a> RecordCursor<'a> {
    /// Ids captured when the query ran.
    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    /// Next live record, skipping any forgotten since the query ran.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        while let Some(id) = self.ids.get(self.position) {
            if self.limit.is_some_and(|limit| self.yielded >= limit) {
                return Ok(None);
            }
            self.position += 1;
            match self.store.get(id).await {
                Ok(record) => {
                    self.yielded += 1;
                    return Ok(Some(record));
                }
                Err(NocturneError::NotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Rewind to the first record of the snapshot.
    pub fn restart(&mut self) {
        self.position = 0;
        self.yielded = 0;
    }

    pub async fn collect_all(mut self) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        while let Some(record) = self.next_record().await? {
            out.push(record);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> + 'a {
        futures::stream::unfold(self, |mut cursor| async move {
            match cursor.next_record().await {
                Ok(Some(record)) => Some((Ok(record), cursor)),
                Ok(None) => None,
                Err(err) => Some((Err(err), cursor)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::merkle::InclusionPath;
    use crate::proof::ProofSigner;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use futures::StreamExt;
    use nocturne_state::fakes::{MemoryLedgerLog, MemoryRecordTable};
    use nocturne_state::{MetadataValue, StorageResult, TAGS_KEY};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        store: Arc<RecordStore>,
        ledger: Arc<MerkleLedger>,
        signer: ProofSigner,
        clock: Arc<ManualClock>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    async fn fixture_with(table: Arc<dyn RecordTable>, options: StoreOptions) -> Fixture {
        let ledger = Arc::new(
            MerkleLedger::open(Arc::new(MemoryLedgerLog::new()))
                .await
                .unwrap(),
        );
        let signer = ProofSigner::from_seed([3u8; 32]);
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(
            table,
            ledger.clone(),
            signer.verifying_key(),
            clock.clone(),
            options,
        )
        .await
        .unwrap();
        Fixture {
            store: Arc::new(store),
            ledger,
            signer,
            clock,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryRecordTable::new()), StoreOptions::default()).await
    }

    fn tagged(tags: &[&str]) -> Metadata {
        let mut md = Metadata::new();
        md.insert(
            TAGS_KEY.into(),
            MetadataValue::List(tags.iter().map(|s| s.to_string()).collect()),
        );
        md
    }

    /// Append the forgotten entry and sign a proof for it.
    async fn issue(f: &Fixture, record: &Record) -> ForgetProof {
        let entry = LedgerEntry::forgotten(record.id.clone(), record.digest.clone(), f.clock.now());
        let leaf = f.ledger.append(entry.clone()).await.unwrap();
        let path: InclusionPath = f.ledger.prove_inclusion(leaf).await.unwrap();
        let root = f.ledger.root_at(path.tree_size).await.unwrap();
        f.signer.issue(entry, path, root)
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let f = fixture().await;
        let a = f.store.ingest(IngestRequest::new("notes", tagged(&["x"]))).await.unwrap();
        let b = f.store.ingest(IngestRequest::new("notes", tagged(&["x"]))).await.unwrap();
        assert_eq!(a.status, IngestStatus::Ingested);
        assert_eq!(b.status, IngestStatus::Duplicate);
        assert_eq!(a.id, b.id);
        assert_eq!(f.ledger.len().await, 1);
        assert_eq!(f.store.live_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_roundtrips_bytes_and_metadata() {
        let f = fixture().await;
        let content = vec![0u8, 159, 146, 150, 255];
        let md = tagged(&["trauma", "session"]);
        let id = f.store.insert(content.clone(), md.clone()).await.unwrap();
        let record = f.store.get(&id).await.unwrap();
        assert_eq!(record.content, content);
        assert_eq!(record.metadata, md);
        assert_eq!(record.created_at, t0());
    }

    #[tokio::test]
    async fn test_forget_then_get_is_not_found() {
        let f = fixture().await;
        let id = f.store.insert("gone soon", Metadata::new()).await.unwrap();
        let record = f.store.get(&id).await.unwrap();
        let proof = issue(&f, &record).await;

        let outcome = f.store.forget(&id, &proof).await.unwrap();
        assert_eq!(outcome.deleted_count, 1);
        assert_eq!(outcome.tombstone.proof_id, proof.proof_id);

        assert!(matches!(f.store.get(&id).await, Err(NocturneError::NotFound { .. })));
        let err = f.store.forget(&id, &proof).await.unwrap_err();
        assert!(matches!(err, NocturneError::AlreadyForgotten { .. }));
    }

    #[tokio::test]
    async fn test_forget_absent_id_is_not_found() {
        let f = fixture().await;
        let id = f.store.insert("a", Metadata::new()).await.unwrap();
        let record = f.store.get(&id).await.unwrap();
        let proof = issue(&f, &record).await;
        let stranger = RecordId::from_digest_bytes(&[9u8; 32]);
        let err = f.store.forget(&stranger, &proof).await.unwrap_err();
        assert!(matches!(err, NocturneError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_forget_rejects_proof_for_other_record() {
        let f = fixture().await;
        let a = f.store.insert("a", Metadata::new()).await.unwrap();
        let b = f.store.insert("b", Metadata::new()).await.unwrap();
        let proof_for_a = issue(&f, &f.store.get(&a).await.unwrap()).await;

        let err = f.store.forget(&b, &proof_for_a).await.unwrap_err();
        assert!(matches!(
            err,
            NocturneError::InvalidProof {
                reason: ProofRejection::TargetMismatch
            }
        ));
        assert!(f.store.get(&b).await.is_ok());
    }

    #[tokio::test]
    async fn test_forget_rejects_proof_signed_by_other_key() {
        let f = fixture().await;
        let id = f.store.insert("a", Metadata::new()).await.unwrap();
        let record = f.store.get(&id).await.unwrap();
        let entry = LedgerEntry::forgotten(id.clone(), record.digest.clone(), f.clock.now());
        let leaf = f.ledger.append(entry.clone()).await.unwrap();
        let path = f.ledger.prove_inclusion(leaf).await.unwrap();
        let root = f.ledger.root_at(path.tree_size).await.unwrap();
        let forged = ProofSigner::from_seed([4u8; 32]).issue(entry, path, root);

        let err = f.store.forget(&id, &forged).await.unwrap_err();
        assert!(matches!(
            err,
            NocturneError::InvalidProof {
                reason: ProofRejection::BadSignature
            }
        ));
    }

    #[tokio::test]
    async fn test_reingest_of_forgotten_content_is_refused_by_default() {
        let f = fixture().await;
        let id = f.store.insert("x", Metadata::new()).await.unwrap();
        let proof = issue(&f, &f.store.get(&id).await.unwrap()).await;
        f.store.forget(&id, &proof).await.unwrap();

        let err = f.store.insert("x", Metadata::new()).await.unwrap_err();
        assert!(matches!(err, NocturneError::AlreadyForgotten { .. }));
    }

    #[tokio::test]
    async fn test_reingest_with_recreate_uses_lineage_id() {
        let f = fixture().await;
        let id = f.store.insert("x", Metadata::new()).await.unwrap();
        let proof = issue(&f, &f.store.get(&id).await.unwrap()).await;
        f.store.forget(&id, &proof).await.unwrap();

        let req = IngestRequest::new("x", Metadata::new()).allow_recreate(true);
        let again = f.store.ingest(req.clone()).await.unwrap();
        assert_eq!(again.status, IngestStatus::Ingested);
        assert_eq!(again.generation, 1);
        assert_eq!(again.id, lineage_id(&id, 1));
        assert!(f.store.tombstone(&id).await.unwrap().is_some());

        let dup = f.store.ingest(req).await.unwrap();
        assert_eq!(dup.status, IngestStatus::Duplicate);
        assert_eq!(dup.id, again.id);
    }

    #[tokio::test]
    async fn test_query_filters_and_orders() {
        let f = fixture().await;
        for (day, tags) in [(3, vec!["a"]), (1, vec!["a", "b"]), (2, vec!["b"])] {
            let req = IngestRequest::new(format!("r{day}"), tagged(&tags))
                .created_at(t0() + ChronoDuration::days(day));
            f.store.ingest(req).await.unwrap();
        }

        let tagged_a = f
            .store
            .query(RecordQuery::all().with_tag("a"))
            .await
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        let contents: Vec<_> = tagged_a.iter().map(|r| r.content.clone()).collect();
        assert_eq!(contents, vec![b"r1".to_vec(), b"r3".to_vec()]);

        let window = RecordQuery::all()
            .since(t0() + ChronoDuration::days(2))
            .until(t0() + ChronoDuration::days(3));
        let hits = f.store.query(window).await.unwrap().collect_all().await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, b"r2");

        let limited = f
            .store
            .query(RecordQuery::all().limit(2))
            .await
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_skips_records_forgotten_mid_iteration_and_restarts() {
        let f = fixture().await;
        let mut ids = Vec::new();
        for n in 0u8..3 {
            let req = IngestRequest::new(vec![n], Metadata::new())
                .created_at(t0() + ChronoDuration::hours(i64::from(n)));
            ids.push(f.store.ingest(req).await.unwrap().id);
        }

        let mut cursor = f.store.query(RecordQuery::all()).await.unwrap();
        assert_eq!(cursor.next_record().await.unwrap().unwrap().id, ids[0]);

        let proof = issue(&f, &f.store.get(&ids[1]).await.unwrap()).await;
        f.store.forget(&ids[1], &proof).await.unwrap();

        assert_eq!(cursor.next_record().await.unwrap().unwrap().id, ids[2]);
        assert!(cursor.next_record().await.unwrap().is_none());

        cursor.restart();
        let again: Vec<_> = cursor
            .into_stream()
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(again, vec![ids[0].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_export_formats() {
        let f = fixture().await;
        let keep = f.store.insert("keep", Metadata::new()).await.unwrap();
        let drop_id = f.store.insert("drop", Metadata::new()).await.unwrap();
        let proof = issue(&f, &f.store.get(&drop_id).await.unwrap()).await;
        f.store.forget(&drop_id, &proof).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&f.store.export("json").await.unwrap()).unwrap();
        let records = json["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], keep.as_str());

        let ndjson = f.store.export("ndjson").await.unwrap();
        assert_eq!(ndjson.iter().filter(|b| **b == b'\n').count(), 1);
        assert!(!String::from_utf8(ndjson).unwrap().contains(drop_id.as_str()));

        let err = f.store.export("xml").await.unwrap_err();
        assert!(matches!(err, NocturneError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn test_held_lane_times_out_competing_forget() {
        let options = StoreOptions {
            op_timeout: Duration::from_millis(50),
            ..StoreOptions::default()
        };
        let f = fixture_with(Arc::new(MemoryRecordTable::new()), options).await;
        let id = f.store.insert("contended", Metadata::new()).await.unwrap();
        let proof = issue(&f, &f.store.get(&id).await.unwrap()).await;

        let lane = f.store.begin_forget(&id).await.unwrap();
        let err = f.store.forget(&id, &proof).await.unwrap_err();
        assert!(matches!(err, NocturneError::Timeout { .. }));

        lane.commit(&proof).await.unwrap();
        assert!(f.store.tombstone(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_forgets_tombstone_exactly_once() {
        let f = fixture().await;
        let id = f.store.insert("race", Metadata::new()).await.unwrap();
        let proof = issue(&f, &f.store.get(&id).await.unwrap()).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = f.store.clone();
            let id = id.clone();
            let proof = proof.clone();
            handles.push(tokio::spawn(async move { store.forget(&id, &proof).await }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(NocturneError::AlreadyForgotten { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
    }

    /// Table whose first `failures` puts fail with a transient I/O error.
    struct FlakyTable {
        inner: MemoryRecordTable,
        failures: AtomicU32,
    }

    #[async_trait]
    impl RecordTable for FlakyTable {
        async fn put(&self, slot: &Slot) -> StorageResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "flaky disk",
                )));
            }
            self.inner.put(slot).await
        }

        async fn get(&self, id: &RecordId) -> StorageResult<Option<Slot>> {
            self.inner.get(id).await
        }

        async fn load_all(&self) -> StorageResult<Vec<Slot>> {
            self.inner.load_all().await
        }
    }

    #[tokio::test]
    async fn test_transient_table_failures_are_retried() {
        let table = Arc::new(FlakyTable {
            inner: MemoryRecordTable::new(),
            failures: AtomicU32::new(2),
        });
        let f = fixture_with(table.clone(), StoreOptions::default()).await;
        let id = f.store.insert("retry me", Metadata::new()).await.unwrap();
        assert!(table.inner.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_detects_tampered_content() {
        let table = Arc::new(MemoryRecordTable::new());
        let f = fixture_with(table.clone(), StoreOptions::default()).await;
        let id = f.store.insert("original", Metadata::new()).await.unwrap();
        let mut record = f.store.get(&id).await.unwrap();
        record.content = b"tampered".to_vec();
        table.put(&Slot::Live(record)).await.unwrap();

        let reopened = RecordStore::open(
            table,
            f.ledger.clone(),
            f.signer.verifying_key(),
            f.clock.clone(),
            StoreOptions::default(),
        )
        .await;
        assert!(matches!(
            reopened,
            Err(NocturneError::Storage(StorageError::Corrupt { .. }))
        ));
    }

    /// Table that refuses every write with a permanent error.
    struct BrokenTable;

    #[async_trait]
    impl RecordTable for BrokenTable {
        async fn put(&self, _slot: &Slot) -> StorageResult<()> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only volume",
            )))
        }

        async fn get(&self, _id: &RecordId) -> StorageResult<Option<Slot>> {
            Ok(None)
        }

        async fn load_all(&self) -> StorageResult<Vec<Slot>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_put_leaves_ledger_untouched() {
        let f = fixture_with(Arc::new(BrokenTable), StoreOptions::default()).await;
        for _ in 0..3 {
            let err = f.store.insert("x", Metadata::new()).await.unwrap_err();
            assert!(matches!(err, NocturneError::Storage(StorageError::Io(_))));
        }
        assert_eq!(f.store.live_count().await.unwrap(), 0);
        assert!(f.ledger.is_empty().await);
    }

    /// Ledger log whose first append fails.
    struct FailFirstAppend {
        inner: MemoryLedgerLog,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl nocturne_state::LedgerLog for FailFirstAppend {
        async fn append(&self, entry: &LedgerEntry) -> StorageResult<u64> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "ledger volume unavailable",
                )));
            }
            self.inner.append(entry).await
        }

        async fn load_all(&self) -> StorageResult<Vec<LedgerEntry>> {
            self.inner.load_all().await
        }

        async fn len(&self) -> StorageResult<u64> {
            self.inner.len().await
        }
    }

    #[tokio::test]
    async fn test_slot_without_ledger_entry_is_reconciled() {
        let table = Arc::new(MemoryRecordTable::new());
        let log = Arc::new(FailFirstAppend {
            inner: MemoryLedgerLog::new(),
            failed: std::sync::atomic::AtomicBool::new(false),
        });
        let ledger = Arc::new(MerkleLedger::open(log.clone()).await.unwrap());
        let signer = ProofSigner::from_seed([3u8; 32]);
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(
            table.clone(),
            ledger.clone(),
            signer.verifying_key(),
            clock.clone(),
            StoreOptions::default(),
        )
        .await
        .unwrap();

        // The slot landed, its ledger entry did not.
        assert!(store.insert("orphan", Metadata::new()).await.is_err());
        assert!(ledger.is_empty().await);
        assert_eq!(table.load_all().await.unwrap().len(), 1);

        let reopened = RecordStore::open(
            table,
            ledger.clone(),
            signer.verifying_key(),
            clock,
            StoreOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(ledger.len().await, 1);
        let id = address_of(b"orphan", &Metadata::new()).unwrap();
        assert!(reopened.get(&id).await.is_ok());
        assert_eq!(ledger.entry_at(0).await.unwrap().record_id, id);
    }

    #[tokio::test]
    async fn test_retried_insert_appends_one_ledger_entry() {
        let table = Arc::new(MemoryRecordTable::new());
        let log = Arc::new(FailFirstAppend {
            inner: MemoryLedgerLog::new(),
            failed: std::sync::atomic::AtomicBool::new(false),
        });
        let ledger = Arc::new(MerkleLedger::open(log).await.unwrap());
        let store = RecordStore::open(
            table,
            ledger.clone(),
            ProofSigner::from_seed([3u8; 32]).verifying_key(),
            Arc::new(ManualClock::new(t0())),
            StoreOptions::default(),
        )
        .await
        .unwrap();

        assert!(store.insert("again", Metadata::new()).await.is_err());
        let id = store.insert("again", Metadata::new()).await.unwrap();
        assert!(store.get(&id).await.is_ok());
        assert_eq!(ledger.len().await, 1);
        assert!(ledger.has_inserted(&id).await);
    }

    /// Table whose writes never complete.
    struct HungTable;

    #[async_trait]
    impl RecordTable for HungTable {
        async fn put(&self, _slot: &Slot) -> StorageResult<()> {
            std::future::pending().await
        }

        async fn get(&self, _id: &RecordId) -> StorageResult<Option<Slot>> {
            Ok(None)
        }

        async fn load_all(&self) -> StorageResult<Vec<Slot>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_hung_backend_surfaces_timeout() {
        let options = StoreOptions {
            op_timeout: Duration::from_millis(50),
            ..StoreOptions::default()
        };
        let f = fixture_with(Arc::new(HungTable), options).await;

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            f.store.insert("stuck", Metadata::new()),
        )
        .await
        .expect("insert must not block past its deadline")
        .unwrap_err();
        assert!(matches!(err, NocturneError::Timeout { op: "persist record", .. }));
        assert!(f.ledger.is_empty().await);

        // The lane and the writer permit were released.
        let err = f.store.insert("stuck", Metadata::new()).await.unwrap_err();
        assert!(matches!(err, NocturneError::Timeout { .. }));
        assert!(f.store.lanes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lanes_are_dropped_once_released() {
        let f = fixture().await;
        for n in 0..1000u32 {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&n.to_be_bytes());
            let absent = RecordId::from_digest_bytes(&bytes);
            assert!(matches!(
                f.store.begin_forget(&absent).await,
                Err(NocturneError::NotFound { .. })
            ));
        }
        assert!(f.store.lanes.lock().unwrap().is_empty());

        let id = f.store.insert("held", Metadata::new()).await.unwrap();
        let lane = f.store.begin_forget(&id).await.unwrap();
        assert_eq!(f.store.lanes.lock().unwrap().len(), 1);

        let waiter = {
            let store = f.store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.begin_forget(&id).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lane);
        waiter.await.unwrap().unwrap();
        assert!(f.store.lanes.lock().unwrap().is_empty());
    }
}
