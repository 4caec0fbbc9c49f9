//! Persisted schema for the NOCTURNE record engine
//!
//! Three logical tables survive restart:
//! - records: one `Slot` per `RecordId`, either a live `Record` or a `Tombstone`
//! - ledger: append-only `LedgerEntry` log in insertion order
//! - proofs: issued `ForgetProof`s keyed by `ProofId`

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// Reserved metadata key holding a record's tags.
pub const TAGS_KEY: &str = "tags";

/// Serde helper: byte vectors as base64 (URL-safe, unpadded).
pub mod base64_bytes {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Identifiers and digests
// ---------------------------------------------------------------------------

/// Content-derived record identifier (SHA-256 hex).
///
/// Construction goes through [`RecordId::from_digest_bytes`] or the validating
/// `TryFrom<String>`, so the inner string is always 64 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    pub fn from_digest_bytes(bytes: &[u8; 32]) -> Self {
        RecordId(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for RecordId {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if !is_hex64(&s) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(RecordId(s.to_ascii_lowercase()))
    }
}

impl FromStr for RecordId {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RecordId::try_from(s.to_string())
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Integrity digest of a record's content bytes (SHA-256 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        ContentDigest(hex::encode(Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if !is_hex64(&s) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node hash in the ledger's Merkle tree. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MerkleHash([u8; 32]);

impl MerkleHash {
    /// Root of the empty tree.
    pub const ZERO: MerkleHash = MerkleHash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MerkleHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MerkleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MerkleHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MerkleHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for MerkleHash {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| StorageError::InvalidDigest {
            digest: s.to_string(),
        })?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StorageError::InvalidDigest {
                digest: s.to_string(),
            })?;
        Ok(MerkleHash(arr))
    }
}

impl Serialize for MerkleHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MerkleHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Unique identifier of an issued proof
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProofId(pub String);

impl ProofId {
    /// Generate a new random ProofId
    pub fn new() -> Self {
        ProofId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProofId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProofId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A single metadata value: a scalar, a string, or a list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Float(v)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(v: Vec<String>) -> Self {
        MetadataValue::List(v)
    }
}

/// Record metadata. `BTreeMap` keeps keys in a fixed order.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Read the tag set from the reserved `tags` metadata key.
pub fn tags_of(metadata: &Metadata) -> BTreeSet<String> {
    match metadata.get(TAGS_KEY) {
        Some(MetadataValue::List(tags)) => tags.iter().cloned().collect(),
        Some(MetadataValue::Text(tag)) => std::iter::once(tag.clone()).collect(),
        _ => BTreeSet::new(),
    }
}

/// An immutable, content-addressed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub digest: ContentDigest,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// Re-creation generation; 0 for the original lineage.
    #[serde(default)]
    pub generation: u32,
}

impl Record {
    pub fn tags(&self) -> BTreeSet<String> {
        tags_of(&self.metadata)
    }
}

/// What remains of a record after it has been forgotten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: RecordId,
    /// Digest of the discarded content
    pub digest: ContentDigest,
    #[serde(default)]
    pub generation: u32,
    pub forgotten_at: DateTime<Utc>,
    /// Proof that authorized the deletion
    pub proof_id: ProofId,
    /// Ledger position of the `forgotten` entry
    pub leaf_index: u64,
}

/// Storage slot for one id: exactly one of a live record or its tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Slot {
    Live(Record),
    Tombstoned(Tombstone),
}

impl Slot {
    pub fn id(&self) -> &RecordId {
        match self {
            Slot::Live(r) => &r.id,
            Slot::Tombstoned(t) => &t.id,
        }
    }

    pub fn digest(&self) -> &ContentDigest {
        match self {
            Slot::Live(r) => &r.digest,
            Slot::Tombstoned(t) => &t.digest,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Slot::Live(_))
    }

    pub fn as_live(&self) -> Option<&Record> {
        match self {
            Slot::Live(r) => Some(r),
            Slot::Tombstoned(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Kind of ledger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    Inserted,
    Forgotten,
}

impl fmt::Display for LedgerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerEvent::Inserted => write!(f, "inserted"),
            LedgerEvent::Forgotten => write!(f, "forgotten"),
        }
    }
}

/// One append-only ledger entry: "<event> id=X digest=D at T".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub event: LedgerEvent,
    pub record_id: RecordId,
    pub digest: ContentDigest,
    pub at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build an entry. `at` is truncated to millisecond precision so the
    /// entry encodes identically wherever it is re-serialized.
    pub fn new(
        event: LedgerEvent,
        record_id: RecordId,
        digest: ContentDigest,
        at: DateTime<Utc>,
    ) -> Self {
        let at = DateTime::<Utc>::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at);
        Self {
            event,
            record_id,
            digest,
            at,
        }
    }

    pub fn inserted(record_id: RecordId, digest: ContentDigest, at: DateTime<Utc>) -> Self {
        Self::new(LedgerEvent::Inserted, record_id, digest, at)
    }

    pub fn forgotten(record_id: RecordId, digest: ContentDigest, at: DateTime<Utc>) -> Self {
        Self::new(LedgerEvent::Forgotten, record_id, digest, at)
    }
}

// ---------------------------------------------------------------------------
// Proofs
// ---------------------------------------------------------------------------

/// Signed evidence that `target_id` was forgotten at a given ledger state.
///
/// Valid iff the `entry` hashed up `inclusion_path` reproduces `merkle_root`
/// for a tree of `tree_size` leaves, and `signature` verifies under the
/// engine's proof-signing key. Proofs are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgetProof {
    pub proof_id: ProofId,
    pub target_id: RecordId,
    /// The `forgotten` ledger entry this proof attests
    pub entry: LedgerEntry,
    pub leaf_index: u64,
    pub tree_size: u64,
    pub merkle_root: MerkleHash,
    /// Sibling hashes from the leaf up to the root
    pub inclusion_path: Vec<MerkleHash>,
    /// Ed25519 signature bytes
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}
