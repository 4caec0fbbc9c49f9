//! Content addressing for records.
//!
//! A record's id is a SHA-256 over a domain tag, the length-prefixed content
//! bytes and the canonical JSON of its metadata. The creation timestamp is not
//! part of the identity, so re-ingesting identical content and metadata always
//! lands on the same id.

use nocturne_state::{ContentDigest, Metadata, MetadataValue, RecordId, TAGS_KEY};
use sha2::{Digest, Sha256};

use crate::domain::digest::canonical_bytes;
use crate::domain::error::{NocturneError, Result};

const RECORD_DOMAIN: &[u8] = b"nocturne.record.v1";
const LINEAGE_DOMAIN: &[u8] = b"nocturne.lineage.v1";

/// Reject metadata that has no stable canonical encoding.
pub fn validate_metadata(metadata: &Metadata) -> Result<()> {
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(NocturneError::InvalidMetadata(
                "metadata keys must not be empty".to_string(),
            ));
        }
        if let MetadataValue::Float(f) = value {
            if !f.is_finite() {
                return Err(NocturneError::InvalidMetadata(format!(
                    "{key}: NaN/Infinity not permitted"
                )));
            }
        }
    }
    match metadata.get(TAGS_KEY) {
        None | Some(MetadataValue::Text(_)) | Some(MetadataValue::List(_)) => Ok(()),
        Some(other) => Err(NocturneError::InvalidMetadata(format!(
            "{TAGS_KEY} must be a string or a list of strings, got {other:?}"
        ))),
    }
}

/// Derive the content-addressed id of `content` + `metadata`.
pub fn address_of(content: &[u8], metadata: &Metadata) -> Result<RecordId> {
    validate_metadata(metadata)?;
    let encoded_metadata = canonical_bytes(metadata)?;

    let mut hasher = Sha256::new();
    hasher.update(RECORD_DOMAIN);
    hasher.update((content.len() as u64).to_be_bytes());
    hasher.update(content);
    hasher.update(&encoded_metadata);
    let bytes: [u8; 32] = hasher.finalize().into();
    Ok(RecordId::from_digest_bytes(&bytes))
}

/// Integrity digest of the content bytes alone.
pub fn digest_of(content: &[u8]) -> ContentDigest {
    ContentDigest::from_bytes(content)
}

/// Id of the `generation`-th re-creation of forgotten content.
///
/// Generation 0 is the base id itself.
pub fn lineage_id(base: &RecordId, generation: u32) -> RecordId {
    if generation == 0 {
        return base.clone();
    }
    let mut hasher = Sha256::new();
    hasher.update(LINEAGE_DOMAIN);
    hasher.update(base.as_str().as_bytes());
    hasher.update(generation.to_be_bytes());
    let bytes: [u8; 32] = hasher.finalize().into();
    RecordId::from_digest_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(pairs: &[(&str, MetadataValue)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_address_is_deterministic() {
        let m = md(&[("source", "app_clinica".into()), ("severity", 3i64.into())]);
        let a = address_of(b"session notes", &m).unwrap();
        let b = address_of(b"session notes", &m.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_address_depends_on_content_and_metadata() {
        let m = md(&[("source", "app_clinica".into())]);
        let base = address_of(b"x", &m).unwrap();
        assert_ne!(base, address_of(b"y", &m).unwrap());
        assert_ne!(base, address_of(b"x", &Metadata::new()).unwrap());
    }

    #[test]
    fn test_integer_valued_float_addresses_like_integer() {
        let a = address_of(b"x", &md(&[("n", MetadataValue::Float(2.0))])).unwrap();
        let b = address_of(b"x", &md(&[("n", MetadataValue::Int(2))])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_non_finite_metadata_rejected() {
        let err = address_of(b"x", &md(&[("n", MetadataValue::Float(f64::NAN))])).unwrap_err();
        assert!(matches!(err, NocturneError::InvalidMetadata(_)));
    }

    #[test]
    fn test_tags_must_be_text_or_list() {
        let err = validate_metadata(&md(&[(TAGS_KEY, MetadataValue::Int(1))])).unwrap_err();
        assert!(matches!(err, NocturneError::InvalidMetadata(_)));
        assert!(validate_metadata(&md(&[(TAGS_KEY, "legal_hold".into())])).is_ok());
    }

    #[test]
    fn test_lineage_ids_are_distinct_per_generation() {
        let base = address_of(b"x", &Metadata::new()).unwrap();
        assert_eq!(lineage_id(&base, 0), base);
        let g1 = lineage_id(&base, 1);
        let g2 = lineage_id(&base, 2);
        assert_ne!(g1, base);
        assert_ne!(g1, g2);
        assert_eq!(g1, lineage_id(&base, 1));
    }

    #[test]
    fn test_digest_covers_content_only() {
        assert_eq!(digest_of(b"abc"), ContentDigest::from_bytes(b"abc"));
    }
}
