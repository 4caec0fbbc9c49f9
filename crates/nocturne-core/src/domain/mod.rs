//! Domain foundations for NOCTURNE.
//!
//! - `error`: the error taxonomy shared by every component
//! - `digest`: canonical JSON and SHA-256 digests

pub mod digest;
pub mod error;

pub use digest::{canonical_bytes, canonical_json, compute_digest};
pub use error::{ErrorKind, NocturneError, ProofRejection, Result};
