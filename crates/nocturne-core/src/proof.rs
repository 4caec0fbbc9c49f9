//! Forget proof issuance and trust-minimized verification.
//!
//! A proof binds the `forgotten` ledger entry for a record to a published
//! ledger root through its inclusion path, and is signed with the engine's
//! Ed25519 proof-signing key. [`verify_forget_proof`] needs only the proof,
//! the verifying key and the published root history: no store access.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use nocturne_state::{ForgetProof, LedgerEntry, LedgerEvent, MerkleHash, ProofId, RecordId};
use rand::rngs::OsRng;

use crate::domain::error::{NocturneError, ProofRejection, Result};
use crate::merkle::{leaf_hash, InclusionPath};

const PROOF_DOMAIN: &[u8] = b"nocturne.forget-proof.v1";

/// Bytes covered by a proof signature.
fn signing_message(
    proof_id: &ProofId,
    target_id: &RecordId,
    entry: &LedgerEntry,
    root: &MerkleHash,
    leaf_index: u64,
    tree_size: u64,
) -> Vec<u8> {
    let target = target_id.as_str().as_bytes();
    let mut msg = Vec::with_capacity(160);
    msg.extend_from_slice(PROOF_DOMAIN);
    msg.extend_from_slice(root.as_bytes());
    msg.extend_from_slice(&(target.len() as u32).to_be_bytes());
    msg.extend_from_slice(target);
    msg.extend_from_slice(&entry.at.timestamp_millis().to_be_bytes());
    msg.extend_from_slice(proof_id.as_str().as_bytes());
    msg.extend_from_slice(&leaf_index.to_be_bytes());
    msg.extend_from_slice(&tree_size.to_be_bytes());
    msg
}

/// Holder of the engine's proof-signing key.
pub struct ProofSigner {
    key: SigningKey,
}

impl fmt::Debug for ProofSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofSigner")
            .field("verifying_key", &encode_verifying_key(&self.verifying_key()))
            .finish()
    }
}

impl ProofSigner {
    /// Fresh random key from the OS RNG.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a 32-byte seed from 64 hex characters.
    pub fn from_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| NocturneError::Signing(format!("signing key is not hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NocturneError::Signing("signing key must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(seed))
    }

    /// Hex seed, for persisting the key.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Sign a proof that `entry` is leaf `path.leaf_index` under `root`.
    pub fn issue(&self, entry: LedgerEntry, path: InclusionPath, root: MerkleHash) -> ForgetProof {
        let proof_id = ProofId::new();
        let target_id = entry.record_id.clone();
        let msg = signing_message(
            &proof_id,
            &target_id,
            &entry,
            &root,
            path.leaf_index,
            path.tree_size,
        );
        let signature = self.key.sign(&msg);

        ForgetProof {
            proof_id,
            target_id,
            entry,
            leaf_index: path.leaf_index,
            tree_size: path.tree_size,
            merkle_root: root,
            inclusion_path: path.siblings,
            signature: signature.to_bytes().to_vec(),
        }
    }
}

/// Base64 (URL-safe, unpadded) form of a verifying key, for publication.
pub fn encode_verifying_key(key: &VerifyingKey) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

pub fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|e| NocturneError::Signing(format!("verifying key is not base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| NocturneError::Signing("verifying key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| NocturneError::Signing(e.to_string()))
}

/// The proof's inclusion path with its position in the tree.
pub fn inclusion_path(proof: &ForgetProof) -> InclusionPath {
    InclusionPath {
        leaf_index: proof.leaf_index,
        tree_size: proof.tree_size,
        siblings: proof.inclusion_path.clone(),
    }
}

/// Check a proof against the root published for its tree size.
pub(crate) fn check_proof(
    proof: &ForgetProof,
    key: &VerifyingKey,
    published_root: Option<MerkleHash>,
) -> std::result::Result<(), ProofRejection> {
    if proof.entry.event != LedgerEvent::Forgotten {
        return Err(ProofRejection::NotAForgetEntry);
    }
    if proof.entry.record_id != proof.target_id {
        return Err(ProofRejection::TargetMismatch);
    }
    if proof.tree_size == 0 || proof.leaf_index >= proof.tree_size {
        return Err(ProofRejection::Malformed);
    }

    let leaf = leaf_hash(&proof.entry).map_err(|_| ProofRejection::Malformed)?;
    if inclusion_path(proof).root_for(leaf) != Some(proof.merkle_root) {
        return Err(ProofRejection::PathMismatch);
    }
    if published_root != Some(proof.merkle_root) {
        return Err(ProofRejection::UnknownRoot);
    }

    let signature =
        Signature::from_slice(&proof.signature).map_err(|_| ProofRejection::Malformed)?;
    let msg = signing_message(
        &proof.proof_id,
        &proof.target_id,
        &proof.entry,
        &proof.merkle_root,
        proof.leaf_index,
        proof.tree_size,
    );
    key.verify_strict(&msg, &signature)
        .map_err(|_| ProofRejection::BadSignature)
}

/// Verify a proof with nothing but the verifying key and the ledger's
/// published root history (`root_history[n - 1]` is the root after `n`
/// entries).
pub fn verify_forget_proof(
    proof: &ForgetProof,
    key: &VerifyingKey,
    root_history: &[MerkleHash],
) -> std::result::Result<(), ProofRejection> {
    let published = proof
        .tree_size
        .checked_sub(1)
        .and_then(|i| root_history.get(i as usize).copied());
    check_proof(proof, key, published)
}

pub fn is_valid_forget_proof(
    proof: &ForgetProof,
    key: &VerifyingKey,
    root_history: &[MerkleHash],
) -> bool {
    verify_forget_proof(proof, key, root_history).is_ok()
}
