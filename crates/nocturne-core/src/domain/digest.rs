//! Canonical JSON encoding and SHA-256 digests.
//!
//! The canonical form is what record identities and ledger leaves are hashed
//! over, so it must never change for a given value:
//! - object keys sorted by code point, recursively
//! - compact output, no insignificant whitespace
//! - integer-valued floats written as integers; NaN/Infinity rejected
//! - array order preserved

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::domain::error::{NocturneError, Result};

fn write_number(n: &Number, out: &mut String) -> Result<()> {
    if n.is_i64() || n.is_u64() {
        out.push_str(&n.to_string());
        return Ok(());
    }
    match n.as_f64() {
        Some(f) if !f.is_finite() => Err(NocturneError::InvalidMetadata(
            "NaN/Infinity not permitted in canonical JSON".to_string(),
        )),
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            out.push_str(&(f as i64).to_string());
            Ok(())
        }
        _ => {
            out.push_str(&n.to_string());
            Ok(())
        }
    }
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out)?,
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Convert a JSON value to its canonical string form.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Canonical JSON bytes of any serializable value.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_json(&value)?.into_bytes())
}

/// SHA-256 hex digest of a value's canonical JSON.
pub fn compute_digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
