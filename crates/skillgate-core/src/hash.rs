//! Canonical hashing of a skill's behavioural surface.
//!
//! The security hash is SHA-256 over a canonical JSON document containing:
//! - a domain-separation tag and the policy-engine version
//! - the full validated manifest (which embeds the source digests)
//! - the isolation policy and the container image digest, repeated at the
//!   top level so they can never be dropped from the input by a model change
//!
//! Canonical JSON follows RFC 8785 ordering: object keys sorted by UTF-16 code
//! units, integer-valued floats written as integers, NaN/Infinity rejected.
//! Textual sources are normalized (UTF-8 BOM stripped, CRLF/CR to LF) before
//! their digest is taken. The function is pure: no clock, no environment.

use serde_json::Value;
use skillgate_state::SecurityHash;
use thiserror::Error;

use crate::manifest::CapabilityManifest;

/// Domain-separation tag; bump to invalidate every stored grant.
pub const SECURITY_HASH_DOMAIN: &str = "skillgate.security-hash.v1";

/// Version of the gate's decision logic. Part of every security hash, so a
/// policy-engine change forces re-approval.
pub const POLICY_ENGINE_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum HashError {
    #[error("non-finite number at '{path}' has no canonical form")]
    NonFinite { path: String },

    #[error("manifest is not serializable: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type HashResult<T> = std::result::Result<T, HashError>;

/// Recursively sort JSON object keys using UTF-16 code unit ordering.
fn sort_keys_utf16(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys_utf16(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys_utf16).collect()),
        other => other.clone(),
    }
}

/// Normalize numbers: integer-valued floats become integers; NaN/Infinity
/// are rejected.
fn normalize_numbers(value: &Value, path: &str) -> HashResult<Value> {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), normalize_numbers(v, &format!("{path}.{k}"))?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| normalize_numbers(v, &format!("{path}[{i}]")))
            .collect::<HashResult<Vec<_>>>()
            .map(Value::Array),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if !f.is_finite() => Err(HashError::NonFinite {
                path: path.to_string(),
            }),
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Ok(Value::Number(serde_json::Number::from(f as i64)))
            }
            _ => Ok(value.clone()),
        },
        other => Ok(other.clone()),
    }
}

/// Canonical compact JSON text for `value`.
pub fn canonical_json(value: &Value) -> HashResult<String> {
    let normalized = normalize_numbers(value, "$")?;
    Ok(serde_json::to_string(&sort_keys_utf16(&normalized))?)
}

/// Strip a UTF-8 BOM and convert CRLF/CR line endings to LF.
///
/// Non-UTF-8 input is treated as binary and returned unchanged.
pub fn normalize_text(bytes: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return bytes.to_vec();
    };
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    text.replace("\r\n", "\n").replace('\r', "\n").into_bytes()
}

/// Digest of a source file after text normalization.
pub fn source_digest(bytes: &[u8]) -> SecurityHash {
    SecurityHash::from_bytes(&normalize_text(bytes))
}

/// Compute the security hash of a validated manifest.
pub fn security_hash(manifest: &CapabilityManifest) -> HashResult<SecurityHash> {
    let document = serde_json::json!({
        "domain": SECURITY_HASH_DOMAIN,
        "policy_engine_version": POLICY_ENGINE_VERSION,
        "manifest": serde_json::to_value(manifest)?,
        "isolation": serde_json::to_value(&manifest.isolation)?,
        "source_digests": manifest
            .sources
            .iter()
            .map(|s| Value::String(s.digest.to_string()))
            .collect::<Vec<_>>(),
        "container_image_digest": manifest.container_image_digest(),
    });
    let canonical = canonical_json(&document)?;
    Ok(SecurityHash::from_bytes(canonical.as_bytes()))
}
