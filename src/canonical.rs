//! Canonical JSON, SHA-256 digests, and the RFC3339Nano time codec
//!
//! Every hashing site in this crate (transaction hashes, Merkle leaves,
//! block header hashes) and every bit-stable payload (the public epoch
//! document) must serialize **identically**. This module is the single
//! definition of that serialization:
//!
//! - UTF-8, object keys sorted lexicographically, no insignificant
//!   whitespace. `serde_json::Map` is backed by a `BTreeMap` (the
//!   `preserve_order` feature is not enabled anywhere in this crate), so
//!   routing a value through [`serde_json::Value`] sorts keys for free.
//! - Numbers in shortest round-trip form (serde_json's ryu/itoa output).
//! - Strings escaped minimally (serde_json's default escaping).
//! - Timestamps RFC3339 UTC with trailing zeros trimmed from the
//!   fractional seconds and the fraction dropped entirely when zero, i.e.
//!   the Go `time.RFC3339Nano` rendering. Parsing accepts any RFC3339.
//! - Hex strings lowercase (the `hex` crate's default).
//!
//! Producers and verifiers both call into this module, never into ad-hoc
//! serialization, so a value hashes to the same digest everywhere.

#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors raised while canonicalizing a value.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("value is not representable as canonical JSON: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("non-finite number in field {0}")]
    NonFinite(String),
}

/// Serialize `value` to its canonical JSON string.
///
/// The value is routed through [`serde_json::Value`] so nested objects come
/// out with sorted keys regardless of struct field order.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Canonical JSON of an already-built [`serde_json::Value`].
pub fn value_to_canonical_json(value: &serde_json::Value) -> Result<String, CanonicalError> {
    Ok(serde_json::to_string(value)?)
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Raw SHA-256 of raw bytes (Merkle interior nodes hash byte pairs).
pub fn sha256_raw(bytes: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

/// Lowercase hex SHA-256 over the canonical JSON of `value`.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    Ok(sha256_hex(to_canonical_json(value)?.as_bytes()))
}

/// Canonical JSON of `value` with the top-level key `key` removed.
///
/// This is how self-referential hashes are computed: a transaction hash
/// covers the transaction minus its `hash` field, a header hash covers the
/// header minus `headerHash`.
pub fn to_canonical_json_without<T: Serialize>(
    value: &T,
    key: &str,
) -> Result<String, CanonicalError> {
    let mut v = serde_json::to_value(value)?;
    if let serde_json::Value::Object(map) = &mut v {
        map.remove(key);
    }
    Ok(serde_json::to_string(&v)?)
}

/// Lowercase hex SHA-256 of `value` minus the top-level key `key`.
pub fn hash_canonical_without<T: Serialize>(value: &T, key: &str) -> Result<String, CanonicalError> {
    Ok(sha256_hex(to_canonical_json_without(value, key)?.as_bytes()))
}

/// True when `s` is entirely lowercase hex (the form every stored digest
/// must take).
pub fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// ============================================================================
// RFC3339Nano
// ============================================================================

/// Render a UTC instant as RFC3339 with the fractional second trimmed of
/// trailing zeros (and omitted when zero).
pub fn rfc3339_nano(t: &DateTime<Utc>) -> String {
    let nanos = t.timestamp_subsec_nanos();
    if nanos == 0 {
        return t.to_rfc3339_opts(SecondsFormat::Secs, true);
    }
    let base = t.format("%Y-%m-%dT%H:%M:%S").to_string();
    let frac = format!("{nanos:09}");
    let frac = frac.trim_end_matches('0');
    format!("{base}.{frac}Z")
}

/// Parse any RFC3339 timestamp into UTC.
pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Serde codec for `DateTime<Utc>` fields using the RFC3339Nano rendering.
///
/// Use as `#[serde(with = "crate::canonical::ts")]`.
pub mod ts {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&rfc3339_nano(t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        parse_rfc3339(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================
