//! Canonical Hashing Layer
//!
//! Turns clinical event payloads into fixed-length BLAKE3 digests.
//!
//! Canonical form:
//! - object keys in lexicographic order
//! - `null` object members dropped (absent and `null` fields hash the same)
//! - compact JSON, no insignificant whitespace
//! - RFC 3339 timestamp strings rendered as UTC ISO-8601 with millisecond precision

use crate::error::{CoreError, Result};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Hex length of a BLAKE3-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Lowercase hex BLAKE3 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a digest from its hex form. Uppercase input is normalized.
    pub fn from_hex(hex_str: impl AsRef<str>) -> Result<Self> {
        let normalized = hex_str.as_ref().trim().to_ascii_lowercase();
        if normalized.len() != DIGEST_HEX_LEN {
            return Err(CoreError::InvalidDigest(format!(
                "expected {} hex characters, got {}",
                DIGEST_HEX_LEN,
                normalized.len()
            )));
        }
        if !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidDigest(format!(
                "non-hex characters in {}",
                normalized
            )));
        }
        Ok(Self(normalized))
    }

    /// Wrap raw hash output
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode back to raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        // Always valid: constructors only admit 64 lowercase hex chars
        if let Ok(bytes) = hex::decode(&self.0) {
            out.copy_from_slice(&bytes);
        }
        out
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Digest an arbitrary serializable payload in canonical form.
///
/// Any string value holding an RFC 3339 timestamp is hashed as its UTC instant in
/// [`iso8601`] form, so `2024-03-01T09:30:00Z`, `2024-03-01T09:30:00.000Z` and
/// `2024-03-01T10:30:00+01:00` all produce the same digest. This covers chrono's default
/// `DateTime` serialization as well as fields serialized with [`iso8601`].
pub fn digest<T: Serialize + ?Sized>(payload: &T) -> Result<Digest> {
    let value = serde_json::to_value(payload)?;
    Ok(digest_value(&value))
}

/// Digest a JSON value in canonical form. Total for every JSON input.
pub fn digest_value(value: &Value) -> Digest {
    digest_bytes(canonical_json(value).as_bytes())
}

/// Digest raw bytes with no canonicalization
pub fn digest_bytes(bytes: &[u8]) -> Digest {
    Digest::from_bytes(blake3::hash(bytes).as_bytes())
}

/// Render the canonical JSON text that [`digest_value`] hashes
pub fn canonical_json(value: &Value) -> String {
    // Serializing a Value through the sorted adapter cannot fail
    serde_json::to_string(&Canonical(value)).unwrap_or_default()
}

/// Serialization adapter that emits sorted keys and skips null members without
/// cloning the input tree.
struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => {
                let sorted: BTreeMap<&str, &Value> = map
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.as_str(), v))
                    .collect();
                let mut out = serializer.serialize_map(Some(sorted.len()))?;
                for (key, value) in sorted {
                    out.serialize_entry(key, &Canonical(value))?;
                }
                out.end()
            }
            Value::Array(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    out.serialize_element(&Canonical(item))?;
                }
                out.end()
            }
            Value::String(text) => match chrono::DateTime::parse_from_rfc3339(text) {
                Ok(dt) => serializer.serialize_str(&iso8601::format(&dt.with_timezone(&chrono::Utc))),
                Err(_) => serializer.serialize_str(text),
            },
            other => other.serialize(serializer),
        }
    }
}

/// Serde helpers rendering `DateTime<Utc>` as ISO-8601 with millisecond precision,
/// e.g. `2024-03-01T09:30:00.000Z`.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
