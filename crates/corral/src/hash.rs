//! Content addressing for spec fingerprints and snapshot ETags.
//!
//! Everything that needs cheap equality across processes — spec keys, snapshot
//! ETags, filtered-view ETags — hashes a *canonical* JSON rendering of the
//! content: object keys recursively sorted, compact separators, no trailing
//! whitespace. Two processes serializing equal content therefore always agree
//! on the hash.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// A 64-bit rapidhash over a canonical byte rendering.
///
/// Serializes as a 16-character hex string so the value survives JSON
/// round-trips through runtimes that lose precision on large u64s.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash(u64);

impl ContentHash {
    /// Hash raw bytes with rapidhash v3.
    #[inline]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(rapidhash::v3::rapidhash_v3(data))
    }

    /// Hash the canonical JSON rendering of a serializable value.
    ///
    /// Serialization of library-owned types is infallible; a failure here is
    /// a bug, so the input is reduced to `Value` first and rendered from it.
    pub fn of_canonical<T: Serialize>(value: &T) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        let mut out = String::new();
        write_canonical_json(&value, &mut out);
        Self::of_bytes(out.as_bytes())
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// 16-character lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, std::num::ParseIntError> {
        u64::from_str_radix(s, 16).map(Self)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:016x})", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Render a JSON value canonically: object keys sorted, compact separators.
///
/// Numbers go through serde_json's own formatting, which is already stable
/// for a given value (shortest round-trip representation).
fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical_json(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deterministic_for_equal_bytes() {
        assert_eq!(ContentHash::of_bytes(b"corral"), ContentHash::of_bytes(b"corral"));
        assert_ne!(ContentHash::of_bytes(b"corral"), ContentHash::of_bytes(b"lasso"));
    }

    #[test]
    fn key_order_does_not_affect_hash() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(ContentHash::of_canonical(&a), ContentHash::of_canonical(&b));
    }

    #[test]
    fn array_order_does_affect_hash() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(ContentHash::of_canonical(&a), ContentHash::of_canonical(&b));
    }

    #[test]
    fn hex_roundtrip() {
        let hash = ContentHash::of_bytes(b"roundtrip");
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn serde_as_quoted_hex() {
        let hash = ContentHash::of_bytes(b"wire");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json.len(), 18);
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }
}
