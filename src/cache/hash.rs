// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stepflow contributors

//! Content hashing
//!
//! Uses BLAKE3 for fast, secure content hashing. Values are hashed through
//! their canonical JSON form so that object key order never changes a digest.

use blake3::Hasher;
use serde_json::Value;
use std::collections::BTreeMap;

/// Context string for cache-key derivation
const CACHE_KEY_CONTEXT: &str = "stepflow 2025 step cache key v1";

/// Render a JSON value with object keys sorted and no whitespace
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// Incremental hasher with length-prefixed fields
pub struct ContentHasher {
    hasher: Hasher,
}

impl ContentHasher {
    /// Create a new content hasher
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Hasher in derive-key mode for cache keys
    pub fn for_cache_keys() -> Self {
        Self {
            hasher: Hasher::new_derive_key(CACHE_KEY_CONTEXT),
        }
    }

    /// Hash a labelled field. The label and length prefixes keep adjacent
    /// fields from running into each other.
    pub fn field(&mut self, label: &str, data: &[u8]) -> &mut Self {
        self.hasher.update(&(label.len() as u64).to_le_bytes());
        self.hasher.update(label.as_bytes());
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
        self
    }

    /// Hash a JSON value in canonical form
    pub fn json_field(&mut self, label: &str, value: &Value) -> &mut Self {
        let canonical = canonical_json(value);
        self.field(label, canonical.as_bytes())
    }

    /// Hash arbitrary bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and get the hash
    pub fn finalize(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute a quick hash of a string
pub fn hash_string(s: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(s.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Fingerprint of an artifact value
pub fn hash_value(value: &Value) -> String {
    hash_string(&canonical_json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_string() {
        let hash1 = hash_string("hello");
        let hash2 = hash_string("hello");
        let hash3 = hash_string("world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "s"}});
        assert_eq!(canonical_json(&a), r#"{"a":{"x":"s","y":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_hash_value_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(hash_value(&a), hash_value(&b));
        assert_ne!(hash_value(&a), hash_value(&json!({"a": 1, "b": 3})));
    }

    #[test]
    fn test_fields_do_not_run_together() {
        let mut h1 = ContentHasher::for_cache_keys();
        h1.field("a", b"bc");
        let mut h2 = ContentHasher::for_cache_keys();
        h2.field("ab", b"c");
        assert_ne!(h1.finalize(), h2.finalize());
    }

    #[test]
    fn test_derive_mode_differs_from_plain() {
        let mut plain = ContentHasher::new();
        plain.update(b"data");
        let mut keyed = ContentHasher::for_cache_keys();
        keyed.update(b"data");
        assert_ne!(plain.finalize(), keyed.finalize());
    }
}
