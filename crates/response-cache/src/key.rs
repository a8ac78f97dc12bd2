//! Deterministic cache keys

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Cache key derived from an operation, its target and its parameters.
///
/// `"{operation}:{BASE64URL(SHA256(operation, target, params))}"`. The target
/// is trimmed and lower-cased and parameter objects are hashed with their
/// keys sorted, so `{"a":1,"b":2}` and `{"b":2,"a":1}` share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(operation: &str, target: &str, params: &Value) -> Self {
        let target = target.trim().to_lowercase();
        let params = canonicalize(params).to_string();

        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(target.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.as_bytes());

        Self(format!("{operation}:{}", URL_SAFE_NO_PAD.encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Rebuild `value` with object keys in sorted order at every depth.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
