//! Content hashing for conflict detection
//!
//! Records are canonicalized (keys sorted lexicographically at every
//! nesting level, compact separators) before hashing, so the digest
//! depends only on logical content, never on field insertion order.
//!
//! The top-level `version` field is excluded: the version counter is the
//! canonical conflict mechanism and is rewritten by the server on every
//! apply, so including it would make a retried submission of an
//! already-applied change look like new content.

use serde_json::Value;
use sha2::{Digest, Sha256};

const VERSION_FIELD: &str = "version";

/// SHA-256 digest of a record's canonical form, hex encoded
pub fn content_hash(record: &Value) -> String {
    let mut hasher = Sha256::new();
    let mut buf = String::new();
    write_canonical(record, true, &mut buf);
    hasher.update(buf.as_bytes());
    hex::encode(hasher.finalize())
}

/// True if two records carry the same content (version aside)
pub fn content_equal(a: &Value, b: &Value) -> bool {
    content_hash(a) == content_hash(b)
}

fn write_canonical(value: &Value, top_level: bool, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !(top_level && k.as_str() == VERSION_FIELD))
                .collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], false, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, false, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_is_irrelevant() {
        let a = json!({"name": "Amina", "phone": "0700000000", "age": 29});
        let b = json!({"age": 29, "phone": "0700000000", "name": "Amina"});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_nested_order_is_irrelevant() {
        let a = json!({"contact": {"phone": "0700000000", "email": "a@b.c"}});
        let b = json!({"contact": {"email": "a@b.c", "phone": "0700000000"}});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_any_field_difference_changes_digest() {
        let a = json!({"name": "Amina", "phone": "0700000000"});
        let b = json!({"name": "Amina", "phone": "0711111111"});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_top_level_version_is_ignored() {
        let a = json!({"version": 1, "phone": "0700000000"});
        let b = json!({"version": 7, "phone": "0700000000"});
        assert!(content_equal(&a, &b));
    }

    #[test]
    fn test_nested_version_still_counts() {
        let a = json!({"meta": {"version": 1}});
        let b = json!({"meta": {"version": 2}});
        assert!(!content_equal(&a, &b));
    }

    #[test]
    fn test_arrays_keep_order() {
        let a = json!({"visits": [1, 2, 3]});
        let b = json!({"visits": [3, 2, 1]});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = content_hash(&json!({"a": 1}));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
