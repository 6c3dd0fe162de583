//! Ordered context-group bindings

use crate::fingerprint::Fingerprint;
use indexmap::IndexMap;

/// Value of one context binding (JSON-serializable by construction)
pub type BindingValue = serde_json::Value;

/// Ordered map of top-level bindings shared across a context group
///
/// Insertion order is part of the snapshot identity: two groups with the
/// same keys bound in a different order hash differently.
pub type Bindings = IndexMap<String, BindingValue>;

/// Hash a binding set into a context snapshot fingerprint
///
/// Hashes keys and canonical JSON values in order, with length framing so
/// adjacent entries cannot collide.
#[must_use]
pub fn bindings_fingerprint(bindings: &Bindings) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    for (key, value) in bindings {
        let value_json = value.to_string();
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update(&(value_json.len() as u64).to_le_bytes());
        hasher.update(value_json.as_bytes());
    }
    Fingerprint::new(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_bindings_hash_consistently() {
        assert_eq!(
            bindings_fingerprint(&Bindings::new()),
            bindings_fingerprint(&Bindings::new())
        );
    }

    #[test]
    fn value_changes_change_snapshot() {
        let mut a = Bindings::new();
        a.insert("x".to_string(), json!(5));
        let mut b = Bindings::new();
        b.insert("x".to_string(), json!(10));
        assert_ne!(bindings_fingerprint(&a), bindings_fingerprint(&b));
    }

    #[test]
    fn insertion_order_is_significant() {
        let mut a = Bindings::new();
        a.insert("x".to_string(), json!(1));
        a.insert("y".to_string(), json!(2));
        let mut b = Bindings::new();
        b.insert("y".to_string(), json!(2));
        b.insert("x".to_string(), json!(1));
        assert_ne!(bindings_fingerprint(&a), bindings_fingerprint(&b));
    }

    #[test]
    fn framing_prevents_boundary_collisions() {
        let mut a = Bindings::new();
        a.insert("ab".to_string(), json!("c"));
        let mut b = Bindings::new();
        b.insert("a".to_string(), json!("bc"));
        assert_ne!(bindings_fingerprint(&a), bindings_fingerprint(&b));
    }
}
