//! Canonical cache keys for upstream queries.

use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Display;

/// Build a canonical cache key from a query kind, a parameter bag and
/// extra disambiguators.
///
/// Parameters are ordered by name before hashing, so two maps with the
/// same contents always produce the same key regardless of iteration
/// order. Every token is length-prefixed before it enters the digest,
/// which keeps `{"a": "b=c"}` and `{"a=b": "c"}` apart.
///
/// The result looks like `search:3f2a...` so the kind stays readable in logs.
pub fn generate_key<K, V>(kind: &str, params: &HashMap<K, V>, extra: &[&str]) -> String
where
    K: AsRef<str>,
    V: Display,
{
    let mut hasher = Sha256::new();
    feed(&mut hasher, "kind", kind);

    for (name, value) in params
        .iter()
        .map(|(k, v)| (k.as_ref(), v.to_string()))
        .sorted_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(&b.1)))
    {
        feed(&mut hasher, "param", name);
        feed(&mut hasher, "value", &value);
    }

    for token in extra {
        feed(&mut hasher, "extra", token);
    }

    format!("{}:{}", kind, hex::encode(hasher.finalize()))
}

fn feed(hasher: &mut Sha256, tag: &str, token: &str) {
    hasher.update(tag.as_bytes());
    hasher.update((token.len() as u64).to_be_bytes());
    hasher.update(token.as_bytes());
}
