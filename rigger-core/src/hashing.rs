//! Content hashing used for config versions

use crate::error::RiggerResult;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 over the JSON encoding of `value`, hex encoded.
///
/// Struct fields serialize in declaration order and maps are expected to be
/// `BTreeMap`, so equal values always hash equally.
pub fn compute_hash<T: Serialize + ?Sized>(value: &T) -> RiggerResult<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_equal_maps_hash_equal() {
        let mut a = BTreeMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = BTreeMap::new();
        b.insert("a", 1);
        b.insert("b", 2);
        assert_eq!(compute_hash(&a).unwrap(), compute_hash(&b).unwrap());
        assert_eq!(compute_hash(&a).unwrap().len(), 64);
    }
}
