//! Pluggable content digests.
//!
//! Hash strings are always `<algorithm>:<lowercase hex>`, so a digest made by
//! one algorithm can never be mistaken for another.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use super::stable_stringify;

/// A deterministic, fixed-length, collision-resistant digest.
pub trait ContentDigest: Send + Sync {
    /// Algorithm tag used as the hash prefix.
    fn algorithm(&self) -> &'static str;

    /// Lowercase hex digest of `bytes`.
    fn hex(&self, bytes: &[u8]) -> String;

    /// Prefixed digest of `bytes` (`<algorithm>:<hex>`).
    fn digest(&self, bytes: &[u8]) -> String {
        format!("{}:{}", self.algorithm(), self.hex(bytes))
    }

    /// Digest of the canonical form of `value`.
    fn hash_value(&self, value: &Value) -> String {
        self.digest(stable_stringify(value).as_bytes())
    }
}

/// BLAKE3, the default digest for commits and snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Blake3Digest;

impl ContentDigest for Blake3Digest {
    fn algorithm(&self) -> &'static str {
        "blake3"
    }

    fn hex(&self, bytes: &[u8]) -> String {
        blake3::hash(bytes).to_hex().to_string()
    }
}

/// SHA-256, for environments that must interoperate with SHA-2 tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sha256Digest;

impl ContentDigest for Sha256Digest {
    fn algorithm(&self) -> &'static str {
        "sha256"
    }

    fn hex(&self, bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }
}

/// Configurable digest selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl DigestAlgorithm {
    /// The digest implementation for this algorithm.
    #[must_use]
    pub fn digest(self) -> &'static dyn ContentDigest {
        match self {
            Self::Blake3 => &Blake3Digest,
            Self::Sha256 => &Sha256Digest,
        }
    }
}

/// Default content hash (`blake3:<hex>`) of the canonical form of `value`.
#[must_use]
pub fn content_hash(value: &Value) -> String {
    Blake3Digest.hash_value(value)
}

/// Strip the algorithm prefix and keep at most `len` hex characters.
#[must_use]
pub fn truncate_hash(hash: &str, len: usize) -> &str {
    let hex = hash.split_once(':').map_or(hash, |(_, hex)| hex);
    hex.get(..len).unwrap_or(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blake3_prefix_and_length() {
        let h = content_hash(&json!({"a": 1}));
        assert!(h.starts_with("blake3:"));
        assert_eq!(h.len(), "blake3:".len() + 64);
    }

    #[test]
    fn sha256_prefix_and_length() {
        let h = Sha256Digest.hash_value(&json!({"a": 1}));
        assert!(h.starts_with("sha256:"));
        assert_eq!(h.len(), "sha256:".len() + 64);
    }

    #[test]
    fn value_equal_inputs_hash_identically() {
        let a = json!({"price": 1.0, "qty": "1.500000", "tags": ["x"]});
        let b = json!({"tags": ["x"], "qty": 1.5, "price": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(Sha256Digest.hash_value(&a), Sha256Digest.hash_value(&b));
    }

    #[test]
    fn different_values_hash_differently() {
        assert_ne!(content_hash(&json!({"a": 1})), content_hash(&json!({"a": 2})));
        assert_ne!(content_hash(&json!([1, 2])), content_hash(&json!([2, 1])));
    }

    #[test]
    fn algorithms_never_collide_textually() {
        let v = json!("same");
        assert_ne!(
            DigestAlgorithm::Blake3.digest().hash_value(&v),
            DigestAlgorithm::Sha256.digest().hash_value(&v)
        );
    }

    #[test]
    fn truncate_hash_strips_prefix() {
        assert_eq!(truncate_hash("blake3:abcdef0123", 6), "abcdef");
        assert_eq!(truncate_hash("abc", 12), "abc");
    }
}
