use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash, stored in the order it was produced.
///
/// `Display` prints reversed bytes for human display only; every other
/// consumer uses [`Hash256::as_bytes`] unreversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// The all-zero hash, used as the previous-block hash of genesis.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Single SHA-256 digest of `data`.
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// SHA-256 of SHA-256 of `data`, used for Base58Check checksums.
    #[must_use]
    pub fn double_hash(data: &[u8]) -> Self {
        Self::hash(Self::hash(data).as_bytes())
    }

    /// True if, read as a big-endian unsigned integer, this hash is strictly
    /// less than `target` — the proof-of-work acceptance test. Byte arrays
    /// compare lexicographically, which matches big-endian numeric order.
    #[must_use]
    pub fn below_target(&self, target: &[u8; 32]) -> bool {
        self.0 < *target
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl fmt::LowerHex for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_displays_as_all_zeros() {
        assert_eq!(Hash256::zero().to_string(), "0".repeat(64));
    }

    #[test]
    fn display_reverses_bytes_but_as_bytes_does_not() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xde;
        bytes[31] = 0xad;
        let hash = Hash256::from_bytes(bytes);
        assert_eq!(hash.as_bytes()[0], 0xde);
        assert!(hash.to_string().starts_with("ad"));
        assert!(hash.to_string().ends_with("de"));
    }

    #[test]
    fn hash_is_deterministic_and_nonzero() {
        let a = Hash256::hash(b"hello");
        let b = Hash256::hash(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, Hash256::zero());
    }

    #[test]
    fn below_target_is_lexicographic() {
        let mut one = [0u8; 32];
        one[31] = 1;
        let target = [0u8; 32];
        assert!(!Hash256::zero().below_target(&target));
        assert!(!Hash256::from_bytes(one).below_target(&target));
    }
}
