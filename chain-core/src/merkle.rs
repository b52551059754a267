//! Merkle tree root computation over transaction content hashes.

use chain_shared::Hash256;

/// Computes the Merkle root of `leaves`.
///
/// The leaf layer is padded with copies of the *last* leaf up to the next
/// power of two (rather than re-duplicating an odd node at every level), so a
/// single-leaf tree's root is simply that leaf, and every non-leaf node is
/// `SHA-256(left || right)`.
///
/// # Panics
///
/// Panics if `leaves` is empty — a block always has at least a coinbase
/// transaction.
#[must_use]
pub fn calculate_root(leaves: &[Hash256]) -> Hash256 {
    assert!(!leaves.is_empty(), "merkle tree needs at least one leaf");
    let mut level = pad_to_power_of_two(leaves);
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let mut data = Vec::with_capacity(64);
                data.extend_from_slice(pair[0].as_bytes());
                data.extend_from_slice(pair[1].as_bytes());
                Hash256::hash(&data)
            })
            .collect();
    }
    level[0]
}

fn pad_to_power_of_two(leaves: &[Hash256]) -> Vec<Hash256> {
    let mut padded = leaves.to_vec();
    let target = padded.len().next_power_of_two();
    let last = *padded.last().expect("checked non-empty by caller");
    padded.resize(target, last);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> Hash256 {
        Hash256::hash(&[byte])
    }

    #[test]
    fn single_leaf_tree_root_is_the_leaf() {
        let a = leaf(1);
        assert_eq!(calculate_root(&[a]), a);
    }

    #[test]
    fn two_leaves_hash_to_their_concatenation() {
        let a = leaf(1);
        let b = leaf(2);
        let mut data = Vec::new();
        data.extend_from_slice(a.as_bytes());
        data.extend_from_slice(b.as_bytes());
        assert_eq!(calculate_root(&[a, b]), Hash256::hash(&data));
    }

    #[test]
    fn odd_leaf_count_pads_with_last_leaf() {
        let a = leaf(1);
        let b = leaf(2);
        let c = leaf(3);
        // three leaves pad to four by duplicating the last leaf (c), not b.
        assert_eq!(calculate_root(&[a, b, c]), calculate_root(&[a, b, c, c]));
    }

    #[test]
    fn root_is_order_sensitive() {
        let a = leaf(1);
        let b = leaf(2);
        assert_ne!(calculate_root(&[a, b]), calculate_root(&[b, a]));
    }

    #[test]
    fn five_leaves_pad_to_eight() {
        let leaves: Vec<Hash256> = (1..=5).map(leaf).collect();
        let mut padded = leaves.clone();
        padded.resize(8, leaves[4]);
        assert_eq!(calculate_root(&leaves), calculate_root(&padded));
    }
}
