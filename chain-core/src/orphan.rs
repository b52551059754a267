//! Blocks that arrived before their parent: held here, keyed both forward
//! (by their own hash) and in reverse (by the parent hash they're waiting
//! on), so a newly accepted block can splice in any children in O(1).

use crate::block::Block;
use chain_shared::Hash256;
use std::collections::HashMap;

#[derive(Default)]
pub struct OrphanPool {
    by_hash: HashMap<Hash256, Block>,
    waiting_on_parent: HashMap<Hash256, Vec<Hash256>>,
}

impl OrphanPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Files `block` under its own hash and under its parent's hash.
    pub fn insert(&mut self, block: Block) {
        let hash = block.hash;
        let parent = block.prev_block_hash;
        self.by_hash.insert(hash, block);
        self.waiting_on_parent.entry(parent).or_default().push(hash);
    }

    /// Removes and returns the block filed under `hash`, also dropping it
    /// from its parent's waiting list.
    pub fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let block = self.by_hash.remove(hash)?;
        if let Some(siblings) = self.waiting_on_parent.get_mut(&block.prev_block_hash) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.waiting_on_parent.remove(&block.prev_block_hash);
            }
        }
        Some(block)
    }

    /// The hashes of orphans waiting on `parent`, if any.
    #[must_use]
    pub fn children_of(&self, parent: &Hash256) -> Vec<Hash256> {
        self.waiting_on_parent.get(parent).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn get(&self, hash: &Hash256) -> Option<&Block> {
        self.by_hash.get(hash)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use std::sync::atomic::AtomicBool;

    fn block(prev: Hash256, seed: u8) -> Block {
        let coinbase = Transaction::new_coinbase([seed; 20], 10, Some("orphan"));
        Block::mine(prev, vec![coinbase], i64::from(seed), &AtomicBool::new(false)).unwrap()
    }

    #[test]
    fn insert_then_remove_round_trips() {
        let mut pool = OrphanPool::new();
        let b = block(Hash256::zero(), 1);
        let hash = b.hash;
        pool.insert(b);
        assert!(pool.contains(&hash));
        let removed = pool.remove(&hash).unwrap();
        assert_eq!(removed.hash, hash);
        assert!(!pool.contains(&hash));
    }

    #[test]
    fn children_of_finds_orphans_waiting_on_a_parent() {
        let mut pool = OrphanPool::new();
        let parent_hash = Hash256::hash(b"some-parent");
        let child_a = block(parent_hash, 2);
        let child_b = block(parent_hash, 3);
        let a_hash = child_a.hash;
        let b_hash = child_b.hash;
        pool.insert(child_a);
        pool.insert(child_b);

        let mut children = pool.children_of(&parent_hash);
        children.sort();
        let mut expected = vec![a_hash, b_hash];
        expected.sort();
        assert_eq!(children, expected);
    }

    #[test]
    fn removing_one_sibling_leaves_the_other_filed() {
        let mut pool = OrphanPool::new();
        let parent_hash = Hash256::hash(b"some-parent");
        let child_a = block(parent_hash, 2);
        let child_b = block(parent_hash, 3);
        let a_hash = child_a.hash;
        let b_hash = child_b.hash;
        pool.insert(child_a);
        pool.insert(child_b);

        pool.remove(&a_hash);
        assert_eq!(pool.children_of(&parent_hash), vec![b_hash]);
    }
}
