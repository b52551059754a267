//! Dispatches an incoming block to the right destination — main chain,
//! side-chain tracker, or orphan pool — and drives reorgs and orphan
//! splicing as a consequence.

use crate::block::Block;
use crate::error::{ChainError, Result};
use crate::main_chain::MainChain;
use crate::orphan::OrphanPool;
use crate::side_chain::SideChainTracker;
use crate::storage::ChainStore;
use chain_shared::Hash256;

/// What happened to a block handed to [`Coordinator::add_block`].
#[derive(Debug)]
pub enum AddOutcome {
    /// Already known to main, a branch, or the orphan pool — ignored.
    AlreadyKnown,
    /// Appended directly to the main chain tip.
    ExtendedMainChain { height: u64, hash: Hash256 },
    /// Accepted onto (or opened) a side-chain branch that remains behind
    /// the main tip.
    ExtendedSideChain { height: u64, hash: Hash256 },
    /// A side-chain branch overtook main; `displaced` lists the old main
    /// blocks that were rolled back and re-filed as a side branch.
    Reorganized { height: u64, hash: Hash256, displaced: Vec<Block> },
    /// Parent not known anywhere yet — filed in the orphan pool.
    Orphaned,
    /// Failed structural, PoW, or UTXO verification — dropped.
    Rejected(ChainError),
}

pub struct Coordinator<S: ChainStore> {
    main: MainChain<S>,
    side: SideChainTracker,
    orphans: OrphanPool,
}

impl<S: ChainStore> Coordinator<S> {
    #[must_use]
    pub fn new(main: MainChain<S>) -> Self {
        Self {
            main,
            side: SideChainTracker::new(),
            orphans: OrphanPool::new(),
        }
    }

    #[must_use]
    pub fn main(&self) -> &MainChain<S> {
        &self.main
    }

    /// Number of blocks currently held in the orphan pool, awaiting a parent.
    #[must_use]
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// True if `hash` belongs to a tracked side branch (not main, not an
    /// orphan).
    #[must_use]
    pub fn is_on_a_side_branch(&self, hash: &Hash256) -> bool {
        self.side.contains(hash)
    }

    fn block_known(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.main.block_exists(hash)? || self.side.contains(hash) || self.orphans.contains(hash))
    }

    /// Routes `block` to main, a side branch, or the orphan pool, then
    /// splices in any orphans that were waiting on it.
    pub fn add_block(&mut self, block: Block) -> Result<AddOutcome> {
        if self.block_known(&block.hash)? {
            return Ok(AddOutcome::AlreadyKnown);
        }
        if let Err(e) = block.check() {
            tracing::warn!(hash = %block.hash, error = %e, "rejected block: failed structural/PoW check");
            return Ok(AddOutcome::Rejected(e));
        }

        let hash = block.hash;
        let outcome = self.dispatch(block)?;
        if !matches!(outcome, AddOutcome::Rejected(_) | AddOutcome::Orphaned | AddOutcome::AlreadyKnown) {
            self.splice_children(hash)?;
        }
        Ok(outcome)
    }

    fn dispatch(&mut self, block: Block) -> Result<AddOutcome> {
        let parent_hash = block.prev_block_hash;
        let parent_on_main_tip = self.main.tip()?.is_some_and(|(_, tip)| tip == parent_hash);
        let parent_is_genesis_parent = parent_hash == Hash256::zero() && self.main.tip()?.is_none();

        if parent_on_main_tip || parent_is_genesis_parent {
            let hash = block.hash;
            return match self.main.extend(block) {
                Ok(applied) => Ok(AddOutcome::ExtendedMainChain { height: applied.height, hash }),
                Err(e) => {
                    tracing::warn!(hash = %hash, error = %e, "rejected block extending main tip");
                    Ok(AddOutcome::Rejected(e))
                }
            };
        }

        if !self.main.block_exists(&parent_hash)? && !self.side.contains(&parent_hash) {
            let hash = block.hash;
            self.orphans.insert(block);
            tracing::debug!(hash = %hash, parent = %parent_hash, "orphaned block filed, awaiting parent");
            return Ok(AddOutcome::Orphaned);
        }

        let hash = block.hash;
        let Some((height, tip_hash)) = self.side.ingest(block, &self.main)? else {
            return Ok(AddOutcome::Rejected(ChainError::Malformed(
                "block failed side-chain verification".into(),
            )));
        };
        debug_assert_eq!(tip_hash, hash);

        let main_height = self.main.tip()?.map_or(0, |(h, _)| h);
        if height > main_height {
            let winning_blocks = self
                .side
                .full_chain_ending_in(tip_hash)
                .ok_or_else(|| ChainError::ChainInvariant("winning branch vanished before reorg".into()))?;
            let displaced = self.main.reorg(&winning_blocks)?;
            self.side.on_reorg(tip_hash, displaced.clone(), &self.main)?;
            return Ok(AddOutcome::Reorganized { height, hash: tip_hash, displaced });
        }

        Ok(AddOutcome::ExtendedSideChain { height, hash: tip_hash })
    }

    /// After accepting a block, re-dispatches any orphans that were waiting
    /// on it (and, transitively, any waiting on those).
    fn splice_children(&mut self, hash: Hash256) -> Result<()> {
        let mut frontier = vec![hash];
        while let Some(parent) = frontier.pop() {
            for child_hash in self.orphans.children_of(&parent) {
                let Some(child) = self.orphans.remove(&child_hash) else {
                    continue;
                };
                let child_hash = child.hash;
                match self.dispatch(child)? {
                    AddOutcome::Rejected(e) => {
                        tracing::warn!(hash = %child_hash, error = %e, "dropped a spliced orphan");
                    }
                    _ => frontier.push(child_hash),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStore;
    use crate::transaction::Transaction;
    use std::sync::atomic::AtomicBool;

    fn new_coordinator() -> (Coordinator<SledStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let main = MainChain::new(store, 10);
        main.ensure_genesis([1u8; 20]).unwrap();
        (Coordinator::new(main), dir)
    }

    fn mined(prev: Hash256, seed: u8, timestamp: i64) -> Block {
        let coinbase = Transaction::new_coinbase([seed; 20], 10, Some("block"));
        Block::mine(prev, vec![coinbase], timestamp, &AtomicBool::new(false)).unwrap()
    }

    #[test]
    fn a_block_on_the_main_tip_extends_main() {
        let (mut coord, _dir) = new_coordinator();
        let genesis_hash = coord.main().tip().unwrap().unwrap().1;
        let block = mined(genesis_hash, 2, 1);
        let outcome = coord.add_block(block.clone()).unwrap();
        match outcome {
            AddOutcome::ExtendedMainChain { height, hash } => {
                assert_eq!(height, 1);
                assert_eq!(hash, block.hash);
            }
            other => panic!("expected ExtendedMainChain, got {other:?}"),
        }
    }

    #[test]
    fn an_out_of_order_block_is_orphaned_then_spliced_in() {
        let (mut coord, _dir) = new_coordinator();
        let genesis_hash = coord.main().tip().unwrap().unwrap().1;
        let b1 = mined(genesis_hash, 2, 1);
        let b2 = mined(b1.hash, 3, 2);

        let outcome = coord.add_block(b2.clone()).unwrap();
        assert!(matches!(outcome, AddOutcome::Orphaned));
        assert_eq!(coord.main().tip().unwrap().unwrap().0, 0);

        let outcome = coord.add_block(b1.clone()).unwrap();
        assert!(matches!(outcome, AddOutcome::ExtendedMainChain { height: 1, hash } if hash == b1.hash));
        // splicing should have picked up b2 automatically
        assert_eq!(coord.main().tip().unwrap().unwrap(), (2, b2.hash));
    }

    #[test]
    fn a_side_branch_below_main_does_not_reorg() {
        let (mut coord, _dir) = new_coordinator();
        let genesis_hash = coord.main().tip().unwrap().unwrap().1;
        let b1 = mined(genesis_hash, 2, 1);
        coord.add_block(b1.clone()).unwrap();

        let side = mined(genesis_hash, 9, 2);
        let outcome = coord.add_block(side.clone()).unwrap();
        assert!(matches!(outcome, AddOutcome::ExtendedSideChain { height: 1, hash } if hash == side.hash));
        assert_eq!(coord.main().tip().unwrap().unwrap().1, b1.hash);
    }

    #[test]
    fn a_longer_side_branch_triggers_a_reorg() {
        let (mut coord, _dir) = new_coordinator();
        let genesis_hash = coord.main().tip().unwrap().unwrap().1;
        let b1 = mined(genesis_hash, 2, 1);
        coord.add_block(b1.clone()).unwrap();

        let s1 = mined(genesis_hash, 5, 2);
        coord.add_block(s1.clone()).unwrap();
        let s2 = mined(s1.hash, 6, 3);
        let outcome = coord.add_block(s2.clone()).unwrap();
        match outcome {
            AddOutcome::Reorganized { height, hash, displaced } => {
                assert_eq!(height, 2);
                assert_eq!(hash, s2.hash);
                assert_eq!(displaced.len(), 1);
                assert_eq!(displaced[0].hash, b1.hash);
            }
            other => panic!("expected a reorg, got {other:?}"),
        }
        assert_eq!(coord.main().tip().unwrap().unwrap(), (2, s2.hash));
    }

    #[test]
    fn a_reorg_can_promote_a_tip_sitting_two_branch_levels_deep() {
        let (mut coord, _dir) = new_coordinator();
        let genesis_hash = coord.main().tip().unwrap().unwrap().1;

        // main: G -> a -> a2 -> a3 (height 3)
        let a = mined(genesis_hash, 1, 1);
        coord.add_block(a.clone()).unwrap();
        let a2 = mined(a.hash, 2, 2);
        coord.add_block(a2.clone()).unwrap();
        let a3 = mined(a2.hash, 3, 3);
        coord.add_block(a3.clone()).unwrap();

        // branch X off genesis: b1 -> b2, stays behind main.
        let b1 = mined(genesis_hash, 4, 4);
        coord.add_block(b1.clone()).unwrap();
        let b2 = mined(b1.hash, 5, 5);
        coord.add_block(b2.clone()).unwrap();

        // sub-branch Y forks off the interior block b1: c2 -> c3 -> c4.
        let c2 = mined(b1.hash, 6, 6);
        coord.add_block(c2.clone()).unwrap();
        let c3 = mined(c2.hash, 7, 7);
        coord.add_block(c3.clone()).unwrap();
        let c4 = mined(c3.hash, 8, 8);

        let outcome = coord.add_block(c4.clone()).unwrap();
        match outcome {
            AddOutcome::Reorganized { height, hash, displaced } => {
                assert_eq!(height, 4);
                assert_eq!(hash, c4.hash);
                assert_eq!(
                    displaced.iter().map(|b| b.hash).collect::<Vec<_>>(),
                    vec![a.hash, a2.hash, a3.hash]
                );
            }
            other => panic!("expected a reorg promoting b1+c2+c3+c4, got {other:?}"),
        }
        assert_eq!(coord.main().tip().unwrap().unwrap(), (4, c4.hash));
        assert_eq!(coord.main().get_block_by_height(1).unwrap().unwrap().hash, b1.hash);
        assert_eq!(coord.main().get_block_by_height(2).unwrap().unwrap().hash, c2.hash);
        assert_eq!(coord.main().get_block_by_height(3).unwrap().unwrap().hash, c3.hash);
    }

    #[test]
    fn a_duplicate_block_is_ignored() {
        let (mut coord, _dir) = new_coordinator();
        let genesis_hash = coord.main().tip().unwrap().unwrap().1;
        let b1 = mined(genesis_hash, 2, 1);
        coord.add_block(b1.clone()).unwrap();
        let outcome = coord.add_block(b1).unwrap();
        assert!(matches!(outcome, AddOutcome::AlreadyKnown));
    }
}
