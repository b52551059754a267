//! The forest of candidate chain extensions: branches rooted at a main-chain
//! ancestor (or forked from another branch), each carrying a virtual UTXO
//! delta so its blocks can be verified without touching the persisted index.

use crate::block::Block;
use crate::error::{ChainError, Result};
use crate::main_chain::MainChain;
use crate::storage::ChainStore;
use crate::transaction::{SpendLookup, TxOutput};
use chain_shared::Hash256;
use std::collections::{HashMap, HashSet};

pub type BranchId = u64;

/// The virtual UTXO delta a branch's blocks have applied on top of whatever
/// it inherited at its fork point: outputs its own transactions created and
/// haven't yet spent (`unspent`), and outpoints it spent that weren't part
/// of its own `unspent` set — i.e. outputs it consumed from its base view
/// (`spent`), tracked so a later block on the same branch can't spend them
/// twice.
#[derive(Debug, Clone, Default)]
struct TxoDelta {
    spent: HashMap<String, Vec<i64>>,
    unspent: HashMap<String, Vec<TxOutput>>,
}

impl TxoDelta {
    fn apply_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.vin {
                    if self.unspent.contains_key(&input.prev_tx_id) {
                        let outputs = self.unspent.get_mut(&input.prev_tx_id).expect("checked above");
                        outputs.retain(|o| o.index != input.prev_vout);
                        if outputs.is_empty() {
                            self.unspent.remove(&input.prev_tx_id);
                        }
                    } else {
                        self.spent.entry(input.prev_tx_id.clone()).or_default().push(input.prev_vout);
                    }
                }
            }
            self.unspent.insert(tx.tx_id.clone(), tx.vout.clone());
        }
    }

    fn is_spent(&self, tx_id: &str, vout: i64) -> bool {
        self.spent.get(tx_id).is_some_and(|vouts| vouts.contains(&vout))
    }

    fn find_unspent(&self, tx_id: &str, vout: i64) -> Option<TxOutput> {
        self.unspent.get(tx_id)?.iter().find(|o| o.index == vout).cloned()
    }
}

struct Branch {
    base_id: BranchId,
    /// Height on the main chain of the ancestor this branch's lineage forks
    /// from — the root fork point, not necessarily the immediate parent
    /// block if this branch itself forked from another branch.
    main_height: u64,
    /// Index into the base branch's own `blocks` this branch forked from.
    /// Meaningless when `base_id == 0` (the base is main itself).
    base_fork_idx: usize,
    blocks: Vec<Block>,
    base_delta: TxoDelta,
    /// `base_delta` with every block in `blocks` applied, in order.
    delta: TxoDelta,
}

impl Branch {
    fn tip(&self) -> &Block {
        self.blocks.last().expect("a branch always has at least one block")
    }

    /// The delta as of `blocks[0..=idx]`, replayed from `base_delta`. Used to
    /// seed a new branch forking off an interior block of this one.
    fn delta_through(&self, idx: usize) -> TxoDelta {
        let mut delta = self.base_delta.clone();
        for block in &self.blocks[..=idx] {
            delta.apply_block(block);
        }
        delta
    }
}

/// The in-memory forest tracked alongside the persisted main chain. Branches
/// are keyed by a monotonically increasing id; a global hash set rejects
/// duplicate blocks across every branch cheaply.
#[derive(Default)]
pub struct SideChainTracker {
    next_id: BranchId,
    branches: HashMap<BranchId, Branch>,
    known_hashes: HashSet<Hash256>,
}

impl SideChainTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            branches: HashMap::new(),
            known_hashes: HashSet::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.known_hashes.contains(hash)
    }

    fn alloc_id(&mut self) -> BranchId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn branch_with_tip(&self, hash: Hash256) -> Option<BranchId> {
        self.branches.iter().find(|(_, b)| b.tip().hash == hash).map(|(&id, _)| id)
    }

    fn branch_with_interior(&self, hash: Hash256) -> Option<(BranchId, usize)> {
        self.branches
            .iter()
            .find_map(|(&id, b)| b.blocks.iter().position(|blk| blk.hash == hash).map(|idx| (id, idx)))
    }

    /// The complete lineage from the main-chain fork point to the branch
    /// currently tipped at `hash`, assembled by walking `base_id` up through
    /// every intermediate branch level — not just that branch's own local
    /// `blocks`, which only cover the span since its own fork. This is what
    /// [`MainChain::reorg`] needs: the full winning chain, however many
    /// branch levels deep the winning tip sits.
    #[must_use]
    pub fn full_chain_ending_in(&self, hash: Hash256) -> Option<Vec<Block>> {
        let id = self.branch_with_tip(hash)?;
        Some(self.assemble_chain(id))
    }

    /// Prepends `id`'s base lineage (recursively, until a branch rooted
    /// directly on main) to `id`'s own local blocks.
    fn assemble_chain(&self, id: BranchId) -> Vec<Block> {
        let branch = &self.branches[&id];
        if branch.base_id == 0 {
            return branch.blocks.clone();
        }
        let base_branch = &self.branches[&branch.base_id];
        let mut chain = self.assemble_chain(branch.base_id);
        let fork_point = chain.len() - base_branch.blocks.len() + branch.base_fork_idx + 1;
        chain.truncate(fork_point);
        chain.extend(branch.blocks.iter().cloned());
        chain
    }

    /// Ingests a single block. Returns the `(height, hash)` of its new
    /// branch tip on acceptance, `None` if it fails verification (dropped,
    /// other branches untouched), or `ChainInvariant` if `block`'s parent is
    /// not known to main or to any tracked branch — callers are expected to
    /// have already confirmed the parent exists before dispatching here.
    pub fn ingest<S: ChainStore>(
        &mut self,
        mut block: Block,
        main: &MainChain<S>,
    ) -> Result<Option<(u64, Hash256)>> {
        if self.known_hashes.contains(&block.hash) {
            return Err(ChainError::Duplicate);
        }

        if let Some(ancestor) = main.get_block_by_hash(&block.prev_block_hash)? {
            block.height = ancestor.height + 1;
            let base_delta = TxoDelta::default();
            if let Err(e) = verify_block(&block, ancestor.height, main, &base_delta) {
                tracing::warn!(hash = %block.hash, error = %e, "side-chain block dropped: failed verification against a main-chain ancestor");
                return Ok(None);
            }
            let mut delta = base_delta.clone();
            delta.apply_block(&block);
            let id = self.alloc_id();
            let result = (block.height, block.hash);
            self.known_hashes.insert(block.hash);
            self.branches.insert(
                id,
                Branch { base_id: 0, main_height: ancestor.height, base_fork_idx: 0, blocks: vec![block], base_delta, delta },
            );
            return Ok(Some(result));
        }

        if let Some(tip_id) = self.branch_with_tip(block.prev_block_hash) {
            let main_height = self.branches[&tip_id].main_height;
            block.height = self.branches[&tip_id].tip().height + 1;
            let delta_before = self.branches[&tip_id].delta.clone();
            if let Err(e) = verify_block(&block, main_height, main, &delta_before) {
                tracing::warn!(hash = %block.hash, error = %e, "side-chain block dropped: failed verification against its branch tip");
                return Ok(None);
            }
            let result = (block.height, block.hash);
            self.known_hashes.insert(block.hash);
            let branch = self.branches.get_mut(&tip_id).expect("looked up above");
            branch.delta.apply_block(&block);
            branch.blocks.push(block);
            return Ok(Some(result));
        }

        if let Some((parent_id, fork_idx)) = self.branch_with_interior(block.prev_block_hash) {
            let parent = &self.branches[&parent_id];
            let main_height = parent.main_height;
            block.height = parent.blocks[fork_idx].height + 1;
            let base_delta = parent.delta_through(fork_idx);
            if let Err(e) = verify_block(&block, main_height, main, &base_delta) {
                tracing::warn!(hash = %block.hash, error = %e, "side-chain block dropped: failed verification at a forked branch point");
                return Ok(None);
            }
            let mut delta = base_delta.clone();
            delta.apply_block(&block);
            let id = self.alloc_id();
            let result = (block.height, block.hash);
            self.known_hashes.insert(block.hash);
            self.branches.insert(
                id,
                Branch { base_id: parent_id, main_height, base_fork_idx: fork_idx, blocks: vec![block], base_delta, delta },
            );
            return Ok(Some(result));
        }

        Err(ChainError::ChainInvariant(
            "side-chain ingest called with a block whose parent is unknown to main and to every branch".into(),
        ))
    }

    /// Ingests an already height-ordered, linearly-linked run of blocks.
    /// Stops at the first block that fails verification without undoing
    /// blocks already accepted; returns the best `(height, hash)` reached.
    pub fn ingest_run<S: ChainStore>(
        &mut self,
        blocks: Vec<Block>,
        main: &MainChain<S>,
    ) -> Result<Option<(u64, Hash256)>> {
        let mut best = None;
        for block in blocks {
            match self.ingest(block, main)? {
                Some(progress) => best = Some(progress),
                None => break,
            }
        }
        Ok(best)
    }

    /// Updates the forest after `main.reorg` has promoted the branch tipped
    /// at `winning_tip` and handed back `displaced` (the old main suffix, in
    /// ascending height order) for re-filing as a fresh side branch:
    /// - the winning branch is dropped — its blocks now belong to main;
    /// - branches that forked off an interior block of the winning branch
    ///   now fork directly off main, at the same (unchanged) fork height;
    /// - `displaced` is re-filed as a new branch rooted at the fork
    ///   ancestor;
    /// - branches that were rooted on the displaced main suffix are rewired
    ///   to fork from that new branch instead.
    pub fn on_reorg<S: ChainStore>(
        &mut self,
        winning_tip: Hash256,
        displaced: Vec<Block>,
        main: &MainChain<S>,
    ) -> Result<()> {
        if let Some(winning_id) = self.branch_with_tip(winning_tip) {
            let winning_heights: Vec<u64> = self.branches[&winning_id].blocks.iter().map(|b| b.height).collect();
            for block in &self.branches[&winning_id].blocks {
                self.known_hashes.remove(&block.hash);
            }
            for branch in self.branches.values_mut() {
                if branch.base_id == winning_id {
                    branch.main_height = winning_heights[branch.base_fork_idx];
                    branch.base_id = 0;
                }
            }
            self.branches.remove(&winning_id);
        }

        let Some(first_displaced) = displaced.first() else {
            return Ok(());
        };
        let fork_hash = first_displaced.prev_block_hash;
        let fork_ancestor = main
            .get_block_by_hash(&fork_hash)?
            .ok_or_else(|| ChainError::ChainInvariant("displaced branch's fork ancestor is missing from main".into()))?;

        let displaced_hashes: HashMap<Hash256, usize> =
            displaced.iter().enumerate().map(|(idx, b)| (b.hash, idx)).collect();

        let mut delta = TxoDelta::default();
        for block in &displaced {
            delta.apply_block(block);
            self.known_hashes.insert(block.hash);
        }
        let new_id = self.alloc_id();
        self.branches.insert(
            new_id,
            Branch {
                base_id: 0,
                main_height: fork_ancestor.height,
                base_fork_idx: 0,
                blocks: displaced,
                base_delta: TxoDelta::default(),
                delta,
            },
        );

        let rewire: Vec<(BranchId, usize)> = self
            .branches
            .iter()
            .filter(|(&id, _)| id != new_id)
            .filter(|(_, b)| b.base_id == 0)
            .filter_map(|(&id, b)| displaced_hashes.get(&b.blocks[0].prev_block_hash).map(|&idx| (id, idx)))
            .collect();

        if !rewire.is_empty() {
            let new_main_height = self.branches[&new_id].main_height;
            for (id, idx) in rewire {
                let new_base_delta = self.branches[&new_id].delta_through(idx);
                let branch = self.branches.get_mut(&id).expect("collected above");
                branch.base_id = new_id;
                branch.main_height = new_main_height;
                branch.base_fork_idx = idx;
                let mut delta = new_base_delta.clone();
                for block in &branch.blocks {
                    delta.apply_block(block);
                }
                branch.base_delta = new_base_delta;
                branch.delta = delta;
            }
        }
        Ok(())
    }
}

/// Resolves every non-coinbase input of `block` against the virtual UTXO
/// view formed by `main` (as of `main_height`) and `side_delta`, then checks
/// signatures and the balance invariant — the side-chain analogue of
/// [`MainChain::extend`]'s transaction verification.
fn verify_block<S: ChainStore>(
    block: &Block,
    main_height: u64,
    main: &MainChain<S>,
    side_delta: &TxoDelta,
) -> Result<()> {
    let (created_after, restorable) = main.txo_change_since(main_height)?;
    let mut lookup = SpendLookup::new();
    for tx in &block.transactions {
        if tx.is_coinbase() {
            continue;
        }
        for input in &tx.vin {
            if lookup.get(&input.prev_tx_id, input.prev_vout).is_some() {
                continue;
            }
            let output = resolve_input(input, &created_after, &restorable, side_delta, main)?;
            lookup.insert(input.prev_tx_id.clone(), output);
        }
    }

    for tx in &block.transactions {
        tx.verify(&lookup)?;
        if tx.is_coinbase() {
            continue;
        }
        let input_total: u64 = tx.vin.iter().map(|i| i.amount).sum();
        let output_total: u64 = tx.vout.iter().map(|o| o.value).sum();
        if input_total < output_total {
            return Err(ChainError::InsufficientFunds { need: output_total, have: input_total });
        }
    }
    let coinbase_total: u64 = block.transactions[0].vout.iter().map(|o| o.value).sum();
    if coinbase_total != main.subsidy() {
        return Err(ChainError::Malformed("coinbase value does not equal the fixed subsidy".into()));
    }
    Ok(())
}

/// Resolution order for an input at fork height `H` (see module docs):
/// 1. the main UTXO index, if the referenced transaction predates `H` and
///    hasn't been spent on this branch already;
/// 2. `restorable` — outputs that existed on main at or before `H` but were
///    later consumed by main blocks above `H`;
/// 3. the side branch's own unspent set;
/// 4. otherwise, the input is unresolvable.
fn resolve_input<S: ChainStore>(
    input: &crate::transaction::TxInput,
    created_after: &HashSet<String>,
    restorable: &HashMap<String, Vec<TxOutput>>,
    side_delta: &TxoDelta,
    main: &MainChain<S>,
) -> Result<TxOutput> {
    if !created_after.contains(&input.prev_tx_id) && !side_delta.is_spent(&input.prev_tx_id, input.prev_vout) {
        if let Some(outputs) = main.utxo_outputs(&input.prev_tx_id)? {
            if let Some(output) = outputs.into_iter().find(|o| o.index == input.prev_vout) {
                return Ok(output);
            }
        }
    }
    if let Some(outputs) = restorable.get(&input.prev_tx_id) {
        if let Some(output) = outputs.iter().find(|o| o.index == input.prev_vout) {
            return Ok(output.clone());
        }
    }
    if let Some(output) = side_delta.find_unspent(&input.prev_tx_id, input.prev_vout) {
        return Ok(output);
    }
    Err(ChainError::MissingUtxo { txid: input.prev_tx_id.clone(), vout: input.prev_vout })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStore;
    use crate::transaction::{Transaction, TxInput};
    use std::sync::atomic::AtomicBool;

    fn new_main() -> (MainChain<SledStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        (MainChain::new(store, 10), dir)
    }

    #[test]
    fn a_block_rooted_at_main_tip_opens_a_new_branch() {
        let (main, _dir) = new_main();
        let genesis = main.ensure_genesis([1u8; 20]).unwrap();
        let mut side = SideChainTracker::new();

        let coinbase = Transaction::new_coinbase([2u8; 20], 10, Some("side"));
        let block = Block::mine(genesis.hash, vec![coinbase], 1, &AtomicBool::new(false)).unwrap();
        let result = side.ingest(block.clone(), &main).unwrap();
        assert_eq!(result, Some((1, block.hash)));
        assert!(side.contains(&block.hash));
    }

    #[test]
    fn a_second_block_extends_the_branch_tip() {
        let (main, _dir) = new_main();
        let genesis = main.ensure_genesis([1u8; 20]).unwrap();
        let mut side = SideChainTracker::new();

        let c1 = Transaction::new_coinbase([2u8; 20], 10, Some("s1"));
        let b1 = Block::mine(genesis.hash, vec![c1], 1, &AtomicBool::new(false)).unwrap();
        side.ingest(b1.clone(), &main).unwrap();

        let c2 = Transaction::new_coinbase([3u8; 20], 10, Some("s2"));
        let b2 = Block::mine(b1.hash, vec![c2], 2, &AtomicBool::new(false)).unwrap();
        let result = side.ingest(b2.clone(), &main).unwrap();
        assert_eq!(result, Some((2, b2.hash)));
    }

    #[test]
    fn forking_an_interior_block_opens_a_sibling_branch() {
        let (main, _dir) = new_main();
        let genesis = main.ensure_genesis([1u8; 20]).unwrap();
        let mut side = SideChainTracker::new();

        let c1 = Transaction::new_coinbase([2u8; 20], 10, Some("s1"));
        let b1 = Block::mine(genesis.hash, vec![c1], 1, &AtomicBool::new(false)).unwrap();
        side.ingest(b1.clone(), &main).unwrap();

        let c2a = Transaction::new_coinbase([3u8; 20], 10, Some("s2a"));
        let b2a = Block::mine(b1.hash, vec![c2a], 2, &AtomicBool::new(false)).unwrap();
        side.ingest(b2a, &main).unwrap();

        let c2b = Transaction::new_coinbase([4u8; 20], 10, Some("s2b"));
        let b2b = Block::mine(b1.hash, vec![c2b], 3, &AtomicBool::new(false)).unwrap();
        let result = side.ingest(b2b.clone(), &main).unwrap();
        assert_eq!(result, Some((2, b2b.hash)));
        assert_eq!(side.branches.len(), 2);
    }

    #[test]
    fn full_chain_ending_in_assembles_a_lineage_across_branch_levels() {
        let (main, _dir) = new_main();
        let genesis = main.ensure_genesis([1u8; 20]).unwrap();
        let mut side = SideChainTracker::new();

        // branch X off genesis: b1, b2
        let c1 = Transaction::new_coinbase([2u8; 20], 10, Some("b1"));
        let b1 = Block::mine(genesis.hash, vec![c1], 1, &AtomicBool::new(false)).unwrap();
        side.ingest(b1.clone(), &main).unwrap();
        let c2 = Transaction::new_coinbase([3u8; 20], 10, Some("b2"));
        let b2 = Block::mine(b1.hash, vec![c2], 2, &AtomicBool::new(false)).unwrap();
        side.ingest(b2.clone(), &main).unwrap();

        // sub-branch Y forks off the interior block b1: c2, c3, c4
        let cc2 = Transaction::new_coinbase([4u8; 20], 10, Some("c2"));
        let bc2 = Block::mine(b1.hash, vec![cc2], 3, &AtomicBool::new(false)).unwrap();
        side.ingest(bc2.clone(), &main).unwrap();
        let cc3 = Transaction::new_coinbase([5u8; 20], 10, Some("c3"));
        let bc3 = Block::mine(bc2.hash, vec![cc3], 4, &AtomicBool::new(false)).unwrap();
        side.ingest(bc3.clone(), &main).unwrap();
        let cc4 = Transaction::new_coinbase([6u8; 20], 10, Some("c4"));
        let bc4 = Block::mine(bc3.hash, vec![cc4], 5, &AtomicBool::new(false)).unwrap();
        let result = side.ingest(bc4.clone(), &main).unwrap();
        assert_eq!(result, Some((4, bc4.hash)));

        let chain = side.full_chain_ending_in(bc4.hash).expect("branch exists");
        assert_eq!(
            chain.iter().map(|b| b.hash).collect::<Vec<_>>(),
            vec![b1.hash, bc2.hash, bc3.hash, bc4.hash],
            "the assembled lineage must include b1 from the base branch, not just Y's own local blocks"
        );
    }

    #[test]
    fn a_double_spend_against_the_fork_point_is_dropped() {
        let owner = chain_shared::crypto::KeyPair::generate();
        let owner_hash = chain_shared::crypto::hash_pubkey(&owner.public_key_bytes());
        let (main, _dir) = new_main();
        let genesis = main.ensure_genesis(owner_hash).unwrap();
        let mut side = SideChainTracker::new();

        let mut lookup = SpendLookup::new();
        lookup.insert(genesis.transactions[0].tx_id.clone(), genesis.transactions[0].vout[0].clone());
        let make_spend = |to: [u8; 20]| {
            let input = TxInput {
                prev_tx_id: genesis.transactions[0].tx_id.clone(),
                prev_vout: 0,
                amount: 0,
                signature: Vec::new(),
                pub_key: Vec::new(),
            };
            let output = TxOutput::new(0, 10, to);
            let mut tx = Transaction::new(vec![input], vec![output]);
            tx.sign(&owner, &lookup).unwrap();
            tx
        };

        let spend_a = make_spend([7u8; 20]);
        let coinbase_a = Transaction::new_coinbase([9u8; 20], 10, Some("a"));
        let block_a = Block::mine(genesis.hash, vec![coinbase_a, spend_a], 1, &AtomicBool::new(false)).unwrap();
        let accepted = side.ingest(block_a.clone(), &main).unwrap();
        assert!(accepted.is_some());

        // a second block at the SAME fork point, double-spending genesis's
        // only output, lands on a distinct branch with a clean base view —
        // this only catches the double-spend once both compete inside a
        // single branch's lineage, so ingest a second spend descending from
        // block_a instead of genesis directly.
        let spend_b = make_spend([8u8; 20]);
        let coinbase_b = Transaction::new_coinbase([10u8; 20], 10, Some("b"));
        let block_b = Block::mine(block_a.hash, vec![coinbase_b, spend_b], 2, &AtomicBool::new(false)).unwrap();
        let result = side.ingest(block_b, &main).unwrap();
        assert!(result.is_none(), "spending an already-consumed output on the same branch must be rejected");
    }
}
