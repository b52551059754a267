//! The canonical chain: linear extension, atomic reorg, and read access to
//! persisted blocks and transactions.

use crate::block::Block;
use crate::error::{ChainError, Result};
use crate::params::ChainParams;
use crate::storage::{ChainStore, StoreTxn, StoreView};
use crate::transaction::{SpendLookup, Transaction, TxOutput};
use crate::utxo;
use chain_shared::Hash256;
use sled::transaction::ConflictableTransactionError;
use std::sync::atomic::AtomicBool;

/// Fixed at genesis so repeated runs of the same parameters produce the same
/// chain; there is no wall-clock dependency in this engine.
const GENESIS_TIMESTAMP: i64 = 1_700_000_000;

fn abort(e: ChainError) -> ConflictableTransactionError<ChainError> {
    ConflictableTransactionError::Abort(e)
}

fn storage_err(e: sled::Error) -> ChainError {
    ChainError::StorageFailure(e.to_string())
}

pub struct MainChain<S: ChainStore> {
    store: S,
    subsidy: u64,
}

impl<S: ChainStore> MainChain<S> {
    #[must_use]
    pub fn new(store: S, subsidy: u64) -> Self {
        Self { store, subsidy }
    }

    #[must_use]
    pub fn with_params(store: S, params: ChainParams) -> Self {
        Self::new(store, params.subsidy)
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn subsidy(&self) -> u64 {
        self.subsidy
    }

    /// The unspent outputs currently on record for `tx_id`, read directly
    /// from the UTXO index (tip state, not as-of any particular height).
    pub fn utxo_outputs(&self, tx_id: &str) -> Result<Option<Vec<TxOutput>>> {
        self.store.view(|v| utxo::get(&v, tx_id))
    }

    /// Walks main blocks from `height + 1` to the tip, returning the set of
    /// transaction ids those blocks created and, for every non-coinbase input
    /// they consumed whose referenced transaction predates `height`, the
    /// output that input consumed (recoverable from the input's carried
    /// `amount` and `pub_key`). This is the context a side-chain branch
    /// rooted at `height` needs to resolve an input against outputs that
    /// existed on main at the fork point but have since been spent there.
    pub fn txo_change_since(
        &self,
        height: u64,
    ) -> Result<(std::collections::HashSet<String>, std::collections::HashMap<String, Vec<TxOutput>>)> {
        let mut created_after = std::collections::HashSet::new();
        let mut restorable: std::collections::HashMap<String, Vec<TxOutput>> = std::collections::HashMap::new();
        let Some((tip_height, _)) = self.tip()? else {
            return Ok((created_after, restorable));
        };
        let mut h = height + 1;
        while h <= tip_height {
            let block = self
                .get_block_by_height(h)?
                .ok_or_else(|| ChainError::ChainInvariant("hole in main chain height index".into()))?;
            for tx in &block.transactions {
                created_after.insert(tx.tx_id.clone());
            }
            for tx in &block.transactions {
                if tx.is_coinbase() {
                    continue;
                }
                for input in &tx.vin {
                    if created_after.contains(&input.prev_tx_id) {
                        continue;
                    }
                    let restored = TxOutput::new(
                        input.prev_vout,
                        input.amount,
                        chain_shared::crypto::hash_pubkey(&input.pub_key),
                    );
                    restorable.entry(input.prev_tx_id.clone()).or_default().push(restored);
                }
            }
            h += 1;
        }
        Ok((created_after, restorable))
    }

    /// Re-derives the UTXO index from the blocks currently on disk, in place
    /// of whatever is there now. Run on cold start against a store that
    /// wasn't shut down cleanly, or on an explicit reindex request.
    pub fn reindex_utxo(&self) -> Result<()> {
        let blocks: Result<Vec<Block>> = self.iter()?.collect();
        utxo::rebuild(&self.store, &blocks?)
    }

    /// Mines and installs the genesis block if the chain is empty. Returns
    /// the existing genesis block (a no-op) if one is already installed.
    pub fn ensure_genesis(&self, beneficiary_pubkey_hash: [u8; 20]) -> Result<Block> {
        if self.tip()?.is_some() {
            return self
                .get_block_by_height(0)?
                .ok_or_else(|| ChainError::ChainInvariant("chain has a tip but no genesis block".into()));
        }
        let coinbase = Transaction::new_coinbase(beneficiary_pubkey_hash, self.subsidy, Some("genesis"));
        let block = Block::mine(Hash256::zero(), vec![coinbase], GENESIS_TIMESTAMP, &AtomicBool::new(false))
            .expect("genesis mining is never cancelled");
        self.extend(block)
    }

    pub fn tip(&self) -> Result<Option<(u64, Hash256)>> {
        match (self.store.current_height()?, self.store.tip_hash()?) {
            (Some(height), Some(hash_hex)) => {
                let bytes = hex::decode(&hash_hex).map_err(|e| ChainError::StorageFailure(e.to_string()))?;
                let array: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| ChainError::StorageFailure("tip hash is not 32 bytes".into()))?;
                Ok(Some((height, Hash256::from_bytes(array))))
            }
            _ => Ok(None),
        }
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>> {
        let key = hex::encode(hash.as_bytes());
        self.store.view(|v| {
            v.blocks
                .get(key.as_bytes())
                .map_err(storage_err)?
                .map(|raw| Block::deserialize(&raw))
                .transpose()
        })
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        self.store.view(|v| {
            let Some(hash_key) = v.height.get(height.to_string().as_bytes()).map_err(storage_err)? else {
                return Ok(None);
            };
            let key = String::from_utf8_lossy(&hash_key).into_owned();
            v.blocks
                .get(key.as_bytes())
                .map_err(storage_err)?
                .map(|raw| Block::deserialize(&raw))
                .transpose()
        })
    }

    pub fn block_exists(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.get_block_by_hash(hash)?.is_some())
    }

    /// A lazy walk from the current tip back to the zero hash.
    pub fn iter(&self) -> Result<BlockIterator<'_, S>> {
        let current = self.tip()?.map_or(Hash256::zero(), |(_, hash)| hash);
        Ok(BlockIterator { store: &self.store, current })
    }

    pub fn get_block_hashes(&self) -> Result<Vec<Hash256>> {
        self.iter()?.map(|b| b.map(|block| block.hash)).collect()
    }

    pub fn find_transaction(&self, tx_id: &str) -> Result<Option<Transaction>> {
        let height_raw = self.store.view(|v| v.tx.get(tx_id.as_bytes()).map_err(storage_err))?;
        let Some(height_raw) = height_raw else {
            return Ok(None);
        };
        let height: u64 = std::str::from_utf8(&height_raw)
            .map_err(|e| ChainError::StorageFailure(e.to_string()))?
            .parse()
            .map_err(|e: std::num::ParseIntError| ChainError::StorageFailure(e.to_string()))?;
        let block = self
            .get_block_by_height(height)?
            .ok_or_else(|| ChainError::ChainInvariant("tx index points at a missing block".into()))?;
        Ok(block.transactions.into_iter().find(|t| t.tx_id == tx_id))
    }

    pub fn find_transactions(&self, tx_ids: &[String]) -> Result<Vec<Transaction>> {
        tx_ids
            .iter()
            .filter_map(|id| self.find_transaction(id).transpose())
            .collect()
    }

    /// Appends `block` to the current tip. `block.height` is overwritten
    /// with the chain-assigned value.
    pub fn extend(&self, mut block: Block) -> Result<Block> {
        block.check()?;
        match self.tip()? {
            None => {
                if block.prev_block_hash != Hash256::zero() {
                    return Err(ChainError::Malformed(
                        "the first block on an empty chain must follow the zero hash".into(),
                    ));
                }
                block.height = 0;
            }
            Some((tip_height, tip_hash)) => {
                if block.prev_block_hash != tip_hash {
                    return Err(ChainError::Malformed("block does not extend the current tip".into()));
                }
                block.height = tip_height + 1;
            }
        }
        self.verify_transactions(&block)?;

        let hash_key = block.hash_key();
        self.store.atomic(|txn| {
            if txn.get_block(&hash_key)?.is_some() {
                return Err(abort(ChainError::Duplicate));
            }
            apply_block(txn, &block)
        })?;
        tracing::debug!(height = block.height, hash = %block.hash, "extended main chain");
        Ok(block)
    }

    /// Atomically rewinds the main chain from its current tip down to (but
    /// not including) the common ancestor of `winning_blocks`, then applies
    /// `winning_blocks` in order. Returns the displaced blocks in their
    /// original chronological (oldest-first) order, so the caller can re-file
    /// them as a side-chain candidate.
    ///
    /// `winning_blocks`' transactions are not re-verified here: the side-chain
    /// tracker already verified them against its virtual UTXO view before
    /// they were accepted as a candidate chain.
    pub fn reorg(&self, winning_blocks: &[Block]) -> Result<Vec<Block>> {
        if winning_blocks.is_empty() {
            return Err(ChainError::Malformed("reorg requires at least one block".into()));
        }
        let fork_parent = winning_blocks[0].prev_block_hash;

        let mut displaced_descending = self.store.atomic(|txn| {
            let Some((mut height, mut hash_key)) = txn.get_tip()? else {
                return Err(abort(ChainError::ChainInvariant("reorg with no existing main chain".into())));
            };
            let mut displaced = Vec::new();
            loop {
                let raw = txn
                    .get_block(&hash_key)?
                    .ok_or_else(|| abort(ChainError::ChainInvariant("missing block during reorg walk-back".into())))?;
                let block = Block::deserialize(&raw).map_err(abort)?;
                if block.hash == fork_parent {
                    break;
                }
                undo_block(txn, &block)?;
                hash_key = hex::encode(block.prev_block_hash.as_bytes());
                if height == 0 {
                    return Err(abort(ChainError::ChainInvariant("reorg walked back past genesis".into())));
                }
                height -= 1;
                displaced.push(block);
            }
            for block in winning_blocks {
                apply_block(txn, block)?;
            }
            Ok(displaced)
        })?;

        displaced_descending.reverse();
        let displaced = displaced_descending;
        tracing::info!(
            displaced = displaced.len(),
            new_tip = %winning_blocks.last().expect("checked non-empty above").hash,
            "reorganized main chain"
        );
        Ok(displaced)
    }

    fn verify_transactions(&self, block: &Block) -> Result<()> {
        self.store.view(|v| {
            let mut lookup = SpendLookup::new();
            for tx in &block.transactions {
                if tx.is_coinbase() {
                    continue;
                }
                for input in &tx.vin {
                    if lookup.get(&input.prev_tx_id, input.prev_vout).is_some() {
                        continue;
                    }
                    let outputs = utxo::get(&v, &input.prev_tx_id)?;
                    for output in outputs.into_iter().flatten() {
                        lookup.insert(input.prev_tx_id.clone(), output);
                    }
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
                // any surplus of input.amount over output.value is the sender's
                // to reclaim via a change output; it is not collected as a fee.
            }
            let coinbase_total: u64 = block.transactions[0].vout.iter().map(|o| o.value).sum();
            if coinbase_total != self.subsidy {
                return Err(ChainError::Malformed("coinbase value does not equal the fixed subsidy".into()));
            }
            Ok(())
        })
    }
}

type TxnResult<T> = std::result::Result<T, ConflictableTransactionError<ChainError>>;

fn apply_block(txn: &StoreTxn, block: &Block) -> TxnResult<()> {
    let hash_key = block.hash_key();
    let height_key = block.height_key();
    for tx in &block.transactions {
        if txn.tx.get(tx.tx_id.as_bytes())?.is_some() {
            return Err(abort(ChainError::Duplicate));
        }
    }
    txn.put_block(&hash_key, &block.serialize())?;
    txn.put_height(&height_key, &hash_key)?;
    for tx in &block.transactions {
        txn.put_tx_height(&tx.tx_id, &height_key)?;
        let vin_spent: Vec<(String, i64)> = tx
            .vin
            .iter()
            .filter(|i| !i.is_coinbase())
            .map(|i| (i.prev_tx_id.clone(), i.prev_vout))
            .collect();
        utxo::apply_transaction(txn, &tx.tx_id, &vin_spent, &tx.vout)?;
    }
    txn.set_tip(&height_key, &hash_key)?;
    Ok(())
}

/// The inverse of [`apply_block`]: restores every output the block's
/// transactions consumed and drops every output they deposited.
fn undo_block(txn: &StoreTxn, block: &Block) -> TxnResult<()> {
    let height_key = block.height_key();
    txn.delete_block(&block.hash_key())?;
    txn.delete_height(&height_key)?;
    for tx in &block.transactions {
        txn.delete_tx_height(&tx.tx_id)?;
        if !tx.is_coinbase() {
            for input in &tx.vin {
                let restored = TxOutput::new(
                    input.prev_vout,
                    input.amount,
                    chain_shared::crypto::hash_pubkey(&input.pub_key),
                );
                utxo::restore_output(txn, &input.prev_tx_id, restored)?;
            }
        }
        txn.delete_utxo(&tx.tx_id)?;
    }
    Ok(())
}

pub struct BlockIterator<'a, S: ChainStore> {
    store: &'a S,
    current: Hash256,
}

impl<'a, S: ChainStore> Iterator for BlockIterator<'a, S> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == Hash256::zero() {
            return None;
        }
        let key = hex::encode(self.current.as_bytes());
        let result = self
            .store
            .view(|v| v.blocks.get(key.as_bytes()).map_err(storage_err)?.map(|raw| Block::deserialize(&raw)).transpose());
        match result {
            Ok(Some(block)) => {
                self.current = block.prev_block_hash;
                Some(Ok(block))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
