//! A flat, header-less block: the PoW fields live alongside the transaction
//! list rather than in a separate header type.

use crate::error::{ChainError, Result};
use crate::merkle;
use crate::pow;
use crate::transaction::Transaction;
use chain_shared::Hash256;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub prev_block_hash: Hash256,
    pub timestamp: i64,
    pub nonce: u32,
    /// Assigned by the main chain (or side-chain tracker) on acceptance, not
    /// at mining time.
    pub height: u64,
    pub hash: Hash256,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Mines a block extending `prev_block_hash` over `transactions`, or
    /// returns `None` if `cancel` fires before a valid nonce is found.
    #[must_use]
    pub fn mine(
        prev_block_hash: Hash256,
        transactions: Vec<Transaction>,
        timestamp: i64,
        cancel: &AtomicBool,
    ) -> Option<Self> {
        let mut block = Self {
            prev_block_hash,
            timestamp,
            nonce: 0,
            height: 0,
            hash: Hash256::zero(),
            transactions,
        };
        let merkle_root = block.hash_transactions();
        match pow::run(&prev_block_hash, &merkle_root, timestamp, cancel) {
            pow::MineOutcome::Found { nonce, hash } => {
                block.nonce = nonce;
                block.hash = hash;
                Some(block)
            }
            pow::MineOutcome::Cancelled => None,
        }
    }

    #[must_use]
    pub fn hash_transactions(&self) -> Hash256 {
        let leaves: Vec<Hash256> = self.transactions.iter().map(Transaction::content_hash).collect();
        merkle::calculate_root(&leaves)
    }

    /// Structural and proof-of-work validation only: no UTXO or signature
    /// checks, since those require chain context this block alone can't
    /// supply.
    pub fn check(&self) -> Result<()> {
        if self.transactions.is_empty() {
            return Err(ChainError::Malformed("block has no transactions".into()));
        }
        if !self.transactions[0].is_coinbase() {
            return Err(ChainError::Malformed("first transaction is not coinbase".into()));
        }
        for tx in &self.transactions[1..] {
            if tx.is_coinbase() {
                return Err(ChainError::Malformed("multiple coinbase transactions".into()));
            }
        }
        for tx in &self.transactions {
            tx.structural_check()?;
        }
        let merkle_root = self.hash_transactions();
        let recomputed = pow::compute_hash(&self.prev_block_hash, &merkle_root, self.timestamp, self.nonce);
        if recomputed != self.hash || !pow::meets_target(&recomputed) {
            return Err(ChainError::InvalidPoW);
        }
        Ok(())
    }

    #[must_use]
    pub fn height_key(&self) -> String {
        self.height.to_string()
    }

    #[must_use]
    pub fn hash_key(&self) -> String {
        hex::encode(self.hash.as_bytes())
    }

    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("block is always serializable")
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| ChainError::Malformed(e.to_string()))
    }
}
