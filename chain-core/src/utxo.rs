//! The materialized UTXO index: one entry per transaction id, holding that
//! transaction's currently-unspent outputs.

use crate::block::Block;
use crate::error::{ChainError, Result};
use crate::storage::{ChainStore, StoreTxn, StoreView};
use crate::transaction::TxOutput;
use sled::transaction::ConflictableTransactionError;
use std::collections::HashSet;

fn abort(e: ChainError) -> ConflictableTransactionError<ChainError> {
    ConflictableTransactionError::Abort(e)
}

fn decode_outputs(raw: &[u8]) -> Result<Vec<TxOutput>> {
    bincode::deserialize(raw).map_err(|e| ChainError::Malformed(e.to_string()))
}

fn encode_outputs(outputs: &[TxOutput]) -> Vec<u8> {
    bincode::serialize(outputs).expect("output list is always serializable")
}

/// Publishes `tx_id`'s outputs and drops any entry that a consumed input
/// emptied out. Called once per transaction while applying a block.
pub fn apply_transaction(
    txn: &StoreTxn,
    tx_id: &str,
    vin_spent: &[(String, i64)],
    vout: &[TxOutput],
) -> std::result::Result<(), ConflictableTransactionError<ChainError>> {
    for (prev_tx_id, prev_vout) in vin_spent {
        consume_output(txn, prev_tx_id, *prev_vout)?;
    }
    txn.put_utxo(tx_id, &encode_outputs(vout))?;
    Ok(())
}

/// Removes one output from `tx_id`'s unspent set, deleting the whole entry
/// once it's empty.
pub fn consume_output(
    txn: &StoreTxn,
    tx_id: &str,
    vout: i64,
) -> std::result::Result<(), ConflictableTransactionError<ChainError>> {
    let Some(raw) = txn.get_utxo(tx_id)? else {
        return Ok(());
    };
    let mut outputs = decode_outputs(&raw).map_err(abort)?;
    outputs.retain(|o| o.index != vout);
    if outputs.is_empty() {
        txn.delete_utxo(tx_id)?;
    } else {
        txn.put_utxo(tx_id, &encode_outputs(&outputs))?;
    }
    Ok(())
}

/// Restores a previously-consumed output — used when a reorg un-applies
/// blocks from the old main chain.
pub fn restore_output(
    txn: &StoreTxn,
    tx_id: &str,
    output: TxOutput,
) -> std::result::Result<(), ConflictableTransactionError<ChainError>> {
    let mut outputs = match txn.get_utxo(tx_id)? {
        Some(raw) => decode_outputs(&raw).map_err(abort)?,
        None => Vec::new(),
    };
    if !outputs.iter().any(|o| o.index == output.index) {
        outputs.push(output);
    }
    txn.put_utxo(tx_id, &encode_outputs(&outputs))?;
    Ok(())
}

pub fn get(view: &StoreView, tx_id: &str) -> Result<Option<Vec<TxOutput>>> {
    let Some(raw) = view.utxo.get(tx_id.as_bytes()).map_err(storage_err)? else {
        return Ok(None);
    };
    decode_outputs(&raw).map(Some)
}

/// Scans the index, calling `f(tx_id, output)` for every unspent output
/// until it returns `true` (early exit) or the index is exhausted.
pub fn scan(view: &StoreView, mut f: impl FnMut(&str, &TxOutput) -> bool) -> Result<()> {
    for entry in view.utxo.iter() {
        let (key, value) = entry.map_err(storage_err)?;
        let tx_id = std::str::from_utf8(&key).map_err(|e| ChainError::StorageFailure(e.to_string()))?;
        let outputs = decode_outputs(&value)?;
        for output in &outputs {
            if f(tx_id, output) {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Accumulates unspent outputs locked to `pubkey_hash` until their total
/// reaches `amount`, skipping any outpoint present in `exclude` (outputs
/// already committed to an in-flight transaction). Returns the accumulated
/// total and the outpoints selected.
pub fn find_spendable_outputs(
    view: &StoreView,
    pubkey_hash: &[u8; 20],
    amount: u64,
    exclude: &HashSet<(String, i64)>,
) -> Result<(u64, Vec<(String, i64)>)> {
    let mut total = 0u64;
    let mut selected = Vec::new();
    scan(view, |tx_id, output| {
        if output.pubkey_hash != *pubkey_hash {
            return false;
        }
        let key = (tx_id.to_string(), output.index);
        if exclude.contains(&key) {
            return false;
        }
        total = total.saturating_add(output.value);
        selected.push(key);
        total >= amount
    })?;
    Ok((total, selected))
}

/// Sums every unspent output locked to `pubkey_hash`.
pub fn get_balance(view: &StoreView, pubkey_hash: &[u8; 20]) -> Result<u64> {
    let mut total = 0u64;
    scan(view, |_, output| {
        if output.pubkey_hash == *pubkey_hash {
            total = total.saturating_add(output.value);
        }
        false
    })?;
    Ok(total)
}

/// Re-derives the whole index from `blocks` (tip-first, as returned by a
/// main-chain walk) instead of trusting whatever is currently on disk: every
/// existing entry is dropped, spent `(txID, index)` pairs are collected
/// across the full block list, and each transaction's surviving outputs are
/// written back. Used on cold start or an explicit reindex; since the result
/// depends only on `blocks`, running it again over the same chain is a no-op.
pub fn rebuild(store: &impl ChainStore, blocks: &[Block]) -> Result<()> {
    let existing: Vec<Vec<u8>> = store.view(|v| {
        v.utxo
            .iter()
            .map(|entry| entry.map(|(key, _)| key.to_vec()).map_err(storage_err))
            .collect()
    })?;

    let mut spent: HashSet<(String, i64)> = HashSet::new();
    for block in blocks {
        for tx in &block.transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                spent.insert((input.prev_tx_id.clone(), input.prev_vout));
            }
        }
    }

    let mut surviving: Vec<(String, Vec<TxOutput>)> = Vec::new();
    for block in blocks {
        for tx in &block.transactions {
            let unspent: Vec<TxOutput> =
                tx.vout.iter().filter(|o| !spent.contains(&(tx.tx_id.clone(), o.index))).cloned().collect();
            if !unspent.is_empty() {
                surviving.push((tx.tx_id.clone(), unspent));
            }
        }
    }

    store.atomic(|txn| {
        for key in &existing {
            txn.utxo.remove(key.as_slice())?;
        }
        for (tx_id, outputs) in &surviving {
            txn.put_utxo(tx_id, &encode_outputs(outputs))?;
        }
        Ok(())
    })
}

fn storage_err(e: sled::Error) -> ChainError {
    ChainError::StorageFailure(e.to_string())
}
