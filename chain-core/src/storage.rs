//! Persistent storage: four named buckets (`blocks`, `height`, `tx`, `utxo`)
//! behind a `sled` database, with cross-bucket writes applied atomically via
//! `sled`'s transaction API.

use crate::error::{ChainError, Result};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::path::Path;

const CURRENT_HEIGHT_KEY: &[u8] = b"height";

/// A read-only view over the four buckets, for scans and point lookups that
/// don't need cross-bucket atomicity.
pub struct StoreView<'a> {
    pub blocks: &'a sled::Tree,
    pub height: &'a sled::Tree,
    pub tx: &'a sled::Tree,
    pub utxo: &'a sled::Tree,
}

/// A handle into an in-flight atomic transaction across all four buckets.
/// Passed to the closure given to [`ChainStore::atomic`].
pub struct StoreTxn<'a> {
    pub blocks: &'a sled::transaction::TransactionalTree,
    pub height: &'a sled::transaction::TransactionalTree,
    pub tx: &'a sled::transaction::TransactionalTree,
    pub utxo: &'a sled::transaction::TransactionalTree,
}

type TxnResult<T> = std::result::Result<T, ConflictableTransactionError<ChainError>>;

impl<'a> StoreTxn<'a> {
    pub fn put_block(&self, hash_key: &str, data: &[u8]) -> TxnResult<()> {
        self.blocks.insert(hash_key.as_bytes(), data)?;
        Ok(())
    }

    pub fn delete_block(&self, hash_key: &str) -> TxnResult<()> {
        self.blocks.remove(hash_key.as_bytes())?;
        Ok(())
    }

    pub fn put_height(&self, height_key: &str, hash_key: &str) -> TxnResult<()> {
        self.height.insert(height_key.as_bytes(), hash_key.as_bytes())?;
        Ok(())
    }

    pub fn delete_height(&self, height_key: &str) -> TxnResult<()> {
        self.height.remove(height_key.as_bytes())?;
        Ok(())
    }

    pub fn set_tip(&self, height_key: &str, hash_key: &str) -> TxnResult<()> {
        self.height.insert(CURRENT_HEIGHT_KEY, height_key.as_bytes())?;
        self.height.insert(b"tip", hash_key.as_bytes())?;
        Ok(())
    }

    pub fn put_tx_height(&self, tx_id: &str, height_key: &str) -> TxnResult<()> {
        self.tx.insert(tx_id.as_bytes(), height_key.as_bytes())?;
        Ok(())
    }

    pub fn delete_tx_height(&self, tx_id: &str) -> TxnResult<()> {
        self.tx.remove(tx_id.as_bytes())?;
        Ok(())
    }

    pub fn put_utxo(&self, tx_id: &str, data: &[u8]) -> TxnResult<()> {
        self.utxo.insert(tx_id.as_bytes(), data)?;
        Ok(())
    }

    pub fn delete_utxo(&self, tx_id: &str) -> TxnResult<()> {
        self.utxo.remove(tx_id.as_bytes())?;
        Ok(())
    }

    pub fn get_utxo(&self, tx_id: &str) -> TxnResult<Option<sled::IVec>> {
        Ok(self.utxo.get(tx_id.as_bytes())?)
    }

    pub fn get_block(&self, hash_key: &str) -> TxnResult<Option<sled::IVec>> {
        Ok(self.blocks.get(hash_key.as_bytes())?)
    }

    pub fn get_height_hash(&self, height_key: &str) -> TxnResult<Option<sled::IVec>> {
        Ok(self.height.get(height_key.as_bytes())?)
    }

    /// The current `(height, tip hash key)` pair, read inside this
    /// transaction so a concurrent writer can't move the tip out from under
    /// a reorg walk.
    pub fn get_tip(&self) -> TxnResult<Option<(u64, String)>> {
        let Some(height_raw) = self.height.get(CURRENT_HEIGHT_KEY)? else {
            return Ok(None);
        };
        let Some(hash_raw) = self.height.get(b"tip")? else {
            return Ok(None);
        };
        let height_text = String::from_utf8_lossy(&height_raw).into_owned();
        let height: u64 = height_text.parse().map_err(|_| {
            ConflictableTransactionError::Abort(ChainError::StorageFailure(
                "corrupt height counter".into(),
            ))
        })?;
        Ok(Some((height, String::from_utf8_lossy(&hash_raw).into_owned())))
    }
}

/// The capability the rest of the engine depends on: atomic cross-bucket
/// writes, plus read-only views for scans. `SledStore` is the only
/// implementation, but code outside this module depends on the trait so the
/// backend can be swapped without touching callers.
pub trait ChainStore {
    fn view<T>(&self, f: impl FnOnce(StoreView) -> Result<T>) -> Result<T>;

    fn atomic<T>(&self, f: impl Fn(&StoreTxn) -> TxnResult<T>) -> Result<T>;

    fn current_height(&self) -> Result<Option<u64>> {
        self.view(|v| {
            let Some(raw) = v.height.get(CURRENT_HEIGHT_KEY).map_err(storage_err)? else {
                return Ok(None);
            };
            let text = std::str::from_utf8(&raw).map_err(|e| ChainError::StorageFailure(e.to_string()))?;
            text.parse().map(Some).map_err(|e: std::num::ParseIntError| ChainError::StorageFailure(e.to_string()))
        })
    }

    fn tip_hash(&self) -> Result<Option<String>> {
        self.view(|v| {
            let Some(raw) = v.height.get(b"tip").map_err(storage_err)? else {
                return Ok(None);
            };
            Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
        })
    }
}

fn storage_err(e: sled::Error) -> ChainError {
    ChainError::StorageFailure(e.to_string())
}

/// A `sled`-backed `ChainStore`.
pub struct SledStore {
    blocks: sled::Tree,
    height: sled::Tree,
    tx: sled::Tree,
    utxo: sled::Tree,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(storage_err)?;
        Ok(Self {
            blocks: db.open_tree(b"blocks").map_err(storage_err)?,
            height: db.open_tree(b"height").map_err(storage_err)?,
            tx: db.open_tree(b"tx").map_err(storage_err)?,
            utxo: db.open_tree(b"utxo").map_err(storage_err)?,
        })
    }
}

impl ChainStore for SledStore {
    fn view<T>(&self, f: impl FnOnce(StoreView) -> Result<T>) -> Result<T> {
        f(StoreView {
            blocks: &self.blocks,
            height: &self.height,
            tx: &self.tx,
            utxo: &self.utxo,
        })
    }

    fn atomic<T>(&self, f: impl Fn(&StoreTxn) -> TxnResult<T>) -> Result<T> {
        let result = (&self.blocks, &self.height, &self.tx, &self.utxo).transaction(
            |(blocks, height, tx, utxo)| f(&StoreTxn { blocks, height, tx, utxo }),
        );
        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(storage_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_is_visible_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        store
            .atomic(|txn| {
                txn.put_block("deadbeef", b"block-bytes")?;
                txn.set_tip("0", "deadbeef")?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.current_height().unwrap(), Some(0));
        assert_eq!(store.tip_hash().unwrap().as_deref(), Some("deadbeef"));
        store
            .view(|v| {
                assert_eq!(v.blocks.get(b"deadbeef").unwrap().unwrap().as_ref(), b"block-bytes");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn atomic_write_rolls_back_on_abort() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let outcome: Result<()> = store.atomic(|txn| {
            txn.put_block("deadbeef", b"block-bytes")?;
            Err(ConflictableTransactionError::Abort(ChainError::ChainInvariant(
                "forced abort for test".into(),
            )))
        });
        assert!(outcome.is_err());
        store
            .view(|v| {
                assert!(v.blocks.get(b"deadbeef").unwrap().is_none());
                Ok(())
            })
            .unwrap();
    }
}
