//! UTXO transactions: coinbase issuance, P2PKH-equivalent signing and
//! verification.

use crate::error::{ChainError, Result};
use chain_shared::{crypto, Hash256};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The sentinel previous-tx-id a coinbase input carries: no real transaction
/// uses an empty string, so there is no collision with a real spend.
pub const COINBASE_PREV_TX_ID: &str = "";
/// The sentinel previous-output index a coinbase input carries.
pub const COINBASE_PREV_VOUT: i64 = -1;

/// One spent output: a reference to a prior transaction's output, the amount
/// it carried (filled in at signing time), and the unlock proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_tx_id: String,
    pub prev_vout: i64,
    pub amount: u64,
    pub signature: Vec<u8>,
    /// Uncompressed SEC1 public key (`0x04 || X || Y`).
    pub pub_key: Vec<u8>,
}

impl TxInput {
    #[must_use]
    pub fn coinbase(data: &[u8]) -> Self {
        Self {
            prev_tx_id: COINBASE_PREV_TX_ID.to_string(),
            prev_vout: COINBASE_PREV_VOUT,
            amount: 0,
            signature: Vec::new(),
            pub_key: data.to_vec(),
        }
    }

    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.prev_tx_id == COINBASE_PREV_TX_ID && self.prev_vout == COINBASE_PREV_VOUT
    }

    /// True if this input's public key hashes to `pubkey_hash`.
    #[must_use]
    pub fn uses_key(&self, pubkey_hash: &[u8; 20]) -> bool {
        crypto::hash_pubkey(&self.pub_key) == *pubkey_hash
    }
}

/// One created output: an amount locked to a pubkey hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: i64,
    pub value: u64,
    pub pubkey_hash: [u8; 20],
}

impl TxOutput {
    #[must_use]
    pub fn new(index: i64, value: u64, pubkey_hash: [u8; 20]) -> Self {
        Self {
            index,
            value,
            pubkey_hash,
        }
    }

    #[must_use]
    pub fn is_locked_with_key(&self, pubkey_hash: &[u8; 20]) -> bool {
        self.pubkey_hash == *pubkey_hash
    }
}

/// A transaction: a set of spent inputs and created outputs, identified by
/// the hex-encoded SHA-256 of its serialized content (with the id blanked).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
    /// Per-transaction randomness, distinguishing otherwise-identical
    /// coinbase transactions (same height, same beneficiary, same subsidy).
    pub r: String,
}

/// Resolves the output a given input references, so signing and verification
/// can recover the amount and locking pubkey hash without touching storage
/// directly.
#[derive(Debug, Default)]
pub struct SpendLookup {
    outputs: HashMap<(String, i64), TxOutput>,
}

impl SpendLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tx_id: String, output: TxOutput) {
        let key = (tx_id, output.index);
        self.outputs.insert(key, output);
    }

    #[must_use]
    pub fn get(&self, tx_id: &str, vout: i64) -> Option<&TxOutput> {
        self.outputs.get(&(tx_id.to_string(), vout))
    }
}

impl Transaction {
    /// Builds an unsigned coinbase transaction paying `subsidy` to
    /// `beneficiary_pubkey_hash`. `memo` seeds the per-transaction
    /// randomness; pass `None` to draw it from the OS CSPRNG.
    #[must_use]
    pub fn new_coinbase(beneficiary_pubkey_hash: [u8; 20], subsidy: u64, memo: Option<&str>) -> Self {
        let mut tx = Self {
            tx_id: String::new(),
            vin: vec![TxInput::coinbase(memo.unwrap_or("").as_bytes())],
            vout: vec![TxOutput::new(0, subsidy, beneficiary_pubkey_hash)],
            r: memo.map(str::to_string).unwrap_or_default(),
        };
        tx.finalize_id();
        tx
    }

    /// Builds an unsigned transaction spending `inputs` (with `amount` left
    /// at 0 — [`sign`](Self::sign) fills it in from `lookup`) and paying
    /// `outputs`.
    #[must_use]
    pub fn new(vin: Vec<TxInput>, vout: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            tx_id: String::new(),
            vin,
            vout,
            r: String::new(),
        };
        tx.finalize_id();
        tx
    }

    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].is_coinbase()
    }

    /// SHA-256 of the transaction serialized with its id blanked. This is
    /// also the hash used as each Merkle leaf.
    #[must_use]
    pub fn content_hash(&self) -> Hash256 {
        let mut copy = self.clone();
        copy.tx_id.clear();
        let bytes = bincode::serialize(&copy).expect("transaction is always serializable");
        Hash256::hash(&bytes)
    }

    /// Assigns `r` (if empty) and recomputes `tx_id` from the current
    /// content. Call after mutating `vin`/`vout`, before signing.
    pub fn finalize_id(&mut self) {
        if self.r.is_empty() {
            self.r = generate_r();
        }
        self.tx_id = hex::encode(self.content_hash().as_bytes());
    }

    /// An input-only, signature-stripped copy used as the signing/verifying
    /// pre-image: inputs keep only their outpoint, amount zeroed, signature
    /// and public key blanked.
    #[must_use]
    fn trimmed_copy(&self) -> Self {
        let vin = self
            .vin
            .iter()
            .map(|input| TxInput {
                prev_tx_id: input.prev_tx_id.clone(),
                prev_vout: input.prev_vout,
                amount: 0,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();
        Self {
            tx_id: self.tx_id.clone(),
            vin,
            vout: self.vout.clone(),
            r: self.r.clone(),
        }
    }

    /// Structural pre-check, independent of UTXO state: the shape invariants
    /// a block's [`check`](crate::block::Block::check) relies on.
    pub fn structural_check(&self) -> Result<()> {
        if self.r.is_empty() {
            return Err(ChainError::Malformed("transaction has no r".into()));
        }
        if self.tx_id.is_empty() {
            return Err(ChainError::Malformed("transaction has no id".into()));
        }
        if self.vin.is_empty() {
            return Err(ChainError::Malformed("transaction has no inputs".into()));
        }
        if !self.is_coinbase() {
            for input in &self.vin {
                if input.pub_key.is_empty() || input.signature.is_empty() {
                    return Err(ChainError::Malformed(
                        "non-coinbase input missing pubkey or signature".into(),
                    ));
                }
            }
        }
        for output in &self.vout {
            if output.value == 0 {
                return Err(ChainError::Malformed("output has zero value".into()));
            }
        }
        Ok(())
    }

    /// Signs every non-coinbase input with `keypair`, resolving each
    /// referenced output's amount and locking pubkey hash through `lookup`.
    ///
    /// The pre-image for input `i` is the hex encoding of the trimmed copy
    /// with that input's `pub_key` field set to the referenced output's
    /// pubkey hash (not the signer's real key) — this ties the signature to
    /// the exact output being spent, while keeping every other input blank
    /// so inputs can be signed independently.
    pub fn sign(&mut self, keypair: &chain_shared::crypto::KeyPair, lookup: &SpendLookup) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        for input in &mut self.vin {
            let output = lookup
                .get(&input.prev_tx_id, input.prev_vout)
                .ok_or_else(|| ChainError::MissingUtxo {
                    txid: input.prev_tx_id.clone(),
                    vout: input.prev_vout,
                })?;
            input.amount = output.value;
        }
        let mut trimmed = self.trimmed_copy();
        for i in 0..self.vin.len() {
            let output = lookup
                .get(&self.vin[i].prev_tx_id, self.vin[i].prev_vout)
                .ok_or_else(|| ChainError::MissingUtxo {
                    txid: self.vin[i].prev_tx_id.clone(),
                    vout: self.vin[i].prev_vout,
                })?;
            trimmed.vin[i].pub_key = output.pubkey_hash.to_vec();
            let message = signing_message(&trimmed);
            self.vin[i].signature = keypair.sign(message.as_bytes());
            self.vin[i].pub_key = keypair.public_key_bytes();
            trimmed.vin[i].pub_key.clear();
        }
        Ok(())
    }

    /// Verifies every non-coinbase input's signature against `lookup`, and
    /// that its carried public key hashes to the referenced output's
    /// `pubkey_hash`.
    pub fn verify(&self, lookup: &SpendLookup) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        let mut trimmed = self.trimmed_copy();
        for i in 0..self.vin.len() {
            let input = &self.vin[i];
            let output = lookup
                .get(&input.prev_tx_id, input.prev_vout)
                .ok_or_else(|| ChainError::MissingUtxo {
                    txid: input.prev_tx_id.clone(),
                    vout: input.prev_vout,
                })?;
            if output.value != input.amount {
                return Err(ChainError::InvalidSignature);
            }
            if !input.uses_key(&output.pubkey_hash) {
                return Err(ChainError::InvalidSignature);
            }
            trimmed.vin[i].pub_key = output.pubkey_hash.to_vec();
            let message = signing_message(&trimmed);
            let ok = crypto::verify(&input.pub_key, message.as_bytes(), &input.signature)?;
            trimmed.vin[i].pub_key.clear();
            if !ok {
                return Err(ChainError::InvalidSignature);
            }
        }
        Ok(())
    }

    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("transaction is always serializable")
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| ChainError::Malformed(e.to_string()))
    }
}

fn signing_message(trimmed: &Transaction) -> String {
    format!("{}\n", hex::encode(bincode::serialize(trimmed).expect("trimmed copy is always serializable")))
}

fn generate_r() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
