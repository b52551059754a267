//! Single-threaded, cooperatively cancellable proof-of-work.

use chain_shared::Hash256;
use std::sync::atomic::{AtomicBool, Ordering};

/// Fixed proof-of-work difficulty, expressed as leading zero bits required of
/// the block hash.
pub const TARGET_BITS: u32 = 16;

/// Outcome of a [`run`] call.
pub enum MineOutcome {
    /// A nonce producing a hash below target was found.
    Found { nonce: u32, hash: Hash256 },
    /// The cancel signal fired, or the 32-bit nonce space was exhausted,
    /// before a valid nonce was found. Callers should retry with a fresh
    /// timestamp.
    Cancelled,
}

/// Runs the nonce search for a block header described by `prev_block_hash`,
/// `merkle_root` and `timestamp`, checking `cancel` before every hash
/// attempt.
#[must_use]
pub fn run(
    prev_block_hash: &Hash256,
    merkle_root: &Hash256,
    timestamp: i64,
    cancel: &AtomicBool,
) -> MineOutcome {
    let target = target_bytes();
    let mut nonce: u32 = 0;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return MineOutcome::Cancelled;
        }
        let hash = compute_hash(prev_block_hash, merkle_root, timestamp, nonce);
        if hash.below_target(&target) {
            return MineOutcome::Found { nonce, hash };
        }
        nonce = match nonce.checked_add(1) {
            Some(next) => next,
            None => return MineOutcome::Cancelled,
        };
    }
}

/// Recomputes the proof-of-work hash for a given header and nonce.
#[must_use]
pub fn compute_hash(
    prev_block_hash: &Hash256,
    merkle_root: &Hash256,
    timestamp: i64,
    nonce: u32,
) -> Hash256 {
    Hash256::hash(&prepare_data(prev_block_hash, merkle_root, timestamp, nonce))
}

/// True if `hash` satisfies the fixed difficulty target.
#[must_use]
pub fn meets_target(hash: &Hash256) -> bool {
    hash.below_target(&target_bytes())
}

fn prepare_data(
    prev_block_hash: &Hash256,
    merkle_root: &Hash256,
    timestamp: i64,
    nonce: u32,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 32 + 8 + 8 + 8);
    data.extend_from_slice(prev_block_hash.as_bytes());
    data.extend_from_slice(merkle_root.as_bytes());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(&i64::from(TARGET_BITS).to_be_bytes());
    data.extend_from_slice(&i64::from(nonce).to_be_bytes());
    data
}

/// The 256-bit target `1 << (256 - TARGET_BITS)`, as a big-endian byte array.
fn target_bytes() -> [u8; 32] {
    let shift = 256 - TARGET_BITS;
    let byte_from_lsb = (shift / 8) as usize;
    let bit_in_byte = shift % 8;
    let mut bytes = [0u8; 32];
    bytes[31 - byte_from_lsb] = 1u8 << bit_in_byte;
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_bytes_has_a_single_set_bit() {
        let target = target_bytes();
        let set_bits: u32 = target.iter().map(|b| b.count_ones()).sum();
        assert_eq!(set_bits, 1);
        // target_bits=16 leading zero bits means the value is 2^240, which
        // sets bit 0 of byte index 1 (big-endian, 0 = most significant byte).
        assert_eq!(target[1], 1);
    }

    #[test]
    fn run_finds_a_nonce_that_meets_target_and_validates() {
        let prev = Hash256::zero();
        let merkle_root = Hash256::hash(b"tx");
        let cancel = AtomicBool::new(false);
        match run(&prev, &merkle_root, 0, &cancel) {
            MineOutcome::Found { nonce, hash } => {
                assert!(meets_target(&hash));
                assert_eq!(compute_hash(&prev, &merkle_root, 0, nonce), hash);
            }
            MineOutcome::Cancelled => panic!("mining should not be cancelled in this test"),
        }
    }

    #[test]
    fn cancel_signal_stops_the_search() {
        let prev = Hash256::zero();
        let merkle_root = Hash256::hash(b"tx");
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            run(&prev, &merkle_root, 0, &cancel),
            MineOutcome::Cancelled
        ));
    }

    #[test]
    fn compute_hash_is_deterministic() {
        let prev = Hash256::zero();
        let merkle_root = Hash256::hash(b"tx");
        assert_eq!(
            compute_hash(&prev, &merkle_root, 42, 7),
            compute_hash(&prev, &merkle_root, 42, 7)
        );
    }
}
