//! Base58Check address encoding (Bitcoin alphabet, version byte `0x00`).

use crate::error::Error;
use crate::hash::Hash256;

const VERSION: u8 = 0x00;
const CHECKSUM_LEN: usize = 4;

/// Encodes a 20-byte pubkey hash as a Base58Check address.
#[must_use]
pub fn encode(pubkey_hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(1 + 20 + CHECKSUM_LEN);
    payload.push(VERSION);
    payload.extend_from_slice(pubkey_hash);
    let checksum = Hash256::double_hash(&payload);
    payload.extend_from_slice(&checksum.as_bytes()[..CHECKSUM_LEN]);
    bs58::encode(payload).into_string()
}

/// Decodes a Base58Check address back into its 20-byte pubkey hash.
///
/// # Errors
///
/// Returns an error if the string isn't valid Base58, has the wrong payload
/// length, or its checksum doesn't match.
pub fn decode(address: &str) -> Result<[u8; 20], Error> {
    let payload = bs58::decode(address)
        .into_vec()
        .map_err(|e| Error::Base58Decode(e.to_string()))?;
    if payload.len() != 1 + 20 + CHECKSUM_LEN {
        return Err(Error::Base58Decode(format!(
            "expected {} byte payload, got {}",
            1 + 20 + CHECKSUM_LEN,
            payload.len()
        )));
    }
    let (versioned, checksum) = payload.split_at(payload.len() - CHECKSUM_LEN);
    let expected = Hash256::double_hash(versioned);
    if &expected.as_bytes()[..CHECKSUM_LEN] != checksum {
        return Err(Error::ChecksumMismatch);
    }
    let mut pubkey_hash = [0u8; 20];
    pubkey_hash.copy_from_slice(&versioned[1..]);
    Ok(pubkey_hash)
}

/// True if `address` decodes to a valid, checksum-correct pubkey hash.
#[must_use]
pub fn is_valid(address: &str) -> bool {
    decode(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let pubkey_hash = [7u8; 20];
        let address = encode(&pubkey_hash);
        assert_eq!(decode(&address).unwrap(), pubkey_hash);
        assert!(is_valid(&address));
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut address = encode(&[9u8; 20]).into_bytes();
        let last = address.len() - 1;
        address[last] = if address[last] == b'1' { b'2' } else { b'1' };
        let address = String::from_utf8(address).unwrap();
        assert!(!is_valid(&address));
    }

    #[test]
    fn rejects_garbage_input() {
        assert!(!is_valid("not a base58 address!!"));
    }
}
