use thiserror::Error;

/// Failures from the hash/crypto/address primitive layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid key encoding")]
    InvalidKey,

    #[error("invalid signature encoding")]
    InvalidSignatureEncoding,

    #[error("base58 decode error: {0}")]
    Base58Decode(String),

    #[error("base58check checksum mismatch")]
    ChecksumMismatch,
}
