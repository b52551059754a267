use thiserror::Error;

/// Failures surfaced by transaction, block, and chain-level operations.
///
/// Variants follow the error-kind taxonomy of the engine: callers match on
/// kind, not on message text. `ChainInvariant` denotes a state that should be
/// unreachable under correct storage behavior; it is returned rather than
/// panicking, since this is a library and must not abort the process.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("block or transaction already known")]
    Duplicate,

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("invalid proof of work")]
    InvalidPoW,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("insufficient funds: need {need}, have {have}")]
    InsufficientFunds { need: u64, have: u64 },

    #[error("missing utxo {txid}:{vout}")]
    MissingUtxo { txid: String, vout: i64 },

    #[error("storage failure: {0}")]
    StorageFailure(String),

    #[error("chain invariant violated: {0}")]
    ChainInvariant(String),
}

impl From<chain_shared::Error> for ChainError {
    fn from(err: chain_shared::Error) -> Self {
        match err {
            chain_shared::Error::InvalidSignatureEncoding | chain_shared::Error::InvalidKey => {
                Self::InvalidSignature
            }
            other => Self::Malformed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
