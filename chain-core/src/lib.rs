pub mod block;
pub mod coordinator;
pub mod error;
pub mod main_chain;
pub mod merkle;
pub mod orphan;
pub mod params;
pub mod pow;
pub mod side_chain;
pub mod storage;
pub mod transaction;
pub mod utxo;

pub use block::Block;
pub use coordinator::{AddOutcome, Coordinator};
pub use error::{ChainError, Result};
pub use main_chain::MainChain;
pub use orphan::OrphanPool;
pub use params::ChainParams;
pub use side_chain::SideChainTracker;
pub use storage::{ChainStore, SledStore};
pub use transaction::{SpendLookup, Transaction, TxInput, TxOutput};

pub use chain_shared::Hash256;
