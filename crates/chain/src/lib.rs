//! Chain state: MMRs, UTXO set, block validation, pools, snapshots.

pub mod genesis;
pub mod mmr;
pub mod pool;
pub mod state;
pub mod store;
pub mod testing;
pub mod txhashset;
pub mod validation;

use std::fmt;

pub use pool::{PoolError, PoolType, TransactionPool};
pub use state::{ChainState, ChainStatus};
pub use store::Tip;
pub use txhashset::TxHashSet;
pub use validation::{BlockError, ValidationFlags};

#[derive(Debug)]
pub enum ChainError {
    /// The artifact failed consensus validation; the peer that sent it is at
    /// fault.
    Invalid(BlockError),
    Store(mwd_storage::StoreError),
    Decode(mwd_primitives::DecodeError),
    Crypto(mwd_crypto::CryptoError),
    /// A header or block the operation depends on is not in the store.
    MissingData(&'static str),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Invalid(reason) => write!(f, "invalid: {reason}"),
            ChainError::Store(err) => write!(f, "store failure: {err}"),
            ChainError::Decode(err) => write!(f, "decode failure: {err}"),
            ChainError::Crypto(err) => write!(f, "crypto failure: {err}"),
            ChainError::MissingData(what) => write!(f, "missing data: {what}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<BlockError> for ChainError {
    fn from(err: BlockError) -> Self {
        ChainError::Invalid(err)
    }
}

impl From<mwd_storage::StoreError> for ChainError {
    fn from(err: mwd_storage::StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<mwd_primitives::DecodeError> for ChainError {
    fn from(err: mwd_primitives::DecodeError) -> Self {
        ChainError::Decode(err)
    }
}

impl From<mwd_crypto::CryptoError> for ChainError {
    fn from(err: mwd_crypto::CryptoError) -> Self {
        ChainError::Crypto(err)
    }
}
