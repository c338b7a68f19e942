//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod header;
pub mod short_id;
pub mod transaction;

pub use block::{Block, CompactBlock};
pub use encoding::{DecodeError, Decoder, Encoder, ProtocolVersion};
pub use hash::{hash, hash_with_index, to_hex};
pub use header::{BlockHeader, ProofOfWork};
pub use short_id::ShortId;
pub use transaction::{
    BlindingBytes, Commitment, KernelFeatures, OutputFeatures, RangeProofBytes, SignatureBytes,
    Transaction, TransactionBody, TxInput, TxKernel, TxOutput,
};
