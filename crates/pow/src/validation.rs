//! Header-level proof-of-work checks.

use std::fmt;

use mwd_consensus::constants::{EDGEBITS, PROOFSIZE};
use mwd_primitives::BlockHeader;

use crate::cuckarooz::{self, PowError};
use crate::difficulty::proof_difficulty;
use crate::siphash::SipHashKeys;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowValidationError {
    /// Proof edge bits differ from the consensus graph size.
    EdgeBits(u8),
    /// Proof nonce count differs from the consensus proof size.
    ProofSize(usize),
    Cycle(PowError),
}

impl fmt::Display for PowValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowValidationError::EdgeBits(bits) => write!(f, "unsupported edge bits {bits}"),
            PowValidationError::ProofSize(size) => write!(f, "bad proof size {size}"),
            PowValidationError::Cycle(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowValidationError {}

impl From<PowError> for PowValidationError {
    fn from(err: PowError) -> Self {
        PowValidationError::Cycle(err)
    }
}

/// Verifies the header's Cuckarooz proof against its own pre-PoW bytes.
pub fn verify_header_pow(header: &BlockHeader) -> Result<(), PowValidationError> {
    if header.pow.edge_bits != EDGEBITS {
        return Err(PowValidationError::EdgeBits(header.pow.edge_bits));
    }
    if header.pow.nonces.len() != PROOFSIZE {
        return Err(PowValidationError::ProofSize(header.pow.nonces.len()));
    }
    let keys = SipHashKeys::from_header_bytes(&header.pre_pow());
    cuckarooz::verify(&header.pow, &keys)?;
    Ok(())
}

/// Difficulty this header's proof achieves under its scaling factor.
pub fn header_pow_difficulty(header: &BlockHeader) -> u64 {
    proof_difficulty(&header.pow, header.secondary_scaling)
}
