//! Difficulty scaling and the windowed difficulty floor.

use std::fmt;

use mwd_consensus::constants::{
    BLOCK_TIME_SEC, CLAMP_FACTOR, DIFFICULTY_ADJUST_WINDOW, DIFFICULTY_DAMP_FACTOR,
    MIN_DIFFICULTY,
};
use mwd_consensus::Hash256;
use mwd_primitives::ProofOfWork;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DifficultyError {
    EmptyChain,
    NonContiguous,
}

impl fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DifficultyError::EmptyChain => write!(f, "no headers available"),
            DifficultyError::NonContiguous => {
                write!(f, "header list must be contiguous by height")
            }
        }
    }
}

impl std::error::Error for DifficultyError {}

/// The per-header inputs to the difficulty floor calculation.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: u64,
    pub timestamp: i64,
    pub difficulty: u64,
}

/// Difficulty achieved by a proof, scaled by the header's secondary scaling
/// factor. Larger is harder; a proof hashing to small values scores high.
pub fn proof_difficulty(proof: &ProofOfWork, scale: u32) -> u64 {
    let scale = scale.max(1) as u128;
    let hash64 = hash_to_u64(&proof.hash()).max(1) as u128;
    let diff = (scale << 64) / hash64;
    diff.min(u64::MAX as u128) as u64
}

fn hash_to_u64(hash: &Hash256) -> u64 {
    u64::from_be_bytes(hash[..8].try_into().expect("8 bytes"))
}

/// Difficulty floor for the block following `chain`, a contiguous ascending
/// run of recent headers ending at the current tip. Observed solve time over
/// the adjustment window is damped and clamped before dividing the summed
/// window difficulty.
pub fn next_difficulty(chain: &[HeaderInfo]) -> Result<u64, DifficultyError> {
    if chain.is_empty() {
        return Err(DifficultyError::EmptyChain);
    }
    ensure_contiguous(chain)?;
    if chain.len() < 2 {
        return Ok(MIN_DIFFICULTY);
    }

    let window = (DIFFICULTY_ADJUST_WINDOW as usize).min(chain.len() - 1);
    let start = chain.len() - window - 1;
    let earliest = &chain[start];
    let latest = chain.last().expect("checked not empty");

    let ts_delta = (latest.timestamp - earliest.timestamp).max(1) as u64;
    let diff_sum: u64 = chain[start + 1..]
        .iter()
        .fold(0u64, |acc, header| acc.saturating_add(header.difficulty));

    let target_window = window as u64 * BLOCK_TIME_SEC;
    let damped = (ts_delta + (DIFFICULTY_DAMP_FACTOR - 1) * target_window) / DIFFICULTY_DAMP_FACTOR;
    let clamped = damped.clamp(target_window / CLAMP_FACTOR, target_window * CLAMP_FACTOR);

    let next = diff_sum.saturating_mul(BLOCK_TIME_SEC) / clamped.max(1);
    Ok(next.max(MIN_DIFFICULTY))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (idx, header) in chain.iter().enumerate() {
        if header.height != base + idx as u64 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}
