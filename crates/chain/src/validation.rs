//! Stateless block and transaction validation: everything that can be
//! checked without the UTXO set. Pure and parallelizable.

use std::fmt;

use mwd_consensus::constants::{MAX_BLOCK_WEIGHT, MIN_DIFFICULTY, REWARD};
use mwd_crypto::{batch_verify_kernels, commit, commit_value, sum_commits, CryptoError};
use mwd_pow::{header_pow_difficulty, verify_header_pow, PowValidationError};
use mwd_primitives::{
    BlindingBytes, Block, BlockHeader, Commitment, KernelFeatures, OutputFeatures, Transaction,
    TransactionBody, TxOutput,
};
use rayon::prelude::*;

/// Size of each range-proof batch handed to a rayon worker.
const RANGE_PROOF_CHUNK: usize = 32;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockError {
    Pow(PowValidationError),
    /// Claimed block difficulty is below the floor for this height.
    DifficultyTooLow,
    /// Total difficulty does not exceed the parent's.
    TotalDifficultyNotIncreasing,
    /// The proof does not achieve the difficulty the header claims.
    InsufficientPow,
    ExceedsWeight,
    DuplicateInput(Commitment),
    DuplicateCommitment(Commitment),
    MissingInput(Commitment),
    WrongInputFeatures(Commitment),
    UnsortedInputs,
    UnsortedOutputs,
    UnsortedKernels,
    KernelNotWellFormed,
    /// More than one coinbase kernel, or a coinbase artifact where none is
    /// allowed.
    InvalidCoinbase,
    /// A height-locked kernel is not yet spendable at this height.
    KernelLockHeight(u64),
    UnbalancedSums,
    InvalidSignature { index: usize },
    InvalidRangeProof { index: usize },
    RootMismatch,
    MmrSizeMismatch,
    /// Accumulated kernel offset in the header does not match parent plus
    /// the block's own offset.
    OffsetMismatch,
    /// Coinbase output spent before reaching maturity.
    ImmatureCoinbase(Commitment),
    SnapshotInconsistent(&'static str),
    /// Commitment arithmetic itself failed on malformed data.
    Crypto(String),
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::Pow(err) => write!(f, "invalid proof of work: {err}"),
            BlockError::DifficultyTooLow => write!(f, "difficulty below floor"),
            BlockError::TotalDifficultyNotIncreasing => {
                write!(f, "total difficulty not increasing")
            }
            BlockError::InsufficientPow => write!(f, "proof does not meet claimed difficulty"),
            BlockError::ExceedsWeight => write!(f, "body exceeds weight cap"),
            BlockError::DuplicateInput(_) => write!(f, "duplicate input commitment"),
            BlockError::DuplicateCommitment(_) => write!(f, "duplicate output commitment"),
            BlockError::MissingInput(_) => write!(f, "input not in utxo set"),
            BlockError::WrongInputFeatures(_) => write!(f, "input features mismatch"),
            BlockError::UnsortedInputs => write!(f, "inputs not sorted"),
            BlockError::UnsortedOutputs => write!(f, "outputs not sorted"),
            BlockError::UnsortedKernels => write!(f, "kernels not sorted"),
            BlockError::KernelNotWellFormed => write!(f, "kernel fields not well-formed"),
            BlockError::InvalidCoinbase => write!(f, "invalid coinbase"),
            BlockError::KernelLockHeight(height) => {
                write!(f, "kernel locked until height {height}")
            }
            BlockError::UnbalancedSums => write!(f, "kernel sums do not balance"),
            BlockError::InvalidSignature { index } => {
                write!(f, "invalid kernel signature at {index}")
            }
            BlockError::InvalidRangeProof { index } => {
                write!(f, "invalid range proof at {index}")
            }
            BlockError::RootMismatch => write!(f, "mmr roots do not match header"),
            BlockError::MmrSizeMismatch => write!(f, "mmr sizes do not match header"),
            BlockError::OffsetMismatch => write!(f, "kernel offset does not accumulate"),
            BlockError::ImmatureCoinbase(_) => write!(f, "premature coinbase spend"),
            BlockError::SnapshotInconsistent(what) => {
                write!(f, "snapshot inconsistent: {what}")
            }
            BlockError::Crypto(message) => write!(f, "commitment arithmetic failed: {message}"),
        }
    }
}

impl std::error::Error for BlockError {}

impl From<PowValidationError> for BlockError {
    fn from(err: PowValidationError) -> Self {
        BlockError::Pow(err)
    }
}

impl From<CryptoError> for BlockError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKernelSignature { index } => BlockError::InvalidSignature { index },
            CryptoError::InvalidRangeProof { index } => BlockError::InvalidRangeProof { index },
            CryptoError::Secp(inner) => BlockError::Crypto(format!("{inner:?}")),
        }
    }
}

/// Switches for the expensive checks plus the maturity rule, so tests and
/// trusted replays can tune them. Everything defaults to consensus values.
#[derive(Clone, Debug)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_rangeproofs: bool,
    pub check_signatures: bool,
    pub coinbase_maturity: u64,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_rangeproofs: true,
            check_signatures: true,
            coinbase_maturity: mwd_consensus::constants::COINBASE_MATURITY,
        }
    }
}

impl ValidationFlags {
    /// Everything on, the configuration used for peer-supplied data.
    pub fn full() -> Self {
        Self::default()
    }

    /// PoW off, for fixtures that cannot mine.
    pub fn no_pow() -> Self {
        Self {
            check_pow: false,
            ..Self::default()
        }
    }
}

/// Header sanity against its parent: linkage, difficulty accounting, and
/// the proof itself.
pub fn validate_header(
    header: &BlockHeader,
    parent: &BlockHeader,
    difficulty_floor: u64,
    flags: &ValidationFlags,
) -> Result<(), BlockError> {
    if header.total_difficulty <= parent.total_difficulty {
        return Err(BlockError::TotalDifficultyNotIncreasing);
    }
    let block_difficulty = header.total_difficulty - parent.total_difficulty;
    if block_difficulty < difficulty_floor.max(MIN_DIFFICULTY) {
        return Err(BlockError::DifficultyTooLow);
    }
    if flags.check_pow {
        verify_header_pow(header)?;
        if header_pow_difficulty(header) < block_difficulty {
            return Err(BlockError::InsufficientPow);
        }
    }
    Ok(())
}

/// Body invariants that hold for blocks and transactions alike: weight cap,
/// sort/dedup order, kernel well-formedness, lock heights.
pub fn validate_body(body: &TransactionBody, height: u64) -> Result<(), BlockError> {
    if body.weight() > MAX_BLOCK_WEIGHT {
        return Err(BlockError::ExceedsWeight);
    }
    for pair in body.inputs.windows(2) {
        match pair[0].commit.cmp(&pair[1].commit) {
            std::cmp::Ordering::Less => {}
            std::cmp::Ordering::Equal => return Err(BlockError::DuplicateInput(pair[1].commit)),
            std::cmp::Ordering::Greater => return Err(BlockError::UnsortedInputs),
        }
    }
    for pair in body.outputs.windows(2) {
        match pair[0].commit.cmp(&pair[1].commit) {
            std::cmp::Ordering::Less => {}
            std::cmp::Ordering::Equal => {
                return Err(BlockError::DuplicateCommitment(pair[1].commit))
            }
            std::cmp::Ordering::Greater => return Err(BlockError::UnsortedOutputs),
        }
    }
    for pair in body.kernels.windows(2) {
        let left = (pair[0].features.as_u8(), pair[0].excess);
        let right = (pair[1].features.as_u8(), pair[1].excess);
        if left > right {
            return Err(BlockError::UnsortedKernels);
        }
    }
    for kernel in &body.kernels {
        if !kernel.well_formed() {
            return Err(BlockError::KernelNotWellFormed);
        }
        if kernel.features == KernelFeatures::HeightLocked && kernel.lock_height > height {
            return Err(BlockError::KernelLockHeight(kernel.lock_height));
        }
    }
    Ok(())
}

/// `Σ(outputs) − Σ(inputs) ∓ overage·H == Σ(excess) + offset·G`. Positive
/// overage (a transaction's fee) joins the output side, negative overage (a
/// block's minted reward) the input side.
pub fn verify_kernel_sums(
    body: &TransactionBody,
    overage: i64,
    offset: &BlindingBytes,
) -> Result<(), BlockError> {
    let mut positive: Vec<Commitment> =
        body.outputs.iter().map(|output| output.commit).collect();
    let mut negative: Vec<Commitment> = body.inputs.iter().map(|input| input.commit).collect();
    if overage > 0 {
        positive.push(commit_value(overage as u64)?);
    } else if overage < 0 {
        negative.push(commit_value(overage.unsigned_abs())?);
    }
    let utxo_sum = sum_commits(&positive, &negative)?;

    let mut kernel_commits: Vec<Commitment> =
        body.kernels.iter().map(|kernel| kernel.excess).collect();
    if !offset.is_zero() {
        kernel_commits.push(commit(0, offset)?);
    }
    let kernel_sum = sum_commits(&kernel_commits, &[])?;

    if utxo_sum != kernel_sum {
        return Err(BlockError::UnbalancedSums);
    }
    Ok(())
}

/// Batch-verifies all range proofs, fanned out across rayon workers.
pub fn verify_range_proofs(outputs: &[TxOutput]) -> Result<(), BlockError> {
    let failed = outputs
        .par_chunks(RANGE_PROOF_CHUNK)
        .enumerate()
        .find_map_any(|(chunk_idx, chunk)| {
            match mwd_crypto::verify_range_proofs(chunk) {
                Ok(()) => None,
                Err(CryptoError::InvalidRangeProof { index }) => {
                    Some(chunk_idx * RANGE_PROOF_CHUNK + index)
                }
                Err(_) => Some(chunk_idx * RANGE_PROOF_CHUNK),
            }
        });
    match failed {
        Some(index) => Err(BlockError::InvalidRangeProof { index }),
        None => Ok(()),
    }
}

/// Coinbase outputs and kernels must balance against exactly the block
/// reward plus fees: `Σ(coinbase outputs) − reward·H == Σ(coinbase excess)`.
fn verify_coinbase(block: &Block) -> Result<(), BlockError> {
    let coinbase_kernels: Vec<_> = block
        .body
        .kernels
        .iter()
        .filter(|kernel| kernel.is_coinbase())
        .collect();
    if coinbase_kernels.len() != 1 {
        return Err(BlockError::InvalidCoinbase);
    }
    let coinbase_commits: Vec<Commitment> = block
        .body
        .outputs
        .iter()
        .filter(|output| output.is_coinbase())
        .map(|output| output.commit)
        .collect();
    if coinbase_commits.is_empty() {
        return Err(BlockError::InvalidCoinbase);
    }
    let reward = mwd_consensus::constants::block_reward(block.body.fee());
    let over_commit = commit_value(reward)?;
    let out_sum = sum_commits(&coinbase_commits, &[over_commit])?;
    let kernel_sum = sum_commits(
        &coinbase_kernels
            .iter()
            .map(|kernel| kernel.excess)
            .collect::<Vec<_>>(),
        &[],
    )?;
    if out_sum != kernel_sum {
        return Err(BlockError::InvalidCoinbase);
    }
    Ok(())
}

/// Full stateless validation of a block against its parent header.
pub fn validate_block(
    block: &Block,
    parent: &BlockHeader,
    difficulty_floor: u64,
    flags: &ValidationFlags,
) -> Result<(), BlockError> {
    validate_header(&block.header, parent, difficulty_floor, flags)?;
    validate_body(&block.body, block.height())?;
    verify_coinbase(block)?;
    // A block mints the reward; fees move between outputs internally.
    verify_kernel_sums(&block.body, -(REWARD as i64), &block.offset)?;
    if flags.check_signatures {
        batch_verify_kernels(&block.body.kernels)?;
    }
    if flags.check_rangeproofs {
        verify_range_proofs(&block.body.outputs)?;
    }
    Ok(())
}

/// Full stateless validation of a mempool transaction. Coinbase artifacts
/// are not allowed outside blocks.
pub fn validate_transaction(tx: &Transaction, flags: &ValidationFlags) -> Result<(), BlockError> {
    if tx
        .body
        .outputs
        .iter()
        .any(|output| output.features == OutputFeatures::Coinbase)
        || tx.body.kernels.iter().any(|kernel| kernel.is_coinbase())
    {
        return Err(BlockError::InvalidCoinbase);
    }
    // Lock heights are a stateful check for transactions; pass the max so
    // the pure body check never trips here.
    validate_body(&tx.body, u64::MAX)?;
    verify_kernel_sums(&tx.body, tx.fee() as i64, &tx.offset)?;
    if flags.check_signatures {
        batch_verify_kernels(&tx.body.kernels)?;
    }
    if flags.check_rangeproofs {
        verify_range_proofs(&tx.body.outputs)?;
    }
    Ok(())
}
