//! Commitment and blinding-factor sums.

use mwd_primitives::{BlindingBytes, Commitment};
use secp::key::SecretKey;
use secp::pedersen;
use secp::Secp256k1;

use crate::{secp_ctx, CryptoError};

pub(crate) fn to_secp_commit(commit: &Commitment) -> pedersen::Commitment {
    pedersen::Commitment::from_vec(commit.0.to_vec())
}

fn from_secp_commit(commit: &pedersen::Commitment) -> Commitment {
    Commitment(commit.0)
}

pub(crate) fn to_secret_key(
    secp: &Secp256k1,
    blind: &BlindingBytes,
) -> Result<SecretKey, CryptoError> {
    SecretKey::from_slice(secp, &blind.0).map_err(CryptoError::from)
}

/// `value·H + blind·G`.
pub fn commit(value: u64, blind: &BlindingBytes) -> Result<Commitment, CryptoError> {
    let secp = secp_ctx();
    let key = to_secret_key(&secp, blind)?;
    let commit = secp.commit(value, key)?;
    Ok(from_secp_commit(&commit))
}

/// `value·H` with a zero blinding factor.
pub fn commit_value(value: u64) -> Result<Commitment, CryptoError> {
    let secp = secp_ctx();
    let commit = secp.commit_value(value)?;
    Ok(from_secp_commit(&commit))
}

/// Homomorphic sum `Σ positive − Σ negative`.
pub fn sum_commits(
    positive: &[Commitment],
    negative: &[Commitment],
) -> Result<Commitment, CryptoError> {
    let secp = secp_ctx();
    let positive = positive.iter().map(to_secp_commit).collect();
    let negative = negative.iter().map(to_secp_commit).collect();
    let sum = secp.commit_sum(positive, negative)?;
    Ok(from_secp_commit(&sum))
}

/// Scalar sum of blinding factors, `Σ positive − Σ negative` mod the curve
/// order. Zero factors carry no weight and are skipped; an empty sum is the
/// zero factor.
pub fn blind_sum(
    positive: &[BlindingBytes],
    negative: &[BlindingBytes],
) -> Result<BlindingBytes, CryptoError> {
    let secp = secp_ctx();
    let mut pos_keys = Vec::with_capacity(positive.len());
    for blind in positive.iter().filter(|blind| !blind.is_zero()) {
        pos_keys.push(to_secret_key(&secp, blind)?);
    }
    let mut neg_keys = Vec::with_capacity(negative.len());
    for blind in negative.iter().filter(|blind| !blind.is_zero()) {
        neg_keys.push(to_secret_key(&secp, blind)?);
    }
    if pos_keys.is_empty() && neg_keys.is_empty() {
        return Ok(BlindingBytes::zero());
    }
    match secp.blind_sum(pos_keys, neg_keys) {
        Ok(sum) => Ok(BlindingBytes(sum.0)),
        // A sum landing exactly on zero is not expressible as a secret key
        // but is a legitimate blinding value.
        Err(secp::Error::InvalidSecretKey) => Ok(BlindingBytes::zero()),
        Err(err) => Err(CryptoError::Secp(err)),
    }
}
