//! Bulletproof range proofs: each output's proof shows its hidden value
//! lies in [0, 2^64).

use mwd_primitives::transaction::MAX_RANGE_PROOF_SIZE;
use mwd_primitives::{BlindingBytes, Commitment, RangeProofBytes, TxOutput};
use secp::pedersen::RangeProof;

use crate::commit::{to_secp_commit, to_secret_key};
use crate::{secp_ctx, CryptoError};

fn to_range_proof(proof: &RangeProofBytes) -> Result<RangeProof, CryptoError> {
    let bytes = proof.as_bytes();
    if bytes.len() > MAX_RANGE_PROOF_SIZE {
        return Err(CryptoError::InvalidRangeProof { index: 0 });
    }
    let mut out = [0u8; secp::constants::MAX_PROOF_SIZE];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(RangeProof {
        proof: out,
        plen: bytes.len(),
    })
}

/// Verifies a single output's range proof.
pub fn verify_range_proof(commit: &Commitment, proof: &RangeProofBytes) -> Result<(), CryptoError> {
    let secp = secp_ctx();
    let proof = to_range_proof(proof)?;
    secp.verify_bullet_proof(to_secp_commit(commit), proof, None)
        .map_err(|_| CryptoError::InvalidRangeProof { index: 0 })?;
    Ok(())
}

/// Verifies every output's range proof using the library's multi-proof
/// path, falling back item-by-item on failure so the error names the
/// culprit. Outputs must be checked before they ever enter the UTXO set.
pub fn verify_range_proofs(outputs: &[TxOutput]) -> Result<(), CryptoError> {
    if outputs.is_empty() {
        return Ok(());
    }
    if outputs.len() == 1 {
        return verify_range_proof(&outputs[0].commit, &outputs[0].proof)
            .map_err(|_| CryptoError::InvalidRangeProof { index: 0 });
    }
    let batch_ok = {
        let secp = secp_ctx();
        let mut commits = Vec::with_capacity(outputs.len());
        let mut proofs = Vec::with_capacity(outputs.len());
        for output in outputs {
            commits.push(to_secp_commit(&output.commit));
            proofs.push(to_range_proof(&output.proof)?);
        }
        secp.verify_bullet_proof_multi(commits, proofs, None).is_ok()
    };
    if batch_ok {
        return Ok(());
    }
    for (index, output) in outputs.iter().enumerate() {
        if verify_range_proof(&output.commit, &output.proof).is_err() {
            return Err(CryptoError::InvalidRangeProof { index });
        }
    }
    Err(CryptoError::InvalidRangeProof { index: 0 })
}

/// Builds a range proof for `value` under `blind`. Used by test fixtures.
pub fn create_range_proof(
    value: u64,
    blind: &BlindingBytes,
) -> Result<RangeProofBytes, CryptoError> {
    let secp = secp_ctx();
    let key = to_secret_key(&secp, blind)?;
    let rewind_nonce = to_secret_key(&secp, blind)?;
    let private_nonce = to_secret_key(&secp, blind)?;
    let proof = secp.bullet_proof(value, key, rewind_nonce, private_nonce, None, None);
    Ok(RangeProofBytes(proof.proof[..proof.plen].to_vec()))
}
