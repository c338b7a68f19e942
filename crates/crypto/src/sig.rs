//! Kernel excess signatures: Schnorr over the excess commitment treated as
//! an x-only public key.

use mwd_consensus::Hash256;
use mwd_primitives::{BlindingBytes, SignatureBytes, TxKernel};
use secp::key::PublicKey;
use secp::{aggsig, Message, Signature};

use crate::commit::{to_secp_commit, to_secret_key};
use crate::{secp_ctx, CryptoError};

fn to_signature(sig: &SignatureBytes) -> Result<Signature, CryptoError> {
    Signature::from_raw_data(&sig.0).map_err(CryptoError::from)
}

/// Verifies one kernel's excess signature against its signature message.
pub fn verify_kernel_sig(kernel: &TxKernel) -> Result<(), CryptoError> {
    let secp = secp_ctx();
    let sig = to_signature(&kernel.excess_sig)?;
    let pubkey = to_secp_commit(&kernel.excess).to_pubkey(&secp)?;
    let msg = Message::from_slice(&kernel.msg_to_sign())?;
    let valid = aggsig::verify_single(
        &secp,
        &sig,
        &msg,
        None,
        &pubkey,
        Some(&pubkey),
        None,
        false,
    );
    if valid {
        Ok(())
    } else {
        Err(CryptoError::InvalidKernelSignature { index: 0 })
    }
}

/// Verifies every kernel signature, aggregated. On batch failure the kernels
/// are re-checked one by one so the error names the culprit.
pub fn batch_verify_kernels(kernels: &[TxKernel]) -> Result<(), CryptoError> {
    if kernels.is_empty() {
        return Ok(());
    }
    let batch_ok = {
        let secp = secp_ctx();
        let mut sigs = Vec::with_capacity(kernels.len());
        let mut msgs = Vec::with_capacity(kernels.len());
        let mut pubkeys: Vec<PublicKey> = Vec::with_capacity(kernels.len());
        for kernel in kernels {
            sigs.push(to_signature(&kernel.excess_sig)?);
            msgs.push(Message::from_slice(&kernel.msg_to_sign())?);
            pubkeys.push(to_secp_commit(&kernel.excess).to_pubkey(&secp)?);
        }
        aggsig::verify_batch(&secp, &sigs, &msgs, &pubkeys)
    };
    if batch_ok {
        return Ok(());
    }
    for (index, kernel) in kernels.iter().enumerate() {
        if verify_kernel_sig(kernel).is_err() {
            return Err(CryptoError::InvalidKernelSignature { index });
        }
    }
    // The aggregate rejected but every kernel passes individually; treat the
    // batch as invalid rather than accept it.
    Err(CryptoError::InvalidKernelSignature { index: 0 })
}

/// Signs `msg` with `blind`, producing a signature the excess commitment
/// `blind·G` verifies. Used by test fixtures and pool utilities.
pub fn sign_message(blind: &BlindingBytes, msg: &Hash256) -> Result<SignatureBytes, CryptoError> {
    let secp = secp_ctx();
    let skey = to_secret_key(&secp, blind)?;
    let pubkey = PublicKey::from_secret_key(&secp, &skey)?;
    let msg = Message::from_slice(msg)?;
    let sig = aggsig::sign_single(&secp, &msg, &skey, None, None, None, Some(&pubkey), None)?;
    let bytes: &[u8] = sig.as_ref();
    let mut out = [0u8; 64];
    out.copy_from_slice(bytes);
    Ok(SignatureBytes(out))
}
