use mwd_crypto::{
    batch_verify_kernels, blind_sum, commit, commit_value, create_range_proof, sign_message,
    sum_commits, verify_kernel_sig, verify_range_proof, verify_range_proofs, CryptoError,
};
use mwd_primitives::{
    BlindingBytes, Commitment, KernelFeatures, OutputFeatures, RangeProofBytes, SignatureBytes,
    TxKernel, TxOutput,
};

fn blind(i: u64) -> BlindingBytes {
    let mut bytes = [0u8; 32];
    bytes[24..32].copy_from_slice(&i.to_be_bytes());
    BlindingBytes(bytes)
}

fn signed_kernel(features: KernelFeatures, fee: u64, lock_height: u64, key: u64) -> TxKernel {
    let excess_blind = blind(key);
    let mut kernel = TxKernel {
        features,
        fee,
        lock_height,
        excess: commit(0, &excess_blind).expect("excess"),
        excess_sig: SignatureBytes([0u8; 64]),
    };
    kernel.excess_sig = sign_message(&excess_blind, &kernel.msg_to_sign()).expect("sign");
    kernel
}

#[test]
fn commitments_are_homomorphic() {
    // commit(a, r1) + commit(b, r2) == commit(a + b, r1 + r2)
    let left = sum_commits(
        &[
            commit(40, &blind(2)).expect("commit"),
            commit(2, &blind(3)).expect("commit"),
        ],
        &[],
    )
    .expect("sum");
    let combined_blind = blind_sum(&[blind(2), blind(3)], &[]).expect("blind sum");
    let right = commit(42, &combined_blind).expect("commit");
    assert_eq!(left, right);
}

#[test]
fn sum_to_zero_detects_imbalance() {
    // out - in - fee*H balances only when values actually balance.
    let input = commit(100, &blind(5)).expect("commit");
    let output = commit(93, &blind(6)).expect("commit");
    let fee = commit_value(7).expect("commit");
    let utxo_sum = sum_commits(&[output, fee], &[input]).expect("sum");

    let excess_blind = blind_sum(&[blind(6)], &[blind(5)]).expect("excess");
    let excess = commit(0, &excess_blind).expect("excess commit");
    assert_eq!(utxo_sum, excess);

    let bad_fee = commit_value(8).expect("commit");
    let bad_sum = sum_commits(&[output, bad_fee], &[input]).expect("sum");
    assert_ne!(bad_sum, excess);
}

#[test]
fn blind_sum_of_nothing_is_zero() {
    let zero = blind_sum(&[], &[]).expect("empty sum");
    assert!(zero.is_zero());
    let cancelled = blind_sum(&[blind(9)], &[blind(9)]).expect("cancelled sum");
    assert!(cancelled.is_zero());
}

#[test]
fn kernel_signature_verifies_and_rejects_wrong_message() {
    let kernel = signed_kernel(KernelFeatures::Plain, 10, 0, 11);
    assert!(verify_kernel_sig(&kernel).is_ok());

    // Same signature over a different fee must fail.
    let mut tampered = kernel;
    tampered.fee = 11;
    assert!(verify_kernel_sig(&tampered).is_err());
}

#[test]
fn lock_height_is_part_of_the_message() {
    let kernel = signed_kernel(KernelFeatures::HeightLocked, 5, 100, 12);
    assert!(verify_kernel_sig(&kernel).is_ok());
    let mut tampered = kernel;
    tampered.lock_height = 101;
    assert!(verify_kernel_sig(&tampered).is_err());
}

#[test]
fn batch_verification_names_the_culprit() {
    let mut kernels = vec![
        signed_kernel(KernelFeatures::Plain, 1, 0, 21),
        signed_kernel(KernelFeatures::Plain, 2, 0, 22),
        signed_kernel(KernelFeatures::Plain, 3, 0, 23),
    ];
    assert!(batch_verify_kernels(&kernels).is_ok());

    kernels[1].fee = 20;
    match batch_verify_kernels(&kernels) {
        Err(CryptoError::InvalidKernelSignature { index }) => assert_eq!(index, 1),
        other => panic!("expected signature failure, got {other:?}"),
    }
}

#[test]
fn range_proof_roundtrip() {
    let value = 5_000u64;
    let key = blind(31);
    let commitment = commit(value, &key).expect("commit");
    let proof = create_range_proof(value, &key).expect("prove");
    assert!(verify_range_proof(&commitment, &proof).is_ok());

    // A proof for one commitment must not verify for another.
    let other = commit(value + 1, &key).expect("commit");
    assert!(verify_range_proof(&other, &proof).is_err());
}

#[test]
fn batch_range_proofs_name_the_culprit() {
    let mut outputs: Vec<TxOutput> = (0..3)
        .map(|i| {
            let key = blind(40 + i);
            TxOutput {
                features: OutputFeatures::Plain,
                commit: commit(1_000 + i, &key).expect("commit"),
                proof: create_range_proof(1_000 + i, &key).expect("prove"),
            }
        })
        .collect();
    assert!(verify_range_proofs(&outputs).is_ok());

    // Swap one proof with a proof for a different commitment.
    outputs[2].proof = create_range_proof(9, &blind(50)).expect("prove");
    match verify_range_proofs(&outputs) {
        Err(CryptoError::InvalidRangeProof { index }) => assert_eq!(index, 2),
        other => panic!("expected range proof failure, got {other:?}"),
    }
}

#[test]
fn garbage_proof_is_rejected_not_fatal() {
    let commitment: Commitment = commit(5, &blind(60)).expect("commit");
    let proof = RangeProofBytes(vec![0u8; 100]);
    assert!(verify_range_proof(&commitment, &proof).is_err());
}
