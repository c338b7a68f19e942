use mwd_consensus::constants::{EDGEBITS, PROOFSIZE};
use mwd_primitives::{
    BlindingBytes, Block, BlockHeader, CompactBlock, Commitment, Decoder, Encoder,
    KernelFeatures, OutputFeatures, ProofOfWork, ProtocolVersion, RangeProofBytes, ShortId,
    SignatureBytes, Transaction, TransactionBody, TxInput, TxKernel, TxOutput,
};

fn sample_proof() -> ProofOfWork {
    ProofOfWork {
        edge_bits: EDGEBITS,
        nonces: (0..PROOFSIZE as u64).map(|i| i * 7 + 3).collect(),
    }
}

fn sample_header(height: u64) -> BlockHeader {
    BlockHeader {
        version: 1,
        height,
        timestamp: 1_500_000_000 + height as i64 * 60,
        prev_hash: [1u8; 32],
        prev_root: [2u8; 32],
        output_root: [3u8; 32],
        range_proof_root: [4u8; 32],
        kernel_root: [5u8; 32],
        total_kernel_offset: [6u8; 32],
        output_mmr_size: 10,
        kernel_mmr_size: 4,
        total_difficulty: 1_000 + height,
        secondary_scaling: 1,
        nonce: 99,
        pow: sample_proof(),
    }
}

fn sample_kernel(features: KernelFeatures) -> TxKernel {
    TxKernel {
        features,
        fee: if features == KernelFeatures::Coinbase { 0 } else { 7 },
        lock_height: if features == KernelFeatures::HeightLocked { 42 } else { 0 },
        excess: Commitment([8u8; 33]),
        excess_sig: SignatureBytes([9u8; 64]),
    }
}

fn sample_body() -> TransactionBody {
    let mut body = TransactionBody {
        inputs: vec![
            TxInput {
                features: OutputFeatures::Plain,
                commit: Commitment([10u8; 33]),
            },
            TxInput {
                features: OutputFeatures::Coinbase,
                commit: Commitment([11u8; 33]),
            },
        ],
        outputs: vec![TxOutput {
            features: OutputFeatures::Plain,
            commit: Commitment([12u8; 33]),
            proof: RangeProofBytes(vec![13u8; 600]),
        }],
        kernels: vec![
            sample_kernel(KernelFeatures::Plain),
            sample_kernel(KernelFeatures::HeightLocked),
        ],
    };
    body.sort();
    body
}

fn roundtrip_block(version: ProtocolVersion) {
    let block = Block {
        header: sample_header(5),
        offset: BlindingBytes([14u8; 32]),
        body: sample_body(),
    };
    let mut encoder = Encoder::new(version);
    block.write(&mut encoder);
    let bytes = encoder.into_inner();
    let mut decoder = Decoder::new(&bytes, version);
    let decoded = Block::read(&mut decoder).expect("decode block");
    assert!(decoder.is_empty());
    assert_eq!(decoded, block);
}

#[test]
fn block_roundtrip_both_protocol_versions() {
    roundtrip_block(ProtocolVersion::V1);
    roundtrip_block(ProtocolVersion::V2);
}

#[test]
fn kernel_v2_is_shorter_for_plain() {
    let kernel = sample_kernel(KernelFeatures::Plain);
    let mut v1 = Encoder::new(ProtocolVersion::V1);
    kernel.write(&mut v1);
    let mut v2 = Encoder::new(ProtocolVersion::V2);
    kernel.write(&mut v2);
    // V1 always carries fee and lock height; V2 drops the lock height for
    // plain kernels.
    assert_eq!(v1.len(), v2.len() + 8);
}

#[test]
fn coinbase_kernel_v2_drops_fee_and_lock() {
    let kernel = sample_kernel(KernelFeatures::Coinbase);
    let mut v2 = Encoder::new(ProtocolVersion::V2);
    kernel.write(&mut v2);
    let bytes = v2.into_inner();
    let mut decoder = Decoder::new(&bytes, ProtocolVersion::V2);
    let decoded = TxKernel::read(&mut decoder).expect("decode kernel");
    assert_eq!(decoded, kernel);
    // features byte + excess + signature only.
    assert_eq!(bytes.len(), 1 + 33 + 64);
}

#[test]
fn proof_nonce_packing_roundtrips() {
    let proof = sample_proof();
    let mut encoder = Encoder::new(ProtocolVersion::V2);
    proof.write(&mut encoder);
    let bytes = encoder.into_inner();
    assert_eq!(bytes.len(), 1 + (PROOFSIZE * EDGEBITS as usize + 7) / 8);
    let mut decoder = Decoder::new(&bytes, ProtocolVersion::V2);
    let decoded = ProofOfWork::read(&mut decoder).expect("decode proof");
    assert_eq!(decoded, proof);
}

#[test]
fn header_hash_covers_proof_but_seed_does_not() {
    let header = sample_header(9);
    let mut tweaked = header.clone();
    tweaked.pow.nonces[0] += 1;
    // Changing a proof nonce changes the identity but not the PoW seed.
    assert_ne!(header.hash(), tweaked.hash());
    assert_eq!(header.pre_pow(), tweaked.pre_pow());

    let mut renonced = header.clone();
    renonced.nonce += 1;
    assert_ne!(header.pre_pow(), renonced.pre_pow());
}

#[test]
fn header_roundtrip() {
    let header = sample_header(123);
    let bytes = header.serialized();
    let mut decoder = Decoder::new(&bytes, ProtocolVersion::V2);
    let decoded = BlockHeader::read(&mut decoder).expect("decode header");
    assert_eq!(decoded, header);
}

#[test]
fn transaction_roundtrip() {
    let tx = Transaction {
        offset: BlindingBytes([21u8; 32]),
        body: sample_body(),
    };
    let mut encoder = Encoder::new(ProtocolVersion::V2);
    tx.write(&mut encoder);
    let bytes = encoder.into_inner();
    let mut decoder = Decoder::new(&bytes, ProtocolVersion::V2);
    let decoded = Transaction::read(&mut decoder).expect("decode tx");
    assert_eq!(decoded, tx);
}

#[test]
fn compact_block_splits_coinbase_from_short_ids() {
    let mut body = sample_body();
    body.outputs.push(TxOutput {
        features: OutputFeatures::Coinbase,
        commit: Commitment([40u8; 33]),
        proof: RangeProofBytes(vec![41u8; 600]),
    });
    body.kernels.push(sample_kernel(KernelFeatures::Coinbase));
    body.sort();
    let block = Block {
        header: sample_header(7),
        offset: BlindingBytes::zero(),
        body,
    };
    let compact = block.to_compact(77);
    assert_eq!(compact.out_full.len(), 1);
    assert_eq!(compact.kern_full.len(), 1);
    assert_eq!(compact.kern_ids.len(), 2);

    let mut encoder = Encoder::new(ProtocolVersion::V2);
    compact.write(&mut encoder);
    let bytes = encoder.into_inner();
    let mut decoder = Decoder::new(&bytes, ProtocolVersion::V2);
    let decoded = CompactBlock::read(&mut decoder).expect("decode compact block");
    assert_eq!(decoded, compact);
}

#[test]
fn short_ids_are_keyed_per_block() {
    let kernel_hash = [5u8; 32];
    let a = ShortId::from_kernel_hash(&kernel_hash, &[1u8; 32], 1);
    let b = ShortId::from_kernel_hash(&kernel_hash, &[1u8; 32], 1);
    let other_nonce = ShortId::from_kernel_hash(&kernel_hash, &[1u8; 32], 2);
    let other_block = ShortId::from_kernel_hash(&kernel_hash, &[2u8; 32], 1);
    assert_eq!(a, b);
    assert_ne!(a, other_nonce);
    assert_ne!(a, other_block);
}

#[test]
fn decoder_rejects_trailing_and_truncated() {
    let mut encoder = Encoder::new(ProtocolVersion::V2);
    encoder.write_u64(7);
    let mut bytes = encoder.into_inner();
    bytes.push(0);
    let mut decoder = Decoder::new(&bytes, ProtocolVersion::V2);
    decoder.read_u64().expect("read");
    assert!(decoder.expect_empty().is_err());

    let mut decoder = Decoder::new(&bytes[..4], ProtocolVersion::V2);
    assert!(decoder.read_u64().is_err());
}
