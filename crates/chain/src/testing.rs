//! Fixtures for chain and node tests: deterministic blinding factors and a
//! block builder that tracks its own txhashset so header roots come out
//! right without mining.

use mwd_consensus::constants::{block_reward, EDGEBITS, MIN_DIFFICULTY};
use mwd_crypto::{blind_sum, commit, create_range_proof, sign_message};
use mwd_primitives::{
    BlindingBytes, Block, BlockHeader, KernelFeatures, OutputFeatures, ProofOfWork, Transaction,
    TransactionBody, TxInput, TxKernel, TxOutput,
};

use crate::txhashset::TxHashSet;

/// A small deterministic blinding factor; any `i >= 1` is a valid scalar.
pub fn blind(i: u64) -> BlindingBytes {
    let mut bytes = [0u8; 32];
    bytes[24..32].copy_from_slice(&i.to_be_bytes());
    BlindingBytes(bytes)
}

/// An output committing to `value` under `blind`, with a real range proof.
pub fn output(value: u64, blind: &BlindingBytes, features: OutputFeatures) -> TxOutput {
    TxOutput {
        features,
        commit: commit(value, blind).expect("commit"),
        proof: create_range_proof(value, blind).expect("range proof"),
    }
}

/// A kernel whose excess commits to zero under `excess_blind`, signed.
pub fn kernel(features: KernelFeatures, fee: u64, lock_height: u64, excess_blind: &BlindingBytes) -> TxKernel {
    let mut kernel = TxKernel {
        features,
        fee,
        lock_height,
        excess: commit(0, excess_blind).expect("excess commit"),
        excess_sig: mwd_primitives::SignatureBytes([0u8; 64]),
    };
    kernel.excess_sig = sign_message(excess_blind, &kernel.msg_to_sign()).expect("sign");
    kernel
}

/// Spendable value known to the test: its commitment parameters.
#[derive(Clone, Copy, Debug)]
pub struct Coin {
    pub value: u64,
    pub blind: BlindingBytes,
}

/// Builds a plain transaction spending `inputs` into `outputs` plus `fee`.
/// Input and output values must differ by exactly the fee.
pub fn transaction(inputs: &[Coin], outputs: &[Coin], fee: u64) -> Transaction {
    let in_total: u64 = inputs.iter().map(|coin| coin.value).sum();
    let out_total: u64 = outputs.iter().map(|coin| coin.value).sum();
    assert_eq!(in_total, out_total + fee, "transaction must balance");

    let tx_inputs: Vec<TxInput> = inputs
        .iter()
        .map(|coin| TxInput {
            features: OutputFeatures::Plain,
            commit: commit(coin.value, &coin.blind).expect("commit"),
        })
        .collect();
    let tx_outputs: Vec<TxOutput> = outputs
        .iter()
        .map(|coin| output(coin.value, &coin.blind, OutputFeatures::Plain))
        .collect();

    let out_blinds: Vec<BlindingBytes> = outputs.iter().map(|coin| coin.blind).collect();
    let in_blinds: Vec<BlindingBytes> = inputs.iter().map(|coin| coin.blind).collect();
    let excess_blind = blind_sum(&out_blinds, &in_blinds).expect("excess blind");

    let mut body = TransactionBody {
        inputs: tx_inputs,
        outputs: tx_outputs,
        kernels: vec![kernel(KernelFeatures::Plain, fee, 0, &excess_blind)],
    };
    body.sort();
    Transaction {
        offset: BlindingBytes::zero(),
        body,
    }
}

/// Grows a valid chain block by block, mirroring the txhashset the chain
/// under test will build, so headers carry correct roots and sizes. PoW
/// fields are zeroed; pair with `ValidationFlags::no_pow`.
pub struct TestChainBuilder {
    txhashset: TxHashSet,
    tip: BlockHeader,
    next_blind: u64,
}

impl TestChainBuilder {
    pub fn from_genesis(genesis: &Block) -> Self {
        let mut txhashset = TxHashSet::new();
        txhashset.apply_block(genesis).expect("apply genesis");
        Self {
            txhashset,
            tip: genesis.header.clone(),
            next_blind: 1_000,
        }
    }

    pub fn tip(&self) -> &BlockHeader {
        &self.tip
    }

    /// Distinct blinding ranges keep two builders from producing identical
    /// coinbases when growing competing forks.
    pub fn set_blind_offset(&mut self, offset: u64) {
        self.next_blind = offset;
    }

    fn fresh_blind(&mut self) -> BlindingBytes {
        self.next_blind += 1;
        blind(self.next_blind)
    }

    /// The next block on the builder's chain, containing `txs` and a
    /// coinbase. Returns the block and the coinbase coin for later spends.
    pub fn next_block(&mut self, txs: &[Transaction]) -> (Block, Coin) {
        let fees: u64 = txs.iter().map(|tx| tx.fee()).sum();
        let reward = block_reward(fees);
        let cb_blind = self.fresh_blind();
        let cb_output = output(reward, &cb_blind, OutputFeatures::Coinbase);
        let cb_kernel = kernel(KernelFeatures::Coinbase, 0, 0, &cb_blind);

        let mut parts: Vec<TransactionBody> = vec![TransactionBody {
            inputs: Vec::new(),
            outputs: vec![cb_output],
            kernels: vec![cb_kernel],
        }];
        let offsets: Vec<BlindingBytes> = txs.iter().map(|tx| tx.offset).collect();
        parts.extend(txs.iter().map(|tx| tx.body.clone()));
        let body = TransactionBody::aggregate(parts);
        let offset = blind_sum(&offsets, &[]).expect("offset sum");
        let total_kernel_offset = blind_sum(
            &[BlindingBytes(self.tip.total_kernel_offset), offset],
            &[],
        )
        .expect("total offset");

        let mut header = BlockHeader {
            version: 1,
            height: self.tip.height + 1,
            timestamp: self.tip.timestamp + 60,
            prev_hash: self.tip.hash(),
            prev_root: [0u8; 32],
            output_root: [0u8; 32],
            range_proof_root: [0u8; 32],
            kernel_root: [0u8; 32],
            total_kernel_offset: total_kernel_offset.0,
            output_mmr_size: 0,
            kernel_mmr_size: 0,
            total_difficulty: self.tip.total_difficulty + MIN_DIFFICULTY,
            secondary_scaling: 1,
            nonce: 0,
            pow: ProofOfWork::zero(EDGEBITS),
        };

        // Apply to a scratch copy to learn the roots this body produces.
        let mut scratch = self.txhashset.clone();
        let probe = Block {
            header: header.clone(),
            offset,
            body: body.clone(),
        };
        scratch.apply_block(&probe).expect("apply probe block");
        let (output_root, range_proof_root, kernel_root) = scratch.roots();
        header.output_root = output_root;
        header.range_proof_root = range_proof_root;
        header.kernel_root = kernel_root;
        header.output_mmr_size = scratch.output_mmr_size();
        header.kernel_mmr_size = scratch.kernel_mmr_size();

        let block = Block {
            header: header.clone(),
            offset,
            body,
        };
        self.txhashset.apply_block(&block).expect("apply block");
        self.tip = header;
        (block, Coin {
            value: reward,
            blind: cb_blind,
        })
    }
}
