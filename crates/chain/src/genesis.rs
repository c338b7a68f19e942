//! Per-network genesis blocks. Bodies are empty; the chains start minting
//! at height one.

use mwd_consensus::constants::{EDGEBITS, MIN_DIFFICULTY};
use mwd_consensus::params::Network;
use mwd_consensus::ZERO_HASH;
use mwd_primitives::{
    BlindingBytes, Block, BlockHeader, ProofOfWork, TransactionBody,
};

fn genesis_header(timestamp: i64, nonce: u64) -> BlockHeader {
    BlockHeader {
        version: 1,
        height: 0,
        timestamp,
        prev_hash: ZERO_HASH,
        prev_root: ZERO_HASH,
        output_root: ZERO_HASH,
        range_proof_root: ZERO_HASH,
        kernel_root: ZERO_HASH,
        total_kernel_offset: [0u8; 32],
        output_mmr_size: 0,
        kernel_mmr_size: 0,
        total_difficulty: MIN_DIFFICULTY,
        secondary_scaling: 1,
        nonce,
        pow: ProofOfWork::zero(EDGEBITS),
    }
}

pub fn genesis_block(network: Network) -> Block {
    let header = match network {
        // 2020-07-01T00:00:00Z
        Network::Mainnet => genesis_header(1_593_561_600, 41),
        // 2020-06-01T00:00:00Z
        Network::Floonet => genesis_header(1_590_969_600, 23),
        // Fixed small timestamp so test chains are reproducible.
        Network::Testnet => genesis_header(1_500_000_000, 7),
    };
    Block {
        header,
        offset: BlindingBytes::zero(),
        body: TransactionBody::default(),
    }
}
