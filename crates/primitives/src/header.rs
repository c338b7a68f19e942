use mwd_consensus::constants::PROOFSIZE;
use mwd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::hash;

/// A Cuckarooz cycle proof: `nonces` is a strictly ascending list of edge
/// indices, each below `2^edge_bits`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProofOfWork {
    pub edge_bits: u8,
    pub nonces: Vec<u64>,
}

impl ProofOfWork {
    pub fn zero(edge_bits: u8) -> Self {
        Self {
            edge_bits,
            nonces: vec![0u64; PROOFSIZE],
        }
    }

    /// Identity of the proof alone, the input to difficulty scaling.
    pub fn hash(&self) -> Hash256 {
        hash(&self.pack_nonces())
    }

    /// Packs the nonces into a little-endian bitstream of
    /// `len * edge_bits` bits.
    pub fn pack_nonces(&self) -> Vec<u8> {
        let bits = self.edge_bits as usize;
        let mut out = vec![0u8; (self.nonces.len() * bits + 7) / 8];
        let mut pos = 0usize;
        for nonce in &self.nonces {
            for bit in 0..bits {
                if nonce & (1u64 << bit) != 0 {
                    out[pos / 8] |= 1 << (pos % 8);
                }
                pos += 1;
            }
        }
        out
    }

    fn unpack_nonces(edge_bits: u8, count: usize, bytes: &[u8]) -> Vec<u64> {
        let bits = edge_bits as usize;
        let mut nonces = Vec::with_capacity(count);
        let mut pos = 0usize;
        for _ in 0..count {
            let mut nonce = 0u64;
            for bit in 0..bits {
                if bytes[pos / 8] & (1 << (pos % 8)) != 0 {
                    nonce |= 1u64 << bit;
                }
                pos += 1;
            }
            nonces.push(nonce);
        }
        nonces
    }

    pub fn write(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.edge_bits);
        encoder.write_bytes(&self.pack_nonces());
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let edge_bits = decoder.read_u8()?;
        if edge_bits == 0 || edge_bits > 63 {
            return Err(DecodeError::Corrupt("proof edge bits"));
        }
        let byte_len = (PROOFSIZE * edge_bits as usize + 7) / 8;
        let bytes = decoder.read_bytes(byte_len)?;
        let nonces = Self::unpack_nonces(edge_bits, PROOFSIZE, bytes);
        Ok(Self { edge_bits, nonces })
    }
}

/// Header identity covers the full serialization; the PoW seed covers
/// everything up to and including the nonce, excluding the proof itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: u16,
    pub height: u64,
    pub timestamp: i64,
    pub prev_hash: Hash256,
    pub prev_root: Hash256,
    pub output_root: Hash256,
    pub range_proof_root: Hash256,
    pub kernel_root: Hash256,
    /// Sum of every block offset up to and including this block.
    pub total_kernel_offset: [u8; 32],
    pub output_mmr_size: u64,
    pub kernel_mmr_size: u64,
    pub total_difficulty: u64,
    pub secondary_scaling: u32,
    pub nonce: u64,
    pub pow: ProofOfWork,
}

impl BlockHeader {
    fn write_pre_pow(&self, encoder: &mut Encoder) {
        encoder.write_u16(self.version);
        encoder.write_u64(self.height);
        encoder.write_i64(self.timestamp);
        encoder.write_bytes(&self.prev_hash);
        encoder.write_bytes(&self.prev_root);
        encoder.write_bytes(&self.output_root);
        encoder.write_bytes(&self.range_proof_root);
        encoder.write_bytes(&self.kernel_root);
        encoder.write_bytes(&self.total_kernel_offset);
        encoder.write_u64(self.output_mmr_size);
        encoder.write_u64(self.kernel_mmr_size);
        encoder.write_u64(self.total_difficulty);
        encoder.write_u32(self.secondary_scaling);
        encoder.write_u64(self.nonce);
    }

    pub fn write(&self, encoder: &mut Encoder) {
        self.write_pre_pow(encoder);
        self.pow.write(encoder);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_u16()?;
        let height = decoder.read_u64()?;
        let timestamp = decoder.read_i64()?;
        let prev_hash = decoder.read_fixed::<32>()?;
        let prev_root = decoder.read_fixed::<32>()?;
        let output_root = decoder.read_fixed::<32>()?;
        let range_proof_root = decoder.read_fixed::<32>()?;
        let kernel_root = decoder.read_fixed::<32>()?;
        let total_kernel_offset = decoder.read_fixed::<32>()?;
        let output_mmr_size = decoder.read_u64()?;
        let kernel_mmr_size = decoder.read_u64()?;
        let total_difficulty = decoder.read_u64()?;
        let secondary_scaling = decoder.read_u32()?;
        let nonce = decoder.read_u64()?;
        let pow = ProofOfWork::read(decoder)?;
        Ok(Self {
            version,
            height,
            timestamp,
            prev_hash,
            prev_root,
            output_root,
            range_proof_root,
            kernel_root,
            total_kernel_offset,
            output_mmr_size,
            kernel_mmr_size,
            total_difficulty,
            secondary_scaling,
            nonce,
            pow,
        })
    }

    /// Serialization fed to the PoW seed hash: the header minus the proof.
    pub fn pre_pow(&self) -> Vec<u8> {
        let mut encoder = Encoder::new(crate::encoding::ProtocolVersion::V2);
        self.write_pre_pow(&mut encoder);
        encoder.into_inner()
    }

    pub fn serialized(&self) -> Vec<u8> {
        let mut encoder = Encoder::new(crate::encoding::ProtocolVersion::V2);
        self.write(&mut encoder);
        encoder.into_inner()
    }

    pub fn hash(&self) -> Hash256 {
        hash(&self.serialized())
    }
}
