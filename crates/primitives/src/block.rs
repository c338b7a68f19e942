use mwd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::header::BlockHeader;
use crate::short_id::ShortId;
use crate::transaction::{BlindingBytes, TransactionBody, TxKernel, TxOutput};

/// A full block: header, the block's own offset blinding factor, and the
/// aggregated transaction body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub offset: BlindingBytes,
    pub body: TransactionBody,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn total_difficulty(&self) -> u64 {
        self.header.total_difficulty
    }

    pub fn write(&self, encoder: &mut Encoder) {
        self.header.write(encoder);
        encoder.write_bytes(&self.offset.0);
        self.body.write(encoder);
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::read(decoder)?;
        let offset = BlindingBytes(decoder.read_fixed::<32>()?);
        let body = TransactionBody::read(decoder)?;
        Ok(Self {
            header,
            offset,
            body,
        })
    }

    /// Compacts the block: coinbase outputs and kernels in full, everything
    /// else referred to by kernel short-id.
    pub fn to_compact(&self, nonce: u64) -> CompactBlock {
        let block_hash = self.hash();
        let out_full: Vec<TxOutput> = self
            .body
            .outputs
            .iter()
            .filter(|output| output.is_coinbase())
            .cloned()
            .collect();
        let kern_full: Vec<TxKernel> = self
            .body
            .kernels
            .iter()
            .filter(|kernel| kernel.is_coinbase())
            .copied()
            .collect();
        let mut kern_ids: Vec<ShortId> = self
            .body
            .kernels
            .iter()
            .filter(|kernel| !kernel.is_coinbase())
            .map(|kernel| ShortId::from_kernel_hash(&kernel.hash(), &block_hash, nonce))
            .collect();
        kern_ids.sort();
        CompactBlock {
            header: self.header.clone(),
            nonce,
            out_full,
            kern_full,
            kern_ids,
        }
    }
}

/// A block where non-coinbase transactions are referred to by short ids of
/// their kernels, to be reconstructed from the receiver's mempool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompactBlock {
    pub header: BlockHeader,
    pub nonce: u64,
    pub out_full: Vec<TxOutput>,
    pub kern_full: Vec<TxKernel>,
    pub kern_ids: Vec<ShortId>,
}

impl CompactBlock {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn write(&self, encoder: &mut Encoder) {
        self.header.write(encoder);
        encoder.write_u64(self.nonce);
        encoder.write_u64(self.out_full.len() as u64);
        encoder.write_u64(self.kern_full.len() as u64);
        encoder.write_u64(self.kern_ids.len() as u64);
        for output in &self.out_full {
            output.write(encoder);
        }
        for kernel in &self.kern_full {
            kernel.write(encoder);
        }
        for id in &self.kern_ids {
            encoder.write_bytes(&id.0);
        }
    }

    pub fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::read(decoder)?;
        let nonce = decoder.read_u64()?;
        let out_count = decoder.read_count(1_024)?;
        let kern_count = decoder.read_count(1_024)?;
        let id_count = decoder.read_count(16_384)?;
        let mut out_full = Vec::with_capacity(out_count);
        for _ in 0..out_count {
            out_full.push(TxOutput::read(decoder)?);
        }
        let mut kern_full = Vec::with_capacity(kern_count);
        for _ in 0..kern_count {
            kern_full.push(TxKernel::read(decoder)?);
        }
        let mut kern_ids = Vec::with_capacity(id_count);
        for _ in 0..id_count {
            kern_ids.push(ShortId(decoder.read_fixed::<6>()?));
        }
        Ok(Self {
            header,
            nonce,
            out_full,
            kern_full,
            kern_ids,
        })
    }
}
