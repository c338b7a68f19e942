//! Store-backed persistence for headers, blocks, undo data, and tips.

use mwd_consensus::Hash256;
use mwd_primitives::{Block, BlockHeader, Decoder, Encoder, ProtocolVersion};
use mwd_storage::{Column, KeyValueStore, WriteBatch};

use crate::txhashset::BlockUndo;
use crate::ChainError;

const HEAD_KEY: &[u8] = b"head";
const HEADER_HEAD_KEY: &[u8] = b"header_head";

/// A chain tip: the identity, height, and accumulated work of a chain end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tip {
    pub hash: Hash256,
    pub height: u64,
    pub total_difficulty: u64,
}

impl Tip {
    pub fn from_header(header: &BlockHeader) -> Self {
        Self {
            hash: header.hash(),
            height: header.height,
            total_difficulty: header.total_difficulty,
        }
    }

    fn serialized(&self) -> Vec<u8> {
        let mut encoder = Encoder::new(ProtocolVersion::V2);
        encoder.write_bytes(&self.hash);
        encoder.write_u64(self.height);
        encoder.write_u64(self.total_difficulty);
        encoder.into_inner()
    }

    fn read(bytes: &[u8]) -> Result<Self, ChainError> {
        let mut decoder = Decoder::new(bytes, ProtocolVersion::V2);
        let hash = decoder.read_fixed::<32>()?;
        let height = decoder.read_u64()?;
        let total_difficulty = decoder.read_u64()?;
        Ok(Self {
            hash,
            height,
            total_difficulty,
        })
    }
}

pub struct ChainStore<S> {
    store: S,
}

impl<S: KeyValueStore> ChainStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ChainError> {
        match self.store.get(Column::Header, hash)? {
            Some(bytes) => {
                let mut decoder = Decoder::new(&bytes, ProtocolVersion::V2);
                Ok(Some(BlockHeader::read(&mut decoder)?))
            }
            None => Ok(None),
        }
    }

    pub fn put_header(&self, batch: &mut WriteBatch, header: &BlockHeader) {
        batch.put(Column::Header, header.hash(), header.serialized());
    }

    pub fn header_hash_at(&self, height: u64) -> Result<Option<Hash256>, ChainError> {
        match self.store.get(Column::HeaderHeight, &height.to_be_bytes())? {
            Some(bytes) => {
                let mut hash = [0u8; 32];
                if bytes.len() != 32 {
                    return Err(ChainError::MissingData("height index entry"));
                }
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn set_header_hash_at(&self, batch: &mut WriteBatch, height: u64, hash: &Hash256) {
        batch.put(Column::HeaderHeight, height.to_be_bytes(), hash.to_vec());
    }

    pub fn clear_header_hash_at(&self, batch: &mut WriteBatch, height: u64) {
        batch.delete(Column::HeaderHeight, height.to_be_bytes());
    }

    pub fn block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        match self.store.get(Column::Block, hash)? {
            Some(bytes) => {
                let mut decoder = Decoder::new(&bytes, ProtocolVersion::V2);
                Ok(Some(Block::read(&mut decoder)?))
            }
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.store.get(Column::Block, hash)?.is_some())
    }

    pub fn put_block(&self, batch: &mut WriteBatch, block: &Block) {
        let mut encoder = Encoder::new(ProtocolVersion::V2);
        block.write(&mut encoder);
        batch.put(Column::Block, block.hash(), encoder.into_inner());
    }

    pub fn undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, ChainError> {
        match self.store.get(Column::BlockUndo, hash)? {
            Some(bytes) => Ok(Some(BlockUndo::read(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_undo(&self, batch: &mut WriteBatch, hash: &Hash256, undo: &BlockUndo) {
        batch.put(Column::BlockUndo, *hash, undo.serialized());
    }

    pub fn head(&self) -> Result<Option<Tip>, ChainError> {
        match self.store.get(Column::Tip, HEAD_KEY)? {
            Some(bytes) => Ok(Some(Tip::read(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_head(&self, batch: &mut WriteBatch, tip: &Tip) {
        batch.put(Column::Tip, HEAD_KEY, tip.serialized());
    }

    pub fn header_head(&self) -> Result<Option<Tip>, ChainError> {
        match self.store.get(Column::Tip, HEADER_HEAD_KEY)? {
            Some(bytes) => Ok(Some(Tip::read(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set_header_head(&self, batch: &mut WriteBatch, tip: &Tip) {
        batch.put(Column::Tip, HEADER_HEAD_KEY, tip.serialized());
    }

    pub fn commit(&self, batch: WriteBatch) -> Result<(), ChainError> {
        self.store.write_batch(batch)?;
        Ok(())
    }
}
