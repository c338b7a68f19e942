//! The aggregate UTXO view: output, range-proof, and kernel MMRs plus the
//! unspent-output index and spent bitmap.

use std::collections::{HashMap, HashSet};

use mwd_consensus::constants::REWARD;
use mwd_consensus::Hash256;
use mwd_crypto::{commit, commit_value, sum_commits};
use mwd_primitives::{
    BlindingBytes, Block, BlockHeader, Commitment, DecodeError, Decoder, Encoder, OutputFeatures,
    ProtocolVersion, TxKernel, TxOutput,
};

use crate::mmr::Mmr;
use crate::validation::BlockError;
use crate::ChainError;

/// Where an unspent output lives: its output-MMR node position and the
/// height of the block that created it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputEntry {
    pub output: TxOutput,
    pub pos: u64,
    pub leaf_idx: u64,
    pub height: u64,
}

impl OutputEntry {
    fn write(&self, encoder: &mut Encoder) {
        self.output.write(encoder);
        encoder.write_u64(self.pos);
        encoder.write_u64(self.leaf_idx);
        encoder.write_u64(self.height);
    }

    fn read(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let output = TxOutput::read(decoder)?;
        let pos = decoder.read_u64()?;
        let leaf_idx = decoder.read_u64()?;
        let height = decoder.read_u64()?;
        Ok(Self {
            output,
            pos,
            leaf_idx,
            height,
        })
    }
}

/// What `apply_block` changed, enough to undo it during a reorg.
#[derive(Clone, Debug, Default)]
pub struct BlockUndo {
    pub spent: Vec<OutputEntry>,
    pub added: Vec<Commitment>,
}

impl BlockUndo {
    pub fn serialized(&self) -> Vec<u8> {
        let mut encoder = Encoder::new(ProtocolVersion::V2);
        encoder.write_u64(self.spent.len() as u64);
        for entry in &self.spent {
            entry.write(&mut encoder);
        }
        encoder.write_u64(self.added.len() as u64);
        for commit in &self.added {
            encoder.write_bytes(commit.as_bytes());
        }
        encoder.into_inner()
    }

    pub fn read(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes, ProtocolVersion::V2);
        let spent_count = decoder.read_count(1 << 20)?;
        let mut spent = Vec::with_capacity(spent_count);
        for _ in 0..spent_count {
            spent.push(OutputEntry::read(&mut decoder)?);
        }
        let added_count = decoder.read_count(1 << 20)?;
        let mut added = Vec::with_capacity(added_count);
        for _ in 0..added_count {
            added.push(Commitment(decoder.read_fixed::<33>()?));
        }
        decoder.expect_empty()?;
        Ok(Self { spent, added })
    }
}

#[derive(Clone, Default)]
pub struct TxHashSet {
    output_mmr: Mmr,
    rproof_mmr: Mmr,
    kernel_mmr: Mmr,
    /// Unspent outputs by commitment.
    utxo: HashMap<Commitment, OutputEntry>,
    /// Node positions of spent output leaves; disjoint from `utxo` by
    /// construction.
    spent: HashSet<u64>,
    /// Node position of every output leaf in append order.
    output_leaves: Vec<u64>,
    /// Full kernel history in append order.
    kernels: Vec<TxKernel>,
}

impl TxHashSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roots(&self) -> (Hash256, Hash256, Hash256) {
        (
            self.output_mmr.root(),
            self.rproof_mmr.root(),
            self.kernel_mmr.root(),
        )
    }

    pub fn output_mmr_size(&self) -> u64 {
        self.output_mmr.size()
    }

    pub fn kernel_mmr_size(&self) -> u64 {
        self.kernel_mmr.size()
    }

    pub fn unspent(&self, commit: &Commitment) -> Option<&OutputEntry> {
        self.utxo.get(commit)
    }

    pub fn unspent_count(&self) -> usize {
        self.utxo.len()
    }

    pub fn is_spent_pos(&self, pos: u64) -> bool {
        self.spent.contains(&pos)
    }

    /// Applies a block body that already passed stateless validation.
    /// Inputs must reference unspent outputs; duplicate new commitments are
    /// rejected. On error the set is untouched.
    pub fn apply_block(&mut self, block: &Block) -> Result<BlockUndo, ChainError> {
        // Check before mutate so failure leaves no partial state.
        for input in &block.body.inputs {
            match self.utxo.get(&input.commit) {
                Some(entry) if entry.output.features == input.features => {}
                Some(_) => {
                    return Err(BlockError::WrongInputFeatures(input.commit).into());
                }
                None => return Err(BlockError::MissingInput(input.commit).into()),
            }
        }
        for output in &block.body.outputs {
            if self.utxo.contains_key(&output.commit) {
                return Err(BlockError::DuplicateCommitment(output.commit).into());
            }
        }

        let mut undo = BlockUndo::default();
        for input in &block.body.inputs {
            let entry = self
                .utxo
                .remove(&input.commit)
                .expect("input checked above");
            self.spent.insert(entry.pos);
            undo.spent.push(entry);
        }
        for output in &block.body.outputs {
            let pos = self.output_mmr.push_leaf(&output.leaf_bytes());
            self.rproof_mmr.push_leaf(output.proof.as_bytes());
            let leaf_idx = self.output_leaves.len() as u64;
            self.output_leaves.push(pos);
            self.utxo.insert(
                output.commit,
                OutputEntry {
                    output: output.clone(),
                    pos,
                    leaf_idx,
                    height: block.height(),
                },
            );
            undo.added.push(output.commit);
        }
        for kernel in &block.body.kernels {
            self.kernel_mmr.push_leaf(&kernel.leaf_bytes());
            self.kernels.push(*kernel);
        }
        Ok(undo)
    }

    /// Reverts the most recently applied block. `parent` supplies the MMR
    /// sizes to truncate back to.
    pub fn rewind_block(&mut self, parent: &BlockHeader, undo: &BlockUndo) {
        self.output_mmr.truncate(parent.output_mmr_size);
        self.rproof_mmr.truncate(parent.output_mmr_size);
        self.kernel_mmr.truncate(parent.kernel_mmr_size);
        while let Some(pos) = self.output_leaves.last() {
            if *pos < parent.output_mmr_size {
                break;
            }
            self.output_leaves.pop();
        }
        while self.kernels.len() as u64 > leaf_count_for(&self.kernel_mmr) {
            self.kernels.pop();
        }
        for commit in &undo.added {
            self.utxo.remove(commit);
        }
        for entry in &undo.spent {
            self.spent.remove(&entry.pos);
            self.utxo.insert(entry.output.commit, entry.clone());
        }
    }

    /// Checks the MMR roots and sizes against a header's commitments.
    pub fn matches_header(&self, header: &BlockHeader) -> Result<(), BlockError> {
        let (output_root, rproof_root, kernel_root) = self.roots();
        if self.output_mmr.size() != header.output_mmr_size
            || self.kernel_mmr.size() != header.kernel_mmr_size
        {
            return Err(BlockError::MmrSizeMismatch);
        }
        if output_root != header.output_root
            || rproof_root != header.range_proof_root
            || kernel_root != header.kernel_root
        {
            return Err(BlockError::RootMismatch);
        }
        Ok(())
    }

    /// Verifies the global sum invariant at `height` against the
    /// accumulated kernel offset:
    /// `Σ(unspent) − supply·H == Σ(kernel excess) + total_offset·G`.
    pub fn validate_kernel_sums(
        &self,
        height: u64,
        total_offset: &BlindingBytes,
    ) -> Result<(), ChainError> {
        let supply = height.saturating_mul(REWARD);
        let utxo_commits: Vec<Commitment> =
            self.utxo.values().map(|entry| entry.output.commit).collect();
        let mut negative = Vec::new();
        if supply > 0 {
            negative.push(commit_value(supply)?);
        }
        let utxo_sum = sum_commits(&utxo_commits, &negative)?;

        let mut kernel_commits: Vec<Commitment> =
            self.kernels.iter().map(|kernel| kernel.excess).collect();
        if !total_offset.is_zero() {
            kernel_commits.push(commit(0, total_offset)?);
        }
        let kernel_sum = sum_commits(&kernel_commits, &[])?;

        if utxo_sum != kernel_sum {
            return Err(BlockError::UnbalancedSums.into());
        }
        Ok(())
    }

    pub fn kernels(&self) -> &[TxKernel] {
        &self.kernels
    }

    /// Serializes the set for txhashset transfer: output leaf hashes (all),
    /// unspent outputs in full, and the kernel history.
    pub fn snapshot_bytes(&self, header_hash: &Hash256) -> Vec<u8> {
        let mut encoder = Encoder::new(ProtocolVersion::V2);
        encoder.write_bytes(header_hash);

        encoder.write_u64(self.output_leaves.len() as u64);
        for pos in &self.output_leaves {
            encoder.write_bytes(self.output_mmr.get(*pos).expect("leaf in mmr"));
            encoder.write_bytes(self.rproof_mmr.get(*pos).expect("leaf in rproof mmr"));
        }

        let mut unspent: Vec<&OutputEntry> = self.utxo.values().collect();
        unspent.sort_by_key(|entry| entry.leaf_idx);
        encoder.write_u64(unspent.len() as u64);
        for entry in unspent {
            entry.write(&mut encoder);
        }

        encoder.write_u64(self.kernels.len() as u64);
        for kernel in &self.kernels {
            kernel.write(&mut encoder);
        }
        encoder.into_inner()
    }

    /// Rebuilds a set from snapshot bytes, without validating it against any
    /// header; callers must follow with `matches_header` and
    /// `validate_kernel_sums`.
    pub fn from_snapshot_bytes(bytes: &[u8]) -> Result<(Hash256, Self), ChainError> {
        let mut decoder = Decoder::new(bytes, ProtocolVersion::V2);
        let header_hash: Hash256 = decoder.read_fixed::<32>()?;

        let leaf_count = decoder.read_count(1 << 28)?;
        let mut output_leaf_hashes = Vec::with_capacity(leaf_count);
        let mut rproof_leaf_hashes = Vec::with_capacity(leaf_count);
        for _ in 0..leaf_count {
            output_leaf_hashes.push(decoder.read_fixed::<32>()?);
            rproof_leaf_hashes.push(decoder.read_fixed::<32>()?);
        }
        let (output_mmr, output_positions) = Mmr::from_leaf_hashes(&output_leaf_hashes);
        let (rproof_mmr, _) = Mmr::from_leaf_hashes(&rproof_leaf_hashes);

        let unspent_count = decoder.read_count(leaf_count.max(1))?;
        let mut utxo = HashMap::with_capacity(unspent_count);
        for _ in 0..unspent_count {
            let entry = OutputEntry::read(&mut decoder)?;
            let leaf_idx = entry.leaf_idx as usize;
            if leaf_idx >= leaf_count || output_positions[leaf_idx] != entry.pos {
                return Err(BlockError::SnapshotInconsistent("output position").into());
            }
            // The full output must hash to the leaf recorded in the MMR,
            // otherwise the unspent set and the roots diverge.
            let leaf = Mmr::leaf_hash_at(entry.pos, &entry.output.leaf_bytes());
            if leaf != output_leaf_hashes[leaf_idx] {
                return Err(BlockError::SnapshotInconsistent("output leaf hash").into());
            }
            let rleaf = Mmr::leaf_hash_at(entry.pos, entry.output.proof.as_bytes());
            if rleaf != rproof_leaf_hashes[leaf_idx] {
                return Err(BlockError::SnapshotInconsistent("range proof leaf hash").into());
            }
            if utxo.insert(entry.output.commit, entry).is_some() {
                return Err(BlockError::SnapshotInconsistent("duplicate commitment").into());
            }
        }

        let kernel_count = decoder.read_count(1 << 28)?;
        let mut kernel_mmr = Mmr::new();
        let mut kernels = Vec::with_capacity(kernel_count);
        for _ in 0..kernel_count {
            let kernel = TxKernel::read(&mut decoder)?;
            kernel_mmr.push_leaf(&kernel.leaf_bytes());
            kernels.push(kernel);
        }
        decoder.expect_empty()?;

        let unspent_positions: HashSet<u64> = utxo.values().map(|entry| entry.pos).collect();
        let spent: HashSet<u64> = output_positions
            .iter()
            .copied()
            .filter(|pos| !unspent_positions.contains(pos))
            .collect();

        Ok((
            header_hash,
            Self {
                output_mmr,
                rproof_mmr,
                kernel_mmr,
                utxo,
                spent,
                output_leaves: output_positions,
                kernels,
            },
        ))
    }

    /// Every unspent output, for batch range-proof verification.
    pub fn unspent_outputs(&self) -> Vec<TxOutput> {
        self.utxo.values().map(|entry| entry.output.clone()).collect()
    }

    /// True when `commit` is a coinbase output too young to spend at
    /// `spend_height`.
    pub fn is_immature_coinbase(
        &self,
        commit: &Commitment,
        spend_height: u64,
        maturity: u64,
    ) -> bool {
        match self.utxo.get(commit) {
            Some(entry) if entry.output.features == OutputFeatures::Coinbase => {
                spend_height < entry.height.saturating_add(maturity)
            }
            _ => false,
        }
    }
}

fn leaf_count_for(mmr: &Mmr) -> u64 {
    // A mountain of n leaves has 2n - peaks nodes; sum over peaks.
    let size = mmr.size();
    let peaks = mmr.peaks().len() as u64;
    (size + peaks) / 2
}
