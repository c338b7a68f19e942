//! Mempool and stempool: validated transactions waiting for a block,
//! indexed by kernel hash and by spent commitment.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use mwd_consensus::constants::MAX_BLOCK_WEIGHT;
use mwd_consensus::Hash256;
use mwd_primitives::{Block, Commitment, ShortId, Transaction};
use mwd_storage::KeyValueStore;
use tracing::debug;

use crate::state::ChainState;
use crate::validation::{validate_transaction, BlockError, ValidationFlags};

/// Which pool a transaction is destined for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolType {
    Mempool,
    Stempool,
}

#[derive(Clone, Debug)]
pub enum PoolError {
    AlreadyInPool,
    /// An input is already spent by another pooled transaction.
    ConflictingInput(Commitment),
    /// An input is not in the UTXO set and not produced by a pooled
    /// transaction.
    MissingInput(Commitment),
    ImmatureCoinbase(Commitment),
    /// The transaction has no kernels, so no identity.
    NoKernels,
    PoolFull,
    Invalid(BlockError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::AlreadyInPool => write!(f, "transaction already in pool"),
            PoolError::ConflictingInput(_) => write!(f, "input conflicts with pooled spend"),
            PoolError::MissingInput(_) => write!(f, "missing input"),
            PoolError::ImmatureCoinbase(_) => write!(f, "premature spend of coinbase"),
            PoolError::NoKernels => write!(f, "transaction has no kernels"),
            PoolError::PoolFull => write!(f, "pool full"),
            PoolError::Invalid(reason) => write!(f, "invalid transaction: {reason}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<BlockError> for PoolError {
    fn from(err: BlockError) -> Self {
        PoolError::Invalid(err)
    }
}

#[derive(Clone)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub fee: u64,
    pub weight: u64,
    pub kernel_hashes: Vec<Hash256>,
    pub input_commits: Vec<Commitment>,
    pub added: Instant,
}

#[derive(Default)]
struct Pool {
    /// Entries keyed by their first kernel hash.
    entries: HashMap<Hash256, PoolEntry>,
    /// Every kernel hash to its owning entry.
    kernel_index: HashMap<Hash256, Hash256>,
    /// Spent commitment to the spending entry.
    spent: HashMap<Commitment, Hash256>,
    /// Commitments produced by pooled transactions.
    produced: HashMap<Commitment, Hash256>,
    total_weight: u64,
}

impl Pool {
    fn insert(&mut self, id: Hash256, entry: PoolEntry) {
        for kernel_hash in &entry.kernel_hashes {
            self.kernel_index.insert(*kernel_hash, id);
        }
        for commit in &entry.input_commits {
            self.spent.insert(*commit, id);
        }
        for output in &entry.tx.body.outputs {
            self.produced.insert(output.commit, id);
        }
        self.total_weight = self.total_weight.saturating_add(entry.weight);
        self.entries.insert(id, entry);
    }

    fn remove(&mut self, id: &Hash256) -> Option<PoolEntry> {
        let entry = self.entries.remove(id)?;
        for kernel_hash in &entry.kernel_hashes {
            if self.kernel_index.get(kernel_hash) == Some(id) {
                self.kernel_index.remove(kernel_hash);
            }
        }
        for commit in &entry.input_commits {
            if self.spent.get(commit) == Some(id) {
                self.spent.remove(commit);
            }
        }
        for output in &entry.tx.body.outputs {
            if self.produced.get(&output.commit) == Some(id) {
                self.produced.remove(&output.commit);
            }
        }
        self.total_weight = self.total_weight.saturating_sub(entry.weight);
        Some(entry)
    }

    /// Entry id with the lowest fee-per-weight, oldest first on ties.
    fn eviction_candidate(&self) -> Option<Hash256> {
        self.entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                let left = (a.fee as u128) * (b.weight.max(1) as u128);
                let right = (b.fee as u128) * (a.weight.max(1) as u128);
                left.cmp(&right).then(a.added.cmp(&b.added))
            })
            .map(|(id, _)| *id)
    }
}

pub struct TransactionPool {
    inner: std::sync::RwLock<Pools>,
    max_weight: u64,
}

#[derive(Default)]
struct Pools {
    mempool: Pool,
    stempool: Pool,
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(MAX_BLOCK_WEIGHT * 4)
    }
}

impl TransactionPool {
    pub fn new(max_weight: u64) -> Self {
        Self {
            inner: std::sync::RwLock::new(Pools::default()),
            max_weight,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Pools> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Pools> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn size(&self, pool_type: PoolType) -> usize {
        let pools = self.read();
        match pool_type {
            PoolType::Mempool => pools.mempool.entries.len(),
            PoolType::Stempool => pools.stempool.entries.len(),
        }
    }

    pub fn total_fee(&self) -> u64 {
        self.read()
            .mempool
            .entries
            .values()
            .fold(0u64, |acc, entry| acc.saturating_add(entry.fee))
    }

    /// Validates and inserts a transaction. Stateless checks first, then
    /// input resolution against the chain UTXO set and the pools.
    pub fn add_tx<S: KeyValueStore>(
        &self,
        tx: Transaction,
        pool_type: PoolType,
        chain: &ChainState<S>,
        flags: &ValidationFlags,
    ) -> Result<(), PoolError> {
        validate_transaction(&tx, flags)?;
        let id = tx.first_kernel_hash().ok_or(PoolError::NoKernels)?;
        let kernel_hashes = tx.kernel_hashes();
        let input_commits: Vec<Commitment> =
            tx.body.inputs.iter().map(|input| input.commit).collect();

        // Chain state is consulted strictly before the pool lock is taken
        // (lock order: chain_state < mempool).
        let next_height = chain.head().height + 1;
        let chain_entries: Vec<Option<crate::txhashset::OutputEntry>> = input_commits
            .iter()
            .map(|commit| chain.utxo_entry(commit))
            .collect();

        let mut pools = self.write();
        if pools.mempool.kernel_index.contains_key(&id) {
            return Err(PoolError::AlreadyInPool);
        }
        if pool_type == PoolType::Stempool && pools.stempool.kernel_index.contains_key(&id) {
            return Err(PoolError::AlreadyInPool);
        }

        for commit in &input_commits {
            // Mempool spends win over stempool spends; a conflicting stem
            // entry is displaced rather than blocking the mempool.
            if pools.mempool.spent.contains_key(commit) {
                return Err(PoolError::ConflictingInput(*commit));
            }
            if let Some(conflict) = pools.stempool.spent.get(commit).copied() {
                match pool_type {
                    PoolType::Stempool => return Err(PoolError::ConflictingInput(*commit)),
                    PoolType::Mempool => {
                        pools.stempool.remove(&conflict);
                    }
                }
            }
        }

        for (commit, chain_entry) in input_commits.iter().zip(&chain_entries) {
            match chain_entry {
                Some(entry) => {
                    if entry.output.features == mwd_primitives::OutputFeatures::Coinbase
                        && next_height < entry.height.saturating_add(flags.coinbase_maturity)
                    {
                        return Err(PoolError::ImmatureCoinbase(*commit));
                    }
                }
                None => {
                    let in_pool = pools.mempool.produced.contains_key(commit)
                        || (pool_type == PoolType::Stempool
                            && pools.stempool.produced.contains_key(commit));
                    if !in_pool {
                        return Err(PoolError::MissingInput(*commit));
                    }
                }
            }
        }

        let entry = PoolEntry {
            fee: tx.fee(),
            weight: tx.body.weight(),
            kernel_hashes,
            input_commits,
            added: Instant::now(),
            tx,
        };

        let pool = match pool_type {
            PoolType::Mempool => &mut pools.mempool,
            PoolType::Stempool => &mut pools.stempool,
        };
        while pool.total_weight.saturating_add(entry.weight) > self.max_weight {
            let Some(candidate) = pool.eviction_candidate() else {
                return Err(PoolError::PoolFull);
            };
            if candidate == id {
                return Err(PoolError::PoolFull);
            }
            // Do not evict a better-paying transaction to admit this one.
            let candidate_entry = &pool.entries[&candidate];
            let keep = (candidate_entry.fee as u128) * (entry.weight.max(1) as u128)
                >= (entry.fee as u128) * (candidate_entry.weight.max(1) as u128);
            if keep {
                return Err(PoolError::PoolFull);
            }
            pool.remove(&candidate);
        }
        pool.insert(id, entry);
        Ok(())
    }

    /// Looks a transaction up by any of its kernel hashes.
    pub fn get_by_kernel_hash(&self, kernel_hash: &Hash256) -> Option<Transaction> {
        let pools = self.read();
        for pool in [&pools.mempool, &pools.stempool] {
            if let Some(id) = pool.kernel_index.get(kernel_hash) {
                if let Some(entry) = pool.entries.get(id) {
                    return Some(entry.tx.clone());
                }
            }
        }
        None
    }

    pub fn contains_kernel(&self, kernel_hash: &Hash256) -> bool {
        let pools = self.read();
        pools.mempool.kernel_index.contains_key(kernel_hash)
            || pools.stempool.kernel_index.contains_key(kernel_hash)
    }

    /// Matches compact-block short ids against pooled kernels. Returns the
    /// transactions covering the matched ids and the ids with no match.
    pub fn retrieve_by_short_ids(
        &self,
        block_hash: &Hash256,
        nonce: u64,
        ids: &[ShortId],
    ) -> (Vec<Transaction>, Vec<ShortId>) {
        let pools = self.read();
        let mut by_short_id: HashMap<ShortId, Hash256> = HashMap::new();
        for pool in [&pools.mempool, &pools.stempool] {
            for (kernel_hash, id) in &pool.kernel_index {
                let short = ShortId::from_kernel_hash(kernel_hash, block_hash, nonce);
                by_short_id.entry(short).or_insert(*id);
            }
        }

        let mut matched_entries: Vec<Hash256> = Vec::new();
        let mut missing = Vec::new();
        for short in ids {
            match by_short_id.get(short) {
                Some(id) => {
                    if !matched_entries.contains(id) {
                        matched_entries.push(*id);
                    }
                }
                None => missing.push(*short),
            }
        }
        let txs = matched_entries
            .into_iter()
            .filter_map(|id| {
                pools
                    .mempool
                    .entries
                    .get(&id)
                    .or_else(|| pools.stempool.entries.get(&id))
                    .map(|entry| entry.tx.clone())
            })
            .collect();
        (txs, missing)
    }

    /// Drops pooled transactions confirmed or invalidated by `block`.
    pub fn reconcile(&self, block: &Block) {
        let kernel_hashes: Vec<Hash256> =
            block.body.kernels.iter().map(|kernel| kernel.hash()).collect();
        let mut guard = self.write();
        let pools: &mut Pools = &mut guard;
        let pool_refs: [&mut Pool; 2] = [&mut pools.mempool, &mut pools.stempool];
        for pool in pool_refs {
            let mut to_remove: Vec<Hash256> = Vec::new();
            for kernel_hash in &kernel_hashes {
                if let Some(id) = pool.kernel_index.get(kernel_hash) {
                    to_remove.push(*id);
                }
            }
            for input in &block.body.inputs {
                if let Some(id) = pool.spent.get(&input.commit) {
                    to_remove.push(*id);
                }
            }
            for id in to_remove {
                pool.remove(&id);
            }
        }
    }

    /// Moves every stem transaction into the mempool and returns them for
    /// broadcast (the fluff phase).
    pub fn fluff_stem<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
        flags: &ValidationFlags,
    ) -> Vec<Transaction> {
        let stems: Vec<Transaction> = {
            let mut pools = self.write();
            let ids: Vec<Hash256> = pools.stempool.entries.keys().copied().collect();
            ids.iter()
                .filter_map(|id| pools.stempool.remove(id))
                .map(|entry| entry.tx)
                .collect()
        };
        let mut fluffed = Vec::new();
        for tx in stems {
            match self.add_tx(tx.clone(), PoolType::Mempool, chain, flags) {
                Ok(()) => fluffed.push(tx),
                Err(err) => debug!("stem transaction dropped at fluff: {err}"),
            }
        }
        fluffed
    }

    /// Every mempool transaction, for aggregate checks and relay.
    pub fn mempool_txs(&self) -> Vec<Transaction> {
        self.read()
            .mempool
            .entries
            .values()
            .map(|entry| entry.tx.clone())
            .collect()
    }
}
