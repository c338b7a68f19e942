use std::sync::Arc;

use mwd_chain::genesis::genesis_block;
use mwd_chain::testing::{blind, transaction, Coin, TestChainBuilder};
use mwd_chain::{ChainState, PoolError, PoolType, TransactionPool, ValidationFlags};
use mwd_consensus::params::Network;
use mwd_crypto::{commit, commit_value, sum_commits};
use mwd_primitives::{Commitment, Transaction};
use mwd_storage::memory::MemoryStore;

fn flags() -> ValidationFlags {
    ValidationFlags {
        coinbase_maturity: 1,
        ..ValidationFlags::no_pow()
    }
}

/// A chain with a few spendable coinbase outputs.
fn funded_chain() -> (ChainState<Arc<MemoryStore>>, Vec<Coin>) {
    let chain = ChainState::init(
        Arc::new(MemoryStore::new()),
        genesis_block(Network::Testnet),
        flags(),
    )
    .expect("init chain");
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));
    let mut coins = Vec::new();
    for _ in 0..3 {
        let (block, coin) = builder.next_block(&[]);
        chain.process_block(&block).expect("block");
        coins.push(coin);
    }
    (chain, coins)
}

#[test]
fn accepts_and_indexes_by_kernel_hash() {
    let (chain, coins) = funded_chain();
    let pool = TransactionPool::default();
    let tx = transaction(
        &[coins[0]],
        &[Coin {
            value: coins[0].value - 4,
            blind: blind(300),
        }],
        4,
    );
    let kernel_hash = tx.first_kernel_hash().expect("kernel");

    pool.add_tx(tx.clone(), PoolType::Mempool, &chain, &flags())
        .expect("add");
    assert_eq!(pool.size(PoolType::Mempool), 1);
    assert_eq!(pool.get_by_kernel_hash(&kernel_hash), Some(tx.clone()));

    match pool.add_tx(tx, PoolType::Mempool, &chain, &flags()) {
        Err(PoolError::AlreadyInPool) => {}
        other => panic!("expected duplicate rejection, got {other:?}"),
    }
}

#[test]
fn conflicting_spend_is_rejected() {
    let (chain, coins) = funded_chain();
    let pool = TransactionPool::default();
    let first = transaction(
        &[coins[0]],
        &[Coin {
            value: coins[0].value - 1,
            blind: blind(301),
        }],
        1,
    );
    let double = transaction(
        &[coins[0]],
        &[Coin {
            value: coins[0].value - 2,
            blind: blind(302),
        }],
        2,
    );
    pool.add_tx(first, PoolType::Mempool, &chain, &flags())
        .expect("add");
    match pool.add_tx(double, PoolType::Mempool, &chain, &flags()) {
        Err(PoolError::ConflictingInput(_)) => {}
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[test]
fn missing_input_is_rejected_not_banned() {
    let (chain, _) = funded_chain();
    let pool = TransactionPool::default();
    // A self-consistent transaction spending an output this chain never saw.
    let phantom = Coin {
        value: 1_000,
        blind: blind(400),
    };
    let tx = transaction(
        &[phantom],
        &[Coin {
            value: 990,
            blind: blind(401),
        }],
        10,
    );
    match pool.add_tx(tx, PoolType::Mempool, &chain, &flags()) {
        Err(PoolError::MissingInput(_)) => {}
        other => panic!("expected missing input, got {other:?}"),
    }
}

/// For any set of pooled transactions with total fee F, the aggregate
/// balance holds: `Σoutputs − Σinputs + F·H == Σexcess (+ offsets)`.
#[test]
fn mempool_aggregate_sums_balance() {
    let (chain, coins) = funded_chain();
    let pool = TransactionPool::default();
    let txs = [
        transaction(
            &[coins[0]],
            &[Coin {
                value: coins[0].value - 2,
                blind: blind(310),
            }],
            2,
        ),
        transaction(
            &[coins[1]],
            &[
                Coin {
                    value: 1_000,
                    blind: blind(311),
                },
                Coin {
                    value: coins[1].value - 1_005,
                    blind: blind(312),
                },
            ],
            5,
        ),
    ];
    for tx in &txs {
        pool.add_tx(tx.clone(), PoolType::Mempool, &chain, &flags())
            .expect("add");
    }

    let pooled: Vec<Transaction> = pool.mempool_txs();
    assert_eq!(pooled.len(), 2);
    let total_fee: u64 = pooled.iter().map(|tx| tx.fee()).sum();
    assert_eq!(total_fee, 7);

    let mut outputs: Vec<Commitment> = Vec::new();
    let mut inputs: Vec<Commitment> = Vec::new();
    let mut excesses: Vec<Commitment> = Vec::new();
    for tx in &pooled {
        outputs.extend(tx.body.outputs.iter().map(|output| output.commit));
        inputs.extend(tx.body.inputs.iter().map(|input| input.commit));
        excesses.extend(tx.body.kernels.iter().map(|kernel| kernel.excess));
        assert!(tx.offset.is_zero());
    }
    outputs.push(commit_value(total_fee).expect("fee commit"));
    let utxo_side = sum_commits(&outputs, &inputs).expect("utxo sum");
    let kernel_side = sum_commits(&excesses, &[]).expect("kernel sum");
    assert_eq!(utxo_side, kernel_side);
}

#[test]
fn stem_transactions_fluff_into_the_mempool() {
    let (chain, coins) = funded_chain();
    let pool = TransactionPool::default();
    let tx = transaction(
        &[coins[2]],
        &[Coin {
            value: coins[2].value - 3,
            blind: blind(320),
        }],
        3,
    );
    pool.add_tx(tx.clone(), PoolType::Stempool, &chain, &flags())
        .expect("stem add");
    assert_eq!(pool.size(PoolType::Stempool), 1);
    assert_eq!(pool.size(PoolType::Mempool), 0);

    let fluffed = pool.fluff_stem(&chain, &flags());
    assert_eq!(fluffed.len(), 1);
    assert_eq!(pool.size(PoolType::Stempool), 0);
    assert_eq!(pool.size(PoolType::Mempool), 1);
}

#[test]
fn mempool_spend_displaces_conflicting_stem() {
    let (chain, coins) = funded_chain();
    let pool = TransactionPool::default();
    let stem = transaction(
        &[coins[0]],
        &[Coin {
            value: coins[0].value - 1,
            blind: blind(330),
        }],
        1,
    );
    let fluffed = transaction(
        &[coins[0]],
        &[Coin {
            value: coins[0].value - 2,
            blind: blind(331),
        }],
        2,
    );
    pool.add_tx(stem, PoolType::Stempool, &chain, &flags())
        .expect("stem add");
    pool.add_tx(fluffed, PoolType::Mempool, &chain, &flags())
        .expect("mempool add");
    assert_eq!(pool.size(PoolType::Stempool), 0);
    assert_eq!(pool.size(PoolType::Mempool), 1);
}

#[test]
fn short_id_retrieval_reports_missing() {
    let (chain, coins) = funded_chain();
    let pool = TransactionPool::default();
    let tx = transaction(
        &[coins[0]],
        &[Coin {
            value: coins[0].value - 1,
            blind: blind(340),
        }],
        1,
    );
    pool.add_tx(tx.clone(), PoolType::Mempool, &chain, &flags())
        .expect("add");

    let block_hash = [7u8; 32];
    let nonce = 9;
    let kernel_hash = tx.first_kernel_hash().expect("kernel");
    let present = mwd_primitives::ShortId::from_kernel_hash(&kernel_hash, &block_hash, nonce);
    let absent = mwd_primitives::ShortId::from_kernel_hash(&[9u8; 32], &block_hash, nonce);

    let (txs, missing) = pool.retrieve_by_short_ids(&block_hash, nonce, &[present, absent]);
    assert_eq!(txs.len(), 1);
    assert_eq!(missing, vec![absent]);
}

#[test]
fn reconcile_drops_confirmed_transactions() {
    let (chain, coins) = funded_chain();
    let pool = TransactionPool::default();
    let tx = transaction(
        &[coins[0]],
        &[Coin {
            value: coins[0].value - 6,
            blind: blind(350),
        }],
        6,
    );
    pool.add_tx(tx.clone(), PoolType::Mempool, &chain, &flags())
        .expect("add");

    // A block carrying the same kernel clears the pool entry; reconcile
    // only looks at kernels and spent inputs.
    let confirming = mwd_primitives::Block {
        header: genesis_block(Network::Testnet).header,
        offset: tx.offset,
        body: tx.body.clone(),
    };
    pool.reconcile(&confirming);
    assert_eq!(pool.size(PoolType::Mempool), 0);
}
