use std::sync::Arc;

use mwd_chain::genesis::genesis_block;
use mwd_chain::testing::{transaction, Coin, TestChainBuilder};
use mwd_chain::{
    BlockError, ChainError, ChainState, ChainStatus, TransactionPool, ValidationFlags,
};
use mwd_consensus::params::Network;
use mwd_storage::memory::MemoryStore;

fn test_flags() -> ValidationFlags {
    ValidationFlags {
        coinbase_maturity: 2,
        ..ValidationFlags::no_pow()
    }
}

fn new_chain(flags: ValidationFlags) -> ChainState<Arc<MemoryStore>> {
    let store = Arc::new(MemoryStore::new());
    ChainState::init(store, genesis_block(Network::Testnet), flags).expect("init chain")
}

#[test]
fn accepts_a_chain_and_tracks_difficulty() {
    let chain = new_chain(test_flags());
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));

    let mut last_difficulty = chain.total_difficulty();
    for _ in 0..3 {
        let (block, _) = builder.next_block(&[]);
        let status = chain.process_block(&block).expect("process block");
        assert_eq!(status, ChainStatus::Accepted { new_tip: true });
        assert!(chain.total_difficulty() > last_difficulty);
        last_difficulty = chain.total_difficulty();
    }
    assert_eq!(chain.head().height, 3);
    assert_eq!(chain.header_head().height, 3);

    let (block4, _) = builder.next_block(&[]);
    assert_eq!(
        chain.process_block(&block4).expect("reprocess"),
        ChainStatus::Accepted { new_tip: true }
    );
    assert_eq!(
        chain.process_block(&block4).expect("duplicate"),
        ChainStatus::AlreadyExists
    );
}

#[test]
fn roots_match_recorded_headers() {
    let chain = new_chain(test_flags());
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));
    let (b1, coin) = builder.next_block(&[]);
    let (b2, _) = builder.next_block(&[]);
    chain.process_block(&b1).expect("b1");
    chain.process_block(&b2).expect("b2");

    let tx = transaction(
        &[coin],
        &[Coin {
            value: coin.value - 5,
            blind: mwd_chain::testing::blind(777),
        }],
        5,
    );
    let (b3, _) = builder.next_block(&[tx]);
    assert_eq!(
        chain.process_block(&b3).expect("b3"),
        ChainStatus::Accepted { new_tip: true }
    );
    // Spent coinbase left the UTXO set; the new output entered it.
    assert!(chain
        .utxo_entry(&mwd_crypto::commit(coin.value, &coin.blind).expect("commit"))
        .is_none());
    assert!(chain
        .utxo_entry(
            &mwd_crypto::commit(coin.value - 5, &mwd_chain::testing::blind(777)).expect("commit")
        )
        .is_some());
}

#[test]
fn orphan_waits_for_its_parent() {
    let chain = new_chain(test_flags());
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));
    let (b1, _) = builder.next_block(&[]);
    let (b2, _) = builder.next_block(&[]);

    assert_eq!(
        chain.process_block(&b2).expect("orphan"),
        ChainStatus::Orphaned
    );
    assert_eq!(chain.head().height, 0);

    // The parent arrives; the orphan is retried automatically.
    chain.process_block(&b1).expect("parent");
    assert_eq!(chain.head().height, 2);
}

#[test]
fn premature_coinbase_spend_is_invalid() {
    let flags = ValidationFlags {
        coinbase_maturity: 10,
        ..ValidationFlags::no_pow()
    };
    let chain = new_chain(flags);
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));
    let (b1, coin) = builder.next_block(&[]);
    chain.process_block(&b1).expect("b1");

    let tx = transaction(
        &[coin],
        &[Coin {
            value: coin.value - 1,
            blind: mwd_chain::testing::blind(900),
        }],
        1,
    );
    let (b2, _) = builder.next_block(&[tx]);
    match chain.process_block(&b2) {
        Err(ChainError::Invalid(BlockError::ImmatureCoinbase(_))) => {}
        other => panic!("expected immature coinbase, got {other:?}"),
    }
}

#[test]
fn tampered_block_is_invalid() {
    let chain = new_chain(test_flags());
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));
    let (b1, _) = builder.next_block(&[]);

    let mut tampered = b1.clone();
    tampered.body.kernels[0].fee = 1;
    match chain.process_block(&tampered) {
        Err(ChainError::Invalid(_)) => {}
        other => panic!("expected invalid block, got {other:?}"),
    }
    // The original still applies cleanly afterwards.
    assert_eq!(
        chain.process_block(&b1).expect("b1"),
        ChainStatus::Accepted { new_tip: true }
    );
}

#[test]
fn heavier_fork_reorganizes_the_chain() {
    let chain = new_chain(test_flags());
    let genesis = genesis_block(Network::Testnet);

    let mut fork_a = TestChainBuilder::from_genesis(&genesis);
    fork_a.set_blind_offset(10_000);
    let (a1, a1_coin) = fork_a.next_block(&[]);
    let (a2, _) = fork_a.next_block(&[]);

    let mut fork_b = TestChainBuilder::from_genesis(&genesis);
    fork_b.set_blind_offset(20_000);
    let (b1, b1_coin) = fork_b.next_block(&[]);
    let (b2, _) = fork_b.next_block(&[]);
    let (b3, _) = fork_b.next_block(&[]);

    chain.process_block(&a1).expect("a1");
    chain.process_block(&a2).expect("a2");
    assert_eq!(chain.head().hash, a2.hash());

    // Equal-work side blocks are stored without moving the head.
    assert_eq!(
        chain.process_block(&b1).expect("b1"),
        ChainStatus::Accepted { new_tip: false }
    );
    assert_eq!(
        chain.process_block(&b2).expect("b2"),
        ChainStatus::Accepted { new_tip: false }
    );
    assert_eq!(chain.head().hash, a2.hash());

    // The third fork block carries more work and triggers the reorg.
    assert_eq!(
        chain.process_block(&b3).expect("b3"),
        ChainStatus::Accepted { new_tip: true }
    );
    assert_eq!(chain.head().hash, b3.hash());
    assert_eq!(chain.head().height, 3);

    // UTXO view follows the winning fork.
    let a_commit = mwd_crypto::commit(a1_coin.value, &a1_coin.blind).expect("commit");
    let b_commit = mwd_crypto::commit(b1_coin.value, &b1_coin.blind).expect("commit");
    assert!(chain.utxo_entry(&a_commit).is_none());
    assert!(chain.utxo_entry(&b_commit).is_some());
}

#[test]
fn compact_block_hydrates_from_the_pool() {
    let flags = test_flags();
    let chain = new_chain(flags.clone());
    let pool = TransactionPool::default();
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));

    let (b1, coin) = builder.next_block(&[]);
    let (b2, _) = builder.next_block(&[]);
    chain.process_block(&b1).expect("b1");
    chain.process_block(&b2).expect("b2");

    let tx = transaction(
        &[coin],
        &[Coin {
            value: coin.value - 3,
            blind: mwd_chain::testing::blind(800),
        }],
        3,
    );
    let (b3, _) = builder.next_block(&[tx.clone()]);
    let compact = b3.to_compact(42);

    // Without the transaction the short id cannot be resolved.
    assert_eq!(
        chain
            .process_compact_block(&compact, &pool)
            .expect("compact"),
        ChainStatus::TransactionsMissing
    );

    pool.add_tx(tx, mwd_chain::PoolType::Mempool, &chain, &flags)
        .expect("pool add");
    assert_eq!(
        chain
            .process_compact_block(&compact, &pool)
            .expect("compact"),
        ChainStatus::Accepted { new_tip: true }
    );
    assert_eq!(chain.head().hash, b3.hash());
}

#[test]
fn locator_serves_following_headers() {
    let chain = new_chain(test_flags());
    let serving = new_chain(test_flags());
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));
    for _ in 0..5 {
        let (block, _) = builder.next_block(&[]);
        serving.process_block(&block).expect("block");
    }

    // A fresh node's locator is just its genesis; the serving node answers
    // with everything after it.
    let locator = chain.locator().expect("locator");
    assert_eq!(*locator.last().expect("genesis"), chain.genesis_hash());
    let headers = serving.locate_headers(&locator).expect("locate");
    assert_eq!(headers.len(), 5);
    assert_eq!(headers[0].height, 1);
    assert_eq!(headers[4].height, 5);

    // Feed them back; the header chain advances without block bodies.
    chain.process_headers(&headers).expect("headers");
    assert_eq!(chain.header_head().height, 5);
    assert_eq!(chain.head().height, 0);
}

#[test]
fn snapshot_fast_forwards_a_fresh_node() {
    let flags = test_flags();
    let source = new_chain(flags.clone());
    let target = new_chain(flags);
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));

    let (b1, coin) = builder.next_block(&[]);
    let (b2, _) = builder.next_block(&[]);
    let tx = transaction(
        &[coin],
        &[Coin {
            value: coin.value - 2,
            blind: mwd_chain::testing::blind(600),
        }],
        2,
    );
    let (b3, _) = builder.next_block(&[tx]);
    let (b4, _) = builder.next_block(&[]);
    let (b5, _) = builder.next_block(&[]);

    for block in [&b1, &b2, &b3, &b4, &b5] {
        source.process_block(block).expect("source block");
    }

    // Target learns headers only, then applies a snapshot at height 4.
    target
        .process_headers(&[
            b1.header.clone(),
            b2.header.clone(),
            b3.header.clone(),
            b4.header.clone(),
            b5.header.clone(),
        ])
        .expect("headers");
    assert_eq!(target.head().height, 0);

    let snapshot = source.snapshot_at(&b4.hash()).expect("snapshot");
    let tip = target.apply_snapshot(&snapshot).expect("apply snapshot");
    assert_eq!(tip.height, 4);
    assert_eq!(target.head().height, 4);

    // The spent coinbase is not in the restored UTXO set.
    let spent = mwd_crypto::commit(coin.value, &coin.blind).expect("commit");
    assert!(target.utxo_entry(&spent).is_none());

    // The tail applies on top of the snapshot.
    assert_eq!(
        target.process_block(&b5).expect("b5"),
        ChainStatus::Accepted { new_tip: true }
    );
    assert_eq!(target.head().height, 5);
}

#[test]
fn corrupted_snapshot_is_rejected() {
    let flags = test_flags();
    let source = new_chain(flags.clone());
    let target = new_chain(flags);
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));
    let mut headers = Vec::new();
    let mut tip_hash = None;
    for _ in 0..3 {
        let (block, _) = builder.next_block(&[]);
        source.process_block(&block).expect("block");
        headers.push(block.header.clone());
        tip_hash = Some(block.hash());
    }
    target.process_headers(&headers).expect("headers");

    let mut snapshot = source
        .snapshot_at(&tip_hash.expect("tip"))
        .expect("snapshot");
    let len = snapshot.len();
    snapshot[len - 1] ^= 0xff;
    assert!(target.apply_snapshot(&snapshot).is_err());
    assert_eq!(target.head().height, 0);
}
