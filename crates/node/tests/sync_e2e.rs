//! Two in-process nodes wired over an in-memory link: a fresh node catches
//! up to a peer with more work, moving NotSyncing -> HeaderSync ->
//! BlockSync -> NotSyncing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mwd_chain::genesis::genesis_block;
use mwd_chain::testing::TestChainBuilder;
use mwd_chain::{ChainState, TransactionPool, ValidationFlags};
use mwd_consensus::params::Network;
use mwd_node::config::P2PConfig;
use mwd_node::conn_manager::ConnectionManager;
use mwd_node::connection::{run_connection, ConnectedPeer, Connection, Direction, Link};
use mwd_node::peer_book::PeerBook;
use mwd_node::pipeline::Pipeline;
use mwd_node::processor::MessageProcessor;
use mwd_node::sync::{SyncPhase, SyncStatus, Syncer};
use mwd_node::{handshake, NodeStore};
use mwd_storage::memory::MemoryStore;
use tokio::sync::watch;

struct TestNode {
    chain: Arc<ChainState<NodeStore>>,
    manager: Arc<ConnectionManager>,
    processor: Arc<MessageProcessor>,
    sync: Arc<SyncStatus>,
    config: Arc<P2PConfig>,
}

fn flags() -> ValidationFlags {
    ValidationFlags {
        coinbase_maturity: 2,
        ..ValidationFlags::no_pow()
    }
}

fn build_node(nonce: u64) -> TestNode {
    let store: NodeStore = Arc::new(MemoryStore::new());
    let genesis = genesis_block(Network::Testnet);
    let config = Arc::new(P2PConfig::for_network(Network::Testnet, genesis.hash()));
    let chain = Arc::new(
        ChainState::init(store.clone(), genesis, flags()).expect("init chain"),
    );
    let pool = Arc::new(TransactionPool::default());
    let peer_book = Arc::new(PeerBook::new(store));
    let manager = Arc::new(ConnectionManager::new(
        Arc::clone(&peer_book),
        Arc::clone(&config),
        nonce,
    ));
    let sync = Arc::new(SyncStatus::new());
    let pipeline = Pipeline::start(
        Arc::clone(&chain),
        Arc::clone(&pool),
        Arc::clone(&manager),
        Arc::clone(&sync),
        flags(),
    );
    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&chain),
        pool,
        Arc::clone(&manager),
        pipeline,
        Arc::clone(&sync),
        Arc::clone(&config),
    ));
    TestNode {
        chain,
        manager,
        processor,
        sync,
        config,
    }
}

/// Handshakes over a duplex pair and starts both connection loops.
async fn connect_nodes(
    dialer: &TestNode,
    acceptor: &TestNode,
    dialer_addr: SocketAddr,
    acceptor_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let (dial_stream, accept_stream) = tokio::io::duplex(1024 * 1024);
    let mut dial_link: Box<dyn Link> = Box::new(dial_stream);
    let mut accept_link: Box<dyn Link> = Box::new(accept_stream);

    let accept_config = Arc::clone(&acceptor.config);
    let accept_manager = Arc::clone(&acceptor.manager);
    let accept_difficulty = acceptor.chain.total_difficulty();
    let inbound = tokio::spawn(async move {
        let session = handshake::inbound(
            &mut accept_link,
            &accept_config,
            &accept_manager,
            dialer_addr,
            accept_difficulty,
        )
        .await
        .expect("inbound handshake");
        (session, accept_link)
    });
    let session = handshake::outbound(
        &mut dial_link,
        &dialer.config,
        dialer.manager.nonce,
        acceptor_addr,
        dialer.chain.total_difficulty(),
    )
    .await
    .expect("outbound handshake");
    let (accept_session, accept_link) = inbound.await.expect("join");

    let dial_conn = Arc::new(Connection::new(
        dialer.manager.next_connection_id(),
        ConnectedPeer::new(
            acceptor_addr,
            Direction::Outbound,
            session.capabilities,
            session.user_agent,
            session.version,
            session.total_difficulty,
        ),
        dialer.config.peer_max_send_queue,
    ));
    dialer
        .manager
        .register(Arc::clone(&dial_conn))
        .expect("register dialer side");
    tokio::spawn(run_connection(
        dial_conn,
        dial_link,
        Arc::clone(&dialer.processor),
        Arc::clone(&dialer.manager),
        Arc::clone(&dialer.config),
        shutdown.clone(),
    ));

    let accept_conn = Arc::new(Connection::new(
        acceptor.manager.next_connection_id(),
        ConnectedPeer::new(
            dialer_addr,
            Direction::Inbound,
            accept_session.capabilities,
            accept_session.user_agent,
            accept_session.version,
            accept_session.total_difficulty,
        ),
        acceptor.config.peer_max_send_queue,
    ));
    acceptor
        .manager
        .register(Arc::clone(&accept_conn))
        .expect("register acceptor side");
    tokio::spawn(run_connection(
        accept_conn,
        accept_link,
        Arc::clone(&acceptor.processor),
        Arc::clone(&acceptor.manager),
        Arc::clone(&acceptor.config),
        shutdown,
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_node_syncs_headers_then_blocks() {
    let serving = build_node(11);
    let fresh = build_node(22);

    // The serving node holds an eight-block chain.
    let mut builder = TestChainBuilder::from_genesis(&genesis_block(Network::Testnet));
    for _ in 0..8 {
        let (block, _) = builder.next_block(&[]);
        serving.chain.process_block(&block).expect("serving block");
    }
    assert_eq!(serving.chain.head().height, 8);
    assert_eq!(fresh.chain.head().height, 0);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    connect_nodes(
        &fresh,
        &serving,
        "127.0.0.1:4000".parse().expect("addr"),
        "127.0.0.2:4000".parse().expect("addr"),
        shutdown_rx.clone(),
    )
    .await;

    let syncer = Syncer::new(
        Arc::clone(&fresh.chain),
        Arc::clone(&fresh.manager),
        Arc::clone(&fresh.sync),
        Arc::clone(&fresh.config),
    );
    tokio::spawn(syncer.run(shutdown_rx));

    let mut saw_header_sync = false;
    let mut saw_block_sync = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        match fresh.sync.phase() {
            SyncPhase::HeaderSync => saw_header_sync = true,
            SyncPhase::BlockSync => saw_block_sync = true,
            _ => {}
        }
        if fresh.chain.head().height == 8 && fresh.sync.phase() == SyncPhase::NotSyncing {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "sync stalled: phase {:?}, head {}",
                fresh.sync.phase(),
                fresh.chain.head().height
            );
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    assert!(saw_header_sync, "never entered header sync");
    assert!(saw_block_sync, "never entered block sync");
    assert_eq!(fresh.chain.head().hash, serving.chain.head().hash);
    let _ = shutdown_tx.send(true);
}
