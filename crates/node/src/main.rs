use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use mwd_chain::{genesis, ChainState, TransactionPool, ValidationFlags};
use mwd_node::config::{parse_args, P2PConfig};
use mwd_node::conn_manager::ConnectionManager;
use mwd_node::peer_book::PeerBook;
use mwd_node::pipeline::Pipeline;
use mwd_node::processor::MessageProcessor;
use mwd_node::server::{self, NodeCtx};
use mwd_node::sync::{SyncStatus, Syncer};
use mwd_node::NodeStore;
use mwd_storage::memory::MemoryStore;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let node_config = parse_args(&args)?;

    let genesis_block = genesis::genesis_block(node_config.network);
    let p2p_config = Arc::new(P2PConfig::for_network(
        node_config.network,
        genesis_block.hash(),
    ));
    println!(
        "Starting mwd on {} (genesis {})",
        node_config.network.as_str(),
        mwd_primitives::hash::short_hex(&genesis_block.hash()),
    );

    let store: NodeStore = Arc::new(MemoryStore::new());
    let flags = ValidationFlags::full();
    let chain = Arc::new(
        ChainState::init(store.clone(), genesis_block, flags.clone())
            .map_err(|err| err.to_string())?,
    );
    let pool = Arc::new(TransactionPool::default());
    let peer_book = Arc::new(PeerBook::new(store));

    let nonce: u64 = rand::thread_rng().gen();
    let manager = Arc::new(ConnectionManager::new(
        Arc::clone(&peer_book),
        Arc::clone(&p2p_config),
        nonce,
    ));
    let sync_status = Arc::new(SyncStatus::new());
    let pipeline = Pipeline::start(
        Arc::clone(&chain),
        Arc::clone(&pool),
        Arc::clone(&manager),
        Arc::clone(&sync_status),
        flags.clone(),
    );
    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&chain),
        Arc::clone(&pool),
        Arc::clone(&manager),
        Arc::clone(&pipeline),
        Arc::clone(&sync_status),
        Arc::clone(&p2p_config),
    ));

    let ctx = Arc::new(NodeCtx {
        chain: Arc::clone(&chain),
        pool: Arc::clone(&pool),
        manager: Arc::clone(&manager),
        pipeline: Arc::clone(&pipeline),
        processor,
        sync: Arc::clone(&sync_status),
        config: Arc::clone(&p2p_config),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listen_port = node_config.listen_port.unwrap_or(p2p_config.p2p_port);
    let listen_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), listen_port);
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|err| format!("failed to bind p2p listener {listen_addr}: {err}"))?;

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(server::serve_inbound(
        listener,
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(server::maintain_outbound(
        Arc::clone(&ctx),
        node_config,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(server::discovery_loop(
        Arc::clone(&ctx),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(server::fluff_loop(
        Arc::clone(&ctx),
        flags,
        shutdown_rx.clone(),
    )));

    let syncer = Syncer::new(
        Arc::clone(&chain),
        Arc::clone(&manager),
        Arc::clone(&sync_status),
        Arc::clone(&p2p_config),
    );
    tasks.push(tokio::spawn(syncer.run(shutdown_rx)));

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| err.to_string())?;
    println!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    manager.close_all();
    pipeline.shutdown();
    for task in tasks {
        task.abort();
    }
    Ok(())
}
