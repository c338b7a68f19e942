//! Accept and dial loops, peer discovery, and stem fluffing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mwd_chain::{ChainState, TransactionPool, ValidationFlags};
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, P2PConfig};
use crate::conn_manager::ConnectionManager;
use crate::connection::{run_connection, ConnectedPeer, Connection, Direction, Link};
use crate::handshake;
use crate::msg::{capabilities, Message};
use crate::pipeline::Pipeline;
use crate::processor::MessageProcessor;
use crate::sync::SyncStatus;
use crate::NodeStore;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_RETRY: Duration = Duration::from_secs(10);
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(120);
const FLUFF_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a connection task needs, bundled once at startup.
pub struct NodeCtx {
    pub chain: Arc<ChainState<NodeStore>>,
    pub pool: Arc<TransactionPool>,
    pub manager: Arc<ConnectionManager>,
    pub pipeline: Arc<Pipeline>,
    pub processor: Arc<MessageProcessor>,
    pub sync: Arc<SyncStatus>,
    pub config: Arc<P2PConfig>,
}

/// Registers a handshaken link and runs its connection until it closes.
async fn spawn_connection(
    ctx: Arc<NodeCtx>,
    link: Box<dyn Link>,
    addr: SocketAddr,
    direction: Direction,
    session: handshake::PeerSession,
    shutdown: watch::Receiver<bool>,
) {
    let peer = ConnectedPeer::new(
        addr,
        direction,
        session.capabilities,
        session.user_agent.clone(),
        session.version,
        session.total_difficulty,
    );
    let conn = Arc::new(Connection::new(
        ctx.manager.next_connection_id(),
        peer,
        ctx.config.peer_max_send_queue,
    ));
    if ctx.manager.register(Arc::clone(&conn)).is_err() {
        debug!(peer = %addr, "duplicate connection dropped");
        return;
    }
    ctx.manager
        .peer_book
        .record_contact(addr, session.capabilities, &session.user_agent);
    info!(peer = %addr, id = conn.id, ?direction, "peer connected");

    run_connection(
        conn,
        link,
        Arc::clone(&ctx.processor),
        Arc::clone(&ctx.manager),
        Arc::clone(&ctx.config),
        shutdown,
    )
    .await;
}

pub async fn serve_inbound(
    listener: TcpListener,
    ctx: Arc<NodeCtx>,
    shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("P2P listening on {addr}");
    }
    let mut shutdown_rx = shutdown.clone();
    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("p2p accept failed: {err}");
                    continue;
                }
            },
            _ = shutdown_rx.changed() => return,
        };
        if ctx.manager.peer_book.is_banned(&remote_addr.ip()) {
            debug!(peer = %remote_addr, "refusing banned peer");
            continue;
        }
        if ctx.manager.is_connected(&remote_addr.ip()) {
            debug!(peer = %remote_addr, "already connected, refusing");
            continue;
        }

        let ctx = Arc::clone(&ctx);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut link: Box<dyn Link> = Box::new(stream);
            let session = match handshake::inbound(
                &mut link,
                &ctx.config,
                &ctx.manager,
                remote_addr,
                ctx.chain.total_difficulty(),
            )
            .await
            {
                Ok(session) => session,
                Err(err) => {
                    debug!(peer = %remote_addr, "inbound handshake failed: {err}");
                    return;
                }
            };
            spawn_connection(ctx, link, remote_addr, Direction::Inbound, session, shutdown).await;
        });
    }
}

pub async fn connect_outbound(
    ctx: Arc<NodeCtx>,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> bool {
    if ctx.manager.is_connected(&addr.ip()) || ctx.manager.peer_book.is_banned(&addr.ip()) {
        return false;
    }
    let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(peer = %addr, "dial failed: {err}");
            return false;
        }
        Err(_) => {
            debug!(peer = %addr, "dial timed out");
            return false;
        }
    };
    let mut link: Box<dyn Link> = Box::new(stream);
    let session = match handshake::outbound(
        &mut link,
        &ctx.config,
        ctx.manager.nonce,
        addr,
        ctx.chain.total_difficulty(),
    )
    .await
    {
        Ok(session) => session,
        Err(err) => {
            debug!(peer = %addr, "outbound handshake failed: {err}");
            return false;
        }
    };
    tokio::spawn(async move {
        spawn_connection(ctx, link, addr, Direction::Outbound, session, shutdown).await;
    });
    true
}

/// Keeps the outbound connection count at its target, drawing from seeds
/// and the peer book.
pub async fn maintain_outbound(
    ctx: Arc<NodeCtx>,
    node_config: NodeConfig,
    shutdown: watch::Receiver<bool>,
) {
    let mut shutdown_rx = shutdown.clone();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(OUTBOUND_RETRY) => {}
            _ = shutdown_rx.changed() => return,
        }
        let missing = node_config
            .outbound_target
            .saturating_sub(ctx.manager.count());
        if missing == 0 {
            continue;
        }
        let mut candidates = node_config.seeds.clone();
        candidates.extend(
            ctx.manager
                .peer_book
                .sample(capabilities::UNKNOWN, missing * 4),
        );
        candidates.shuffle(&mut rand::thread_rng());
        let mut dialed = 0usize;
        for addr in candidates {
            if dialed >= missing {
                break;
            }
            if connect_outbound(Arc::clone(&ctx), addr, shutdown.clone()).await {
                dialed += 1;
            }
        }
    }
}

/// Asks a random peer for fresh addresses at a steady cadence.
pub async fn discovery_loop(ctx: Arc<NodeCtx>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(DISCOVERY_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }
        let capabilities = ctx.processor.discovery_capabilities();
        if let Some(conn) = ctx.manager.most_work_peer(0) {
            conn.send(&Message::GetPeerAddrs { capabilities });
        }
    }
}

/// Periodically fluffs the stempool into the mempool and broadcasts the
/// result.
pub async fn fluff_loop(
    ctx: Arc<NodeCtx>,
    flags: ValidationFlags,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(FLUFF_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }
        if ctx.sync.is_syncing() {
            continue;
        }
        for tx in ctx.pool.fluff_stem(&ctx.chain, &flags) {
            ctx.manager
                .broadcast(&Message::Transaction(Box::new(tx)), None);
        }
    }
}
