//! Semantic handling of every message type; drives sync progress and
//! relaying. Validation outcomes map onto connection policy here.

use std::sync::Arc;

use mwd_chain::{ChainError, ChainState, ChainStatus, PoolType, TransactionPool};
use mwd_consensus::constants::MAX_PEER_ADDRS;
use mwd_consensus::Hash256;
use mwd_primitives::hash::short_hex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::P2PConfig;
use crate::conn_manager::ConnectionManager;
use crate::connection::Connection;
use crate::msg::{capabilities, BanReason, Message};
use crate::pipeline::{ArchiveJob, BlockJob, Pipeline, PipelineError, TxJob};
use crate::sync::{SyncPhase, SyncStatus};
use crate::NodeStore;

/// What the connection loop should do after a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessResult {
    Success,
    /// Dropped because we are catching up.
    Syncing,
    UnknownMessage,
    /// Query answered with nothing; connection continues.
    NotFound,
    BanPeer(BanReason),
    Disconnect,
}

pub struct MessageProcessor {
    chain: Arc<ChainState<NodeStore>>,
    pool: Arc<TransactionPool>,
    manager: Arc<ConnectionManager>,
    pipeline: Arc<Pipeline>,
    sync: Arc<SyncStatus>,
    config: Arc<P2PConfig>,
}

impl MessageProcessor {
    pub fn new(
        chain: Arc<ChainState<NodeStore>>,
        pool: Arc<TransactionPool>,
        manager: Arc<ConnectionManager>,
        pipeline: Arc<Pipeline>,
        sync: Arc<SyncStatus>,
        config: Arc<P2PConfig>,
    ) -> Self {
        Self {
            chain,
            pool,
            manager,
            pipeline,
            sync,
            config,
        }
    }

    /// Ping carrying our tip, built for the connection's keepalive.
    pub fn ping_message(&self) -> Message {
        let head = self.chain.head();
        Message::Ping {
            total_difficulty: head.total_difficulty,
            height: head.height,
        }
    }

    pub async fn process(&self, conn: &Arc<Connection>, msg: Message) -> ProcessResult {
        match msg {
            Message::Error { reason } => {
                warn!(peer = %conn.peer.addr, "peer error message: {reason}");
                ProcessResult::BanPeer(BanReason::ManualBan)
            }
            Message::BanReason { reason } => {
                warn!(peer = %conn.peer.addr, %reason, "peer banned us");
                ProcessResult::BanPeer(BanReason::ManualBan)
            }
            // Hand/Shake outside the handshake phase is a protocol breach.
            Message::Hand(_) | Message::Shake(_) => {
                ProcessResult::BanPeer(BanReason::BadHandshake)
            }
            Message::Ping {
                total_difficulty,
                height,
            } => {
                conn.peer.update_totals(total_difficulty, height);
                let head = self.chain.head();
                conn.send(&Message::Pong {
                    total_difficulty: head.total_difficulty,
                    height: head.height,
                });
                ProcessResult::Success
            }
            Message::Pong {
                total_difficulty,
                height,
            } => {
                conn.peer.update_totals(total_difficulty, height);
                ProcessResult::Success
            }
            Message::GetPeerAddrs { capabilities } => {
                let peers = self
                    .manager
                    .peer_book
                    .sample(capabilities, MAX_PEER_ADDRS);
                debug!(peer = %conn.peer.addr, count = peers.len(), "serving peer addresses");
                conn.send(&Message::PeerAddrs { peers });
                ProcessResult::Success
            }
            Message::PeerAddrs { peers } => {
                let inserted = self.manager.peer_book.add_fresh_peers(&peers);
                if inserted > 0 {
                    debug!(peer = %conn.peer.addr, inserted, "learned peer addresses");
                }
                ProcessResult::Success
            }
            Message::GetHeaders { locator } => match self.chain.locate_headers(&locator) {
                Ok(headers) => {
                    debug!(peer = %conn.peer.addr, count = headers.len(), "serving headers");
                    conn.send(&Message::Headers(headers));
                    ProcessResult::Success
                }
                Err(err) => {
                    warn!("header locate failed: {err}");
                    ProcessResult::Success
                }
            },
            Message::Header(header) => {
                if header.total_difficulty > conn.peer.total_difficulty() {
                    conn.peer.update_totals(header.total_difficulty, header.height);
                }
                if self.sync.is_syncing() {
                    return ProcessResult::Success;
                }
                let hash = header.hash();
                match self.chain.process_header(&header) {
                    Ok(ChainStatus::Accepted { .. })
                    | Ok(ChainStatus::AlreadyExists)
                    | Ok(ChainStatus::Orphaned) => {
                        match self.chain.has_block(&hash) {
                            Ok(false) => {
                                debug!(
                                    peer = %conn.peer.addr,
                                    hash = %short_hex(&hash),
                                    "header accepted, requesting compact block"
                                );
                                conn.send(&Message::GetCompactBlock { hash });
                            }
                            _ => {}
                        }
                        ProcessResult::Success
                    }
                    Ok(_) => ProcessResult::Success,
                    Err(ChainError::Invalid(reason)) => {
                        warn!(peer = %conn.peer.addr, "invalid header: {reason}");
                        ProcessResult::BanPeer(BanReason::BadBlockHeader)
                    }
                    Err(err) => {
                        warn!("header processing failed: {err}");
                        ProcessResult::Success
                    }
                }
            }
            Message::Headers(headers) => {
                debug!(peer = %conn.peer.addr, count = headers.len(), "received headers");
                match self.chain.process_headers(&headers) {
                    Err(ChainError::Invalid(reason)) => {
                        warn!(peer = %conn.peer.addr, "invalid headers: {reason}");
                        ProcessResult::BanPeer(BanReason::BadBlockHeader)
                    }
                    Err(err) => {
                        warn!("headers processing failed: {err}");
                        ProcessResult::Success
                    }
                    Ok(_) => ProcessResult::Success,
                }
            }
            Message::GetBlock { hash } => match self.chain.get_block(&hash) {
                Ok(Some(block)) => {
                    conn.send(&Message::Block(Box::new(block)));
                    ProcessResult::Success
                }
                _ => ProcessResult::NotFound,
            },
            Message::Block(block) => self.process_block(conn, block),
            Message::GetCompactBlock { hash } => match self.chain.get_block(&hash) {
                Ok(Some(block)) => {
                    let nonce = rand::thread_rng().gen();
                    conn.send(&Message::CompactBlock(Box::new(block.to_compact(nonce))));
                    ProcessResult::Success
                }
                _ => ProcessResult::NotFound,
            },
            Message::CompactBlock(cb) => self.process_compact_block(conn, cb),
            Message::StemTransaction(tx) => {
                if self.sync.is_syncing() {
                    return ProcessResult::Syncing;
                }
                self.enqueue_tx(conn, tx, PoolType::Stempool)
            }
            Message::Transaction(tx) => {
                if self.sync.is_syncing() {
                    return ProcessResult::Syncing;
                }
                self.enqueue_tx(conn, tx, PoolType::Mempool)
            }
            Message::TxHashSetRequest { hash, height } => {
                self.process_txhashset_request(conn, hash, height)
            }
            // The envelope is intercepted by the connection loop, which
            // streams the archive body and calls `process_archive`.
            Message::TxHashSetArchive { .. } => ProcessResult::Success,
            Message::GetTransaction { kernel_hash } => {
                match self.pool.get_by_kernel_hash(&kernel_hash) {
                    Some(tx) => {
                        conn.send(&Message::Transaction(Box::new(tx)));
                        ProcessResult::Success
                    }
                    None => ProcessResult::NotFound,
                }
            }
            Message::TransactionKernel { kernel_hash } => {
                if self.sync.is_syncing() {
                    return ProcessResult::Syncing;
                }
                if self.pool.get_by_kernel_hash(&kernel_hash).is_none() {
                    debug!(
                        peer = %conn.peer.addr,
                        kernel = %short_hex(&kernel_hash),
                        "unknown kernel, requesting transaction"
                    );
                    conn.send(&Message::GetTransaction { kernel_hash });
                }
                ProcessResult::Success
            }
        }
    }

    fn process_block(&self, conn: &Arc<Connection>, block: Box<mwd_primitives::Block>) -> ProcessResult {
        if self.sync.phase() == SyncPhase::BlockSync {
            match self.pipeline.enqueue_block(BlockJob {
                conn_id: conn.id,
                addr: conn.peer.addr,
                block,
            }) {
                Ok(()) => ProcessResult::Success,
                Err(PipelineError::Full) => {
                    debug!(peer = %conn.peer.addr, "block pipeline full, dropping");
                    ProcessResult::Success
                }
                Err(PipelineError::ShuttingDown) => ProcessResult::Disconnect,
            }
        } else {
            let header = block.header.clone();
            match self.chain.process_block(&block) {
                Ok(ChainStatus::Accepted { new_tip }) => {
                    self.pool.reconcile(&block);
                    if new_tip {
                        info!(height = header.height, "relaying new block header");
                        self.manager
                            .broadcast(&Message::Header(Box::new(header)), Some(conn.id));
                    }
                    ProcessResult::Success
                }
                Ok(ChainStatus::Orphaned) => {
                    if block.total_difficulty() > self.chain.total_difficulty() {
                        conn.send(&Message::GetCompactBlock {
                            hash: block.header.prev_hash,
                        });
                    }
                    ProcessResult::Success
                }
                Ok(_) => ProcessResult::Success,
                Err(ChainError::Invalid(reason)) => {
                    warn!(peer = %conn.peer.addr, height = header.height, "invalid block: {reason}");
                    ProcessResult::BanPeer(BanReason::BadBlock)
                }
                Err(err) => {
                    warn!("block processing failed: {err}");
                    ProcessResult::Success
                }
            }
        }
    }

    fn process_compact_block(
        &self,
        conn: &Arc<Connection>,
        cb: Box<mwd_primitives::CompactBlock>,
    ) -> ProcessResult {
        let hash = cb.hash();
        let header = cb.header.clone();
        match self.chain.process_compact_block(&cb, &self.pool) {
            Ok(ChainStatus::Accepted { new_tip }) => {
                if new_tip {
                    self.manager
                        .broadcast(&Message::Header(Box::new(header)), Some(conn.id));
                }
                ProcessResult::Success
            }
            Ok(ChainStatus::TransactionsMissing) => {
                debug!(
                    peer = %conn.peer.addr,
                    hash = %short_hex(&hash),
                    "compact block incomplete, requesting full block"
                );
                conn.send(&Message::GetBlock { hash });
                ProcessResult::Success
            }
            Ok(ChainStatus::Orphaned) => {
                if !self.sync.is_syncing()
                    && header.total_difficulty > self.chain.total_difficulty()
                {
                    conn.send(&Message::GetCompactBlock {
                        hash: header.prev_hash,
                    });
                }
                ProcessResult::Success
            }
            Ok(ChainStatus::AlreadyExists) => ProcessResult::Success,
            Err(ChainError::Invalid(reason)) => {
                warn!(peer = %conn.peer.addr, "invalid compact block: {reason}");
                ProcessResult::BanPeer(BanReason::BadCompactBlock)
            }
            Err(err) => {
                warn!("compact block processing failed: {err}");
                ProcessResult::Success
            }
        }
    }

    fn enqueue_tx(
        &self,
        conn: &Arc<Connection>,
        tx: Box<mwd_primitives::Transaction>,
        pool_type: PoolType,
    ) -> ProcessResult {
        match self.pipeline.enqueue_tx(TxJob {
            conn_id: conn.id,
            addr: conn.peer.addr,
            tx,
            pool_type,
        }) {
            Ok(()) => ProcessResult::Success,
            Err(PipelineError::Full) => {
                debug!(peer = %conn.peer.addr, "transaction pipeline full, dropping");
                ProcessResult::Success
            }
            Err(PipelineError::ShuttingDown) => ProcessResult::Disconnect,
        }
    }

    fn process_txhashset_request(
        &self,
        conn: &Arc<Connection>,
        hash: Hash256,
        height: u64,
    ) -> ProcessResult {
        let allowed = self.manager.peer_book.txhashset_request_allowed(
            &conn.peer.addr.ip(),
            self.config.tx_hash_set_request_cooldown_secs,
        );
        if !allowed {
            warn!(peer = %conn.peer.addr, "repeated txhashset request inside cooldown");
            return ProcessResult::BanPeer(BanReason::ManualBan);
        }
        info!(peer = %conn.peer.addr, height, "serving txhashset snapshot");
        match self.chain.snapshot_at(&hash) {
            Ok(archive) => {
                let envelope = Message::TxHashSetArchive {
                    hash,
                    height,
                    bytes: archive.len() as u64,
                };
                if conn.send_with_attachment(&envelope, archive) {
                    ProcessResult::Success
                } else {
                    ProcessResult::Disconnect
                }
            }
            Err(err) => {
                warn!(peer = %conn.peer.addr, "snapshot failed: {err}");
                ProcessResult::Disconnect
            }
        }
    }

    /// Streamed archive bytes following a TxHashSetArchive envelope.
    pub async fn process_archive(
        &self,
        conn: &Arc<Connection>,
        _hash: Hash256,
        height: u64,
        bytes: Vec<u8>,
    ) {
        if self.sync.phase() != SyncPhase::TxHashSetSync || !self.sync.awaiting_archive() {
            debug!(peer = %conn.peer.addr, "unsolicited txhashset archive dropped");
            return;
        }
        info!(peer = %conn.peer.addr, height, bytes = bytes.len(), "txhashset archive received");
        if let Err(err) = self.pipeline.enqueue_archive(ArchiveJob {
            conn_id: conn.id,
            addr: conn.peer.addr,
            bytes,
        }) {
            debug!("archive pipeline rejected job: {err:?}");
        }
    }

    /// Capability bits we ask peers for when discovering addresses.
    pub fn discovery_capabilities(&self) -> u32 {
        capabilities::PEER_LIST
    }
}
