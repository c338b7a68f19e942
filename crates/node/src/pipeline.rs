//! Bounded work pipelines: block processing, transaction processing, and
//! txhashset ingest, each drained by a small pool of dedicated threads.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mwd_chain::{ChainState, ChainStatus, PoolError, PoolType, TransactionPool, ValidationFlags};
use mwd_primitives::{Block, Transaction};
use tracing::{debug, info, warn};

use crate::conn_manager::ConnectionManager;
use crate::msg::BanReason;
use crate::sync::SyncStatus;
use crate::NodeStore;

const BLOCK_QUEUE_CAP: usize = 32;
const TX_QUEUE_CAP: usize = 64;
const ARCHIVE_QUEUE_CAP: usize = 1;
const BLOCK_WORKERS: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipelineError {
    Full,
    ShuttingDown,
}

pub struct BlockJob {
    pub conn_id: u64,
    pub addr: SocketAddr,
    pub block: Box<Block>,
}

pub struct TxJob {
    pub conn_id: u64,
    pub addr: SocketAddr,
    pub tx: Box<Transaction>,
    pub pool_type: PoolType,
}

pub struct ArchiveJob {
    pub conn_id: u64,
    pub addr: SocketAddr,
    pub bytes: Vec<u8>,
}

struct Senders {
    block: Sender<BlockJob>,
    tx: Sender<TxJob>,
    archive: Sender<ArchiveJob>,
}

pub struct Pipeline {
    senders: RwLock<Option<Senders>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn start(
        chain: Arc<ChainState<NodeStore>>,
        pool: Arc<TransactionPool>,
        manager: Arc<ConnectionManager>,
        sync: Arc<SyncStatus>,
        flags: ValidationFlags,
    ) -> Arc<Self> {
        let (block_tx, block_rx) = bounded::<BlockJob>(BLOCK_QUEUE_CAP);
        let (tx_tx, tx_rx) = bounded::<TxJob>(TX_QUEUE_CAP);
        let (archive_tx, archive_rx) = bounded::<ArchiveJob>(ARCHIVE_QUEUE_CAP);

        let mut handles = Vec::new();
        for worker in 0..BLOCK_WORKERS {
            let rx = block_rx.clone();
            let chain = Arc::clone(&chain);
            let pool = Arc::clone(&pool);
            let manager = Arc::clone(&manager);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("block-pipe-{worker}"))
                    .spawn(move || block_worker(rx, chain, pool, manager))
                    .expect("spawn block worker"),
            );
        }

        let tx_workers = std::thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(2)
            .clamp(2, 4);
        for worker in 0..tx_workers {
            let rx = tx_rx.clone();
            let chain = Arc::clone(&chain);
            let pool = Arc::clone(&pool);
            let manager = Arc::clone(&manager);
            let flags = flags.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("tx-pipe-{worker}"))
                    .spawn(move || tx_worker(rx, chain, pool, manager, flags))
                    .expect("spawn tx worker"),
            );
        }

        {
            let chain = Arc::clone(&chain);
            let manager = Arc::clone(&manager);
            let sync = Arc::clone(&sync);
            handles.push(
                std::thread::Builder::new()
                    .name("txhashset-pipe".to_string())
                    .spawn(move || archive_worker(archive_rx, chain, manager, sync))
                    .expect("spawn txhashset worker"),
            );
        }

        Arc::new(Self {
            senders: RwLock::new(Some(Senders {
                block: block_tx,
                tx: tx_tx,
                archive: archive_tx,
            })),
            handles: std::sync::Mutex::new(handles),
        })
    }

    fn with_senders<T>(
        &self,
        f: impl FnOnce(&Senders) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let guard = self
            .senders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(senders) => f(senders),
            None => Err(PipelineError::ShuttingDown),
        }
    }

    pub fn enqueue_block(&self, job: BlockJob) -> Result<(), PipelineError> {
        self.with_senders(|senders| match senders.block.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PipelineError::Full),
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::ShuttingDown),
        })
    }

    pub fn enqueue_tx(&self, job: TxJob) -> Result<(), PipelineError> {
        self.with_senders(|senders| match senders.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PipelineError::Full),
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::ShuttingDown),
        })
    }

    pub fn enqueue_archive(&self, job: ArchiveJob) -> Result<(), PipelineError> {
        self.with_senders(|senders| match senders.archive.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PipelineError::Full),
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::ShuttingDown),
        })
    }

    /// Closes the queues; workers finish their current item and exit.
    pub fn shutdown(&self) {
        self.senders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let handles: Vec<_> = {
            let mut guard = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn block_worker(
    rx: Receiver<BlockJob>,
    chain: Arc<ChainState<NodeStore>>,
    pool: Arc<TransactionPool>,
    manager: Arc<ConnectionManager>,
) {
    while let Ok(job) = rx.recv() {
        match chain.process_block(&job.block) {
            Ok(ChainStatus::Accepted { new_tip }) => {
                if new_tip {
                    pool.reconcile(&job.block);
                }
            }
            Ok(ChainStatus::Orphaned) => {
                debug!(height = job.block.height(), "sync block orphaned");
            }
            Ok(_) => {}
            Err(mwd_chain::ChainError::Invalid(reason)) => {
                warn!(peer = %job.addr, height = job.block.height(), "invalid block: {reason}");
                manager.ban(job.addr.ip(), BanReason::BadBlock);
            }
            Err(err) => warn!("block pipeline failure: {err}"),
        }
    }
}

fn tx_worker(
    rx: Receiver<TxJob>,
    chain: Arc<ChainState<NodeStore>>,
    pool: Arc<TransactionPool>,
    manager: Arc<ConnectionManager>,
    flags: ValidationFlags,
) {
    while let Ok(job) = rx.recv() {
        match pool.add_tx((*job.tx).clone(), job.pool_type, &chain, &flags) {
            Ok(()) => {
                if job.pool_type == PoolType::Mempool {
                    manager.broadcast(
                        &crate::msg::Message::Transaction(job.tx),
                        Some(job.conn_id),
                    );
                }
            }
            Err(PoolError::Invalid(reason)) => {
                warn!(peer = %job.addr, "invalid transaction: {reason}");
                manager.ban(job.addr.ip(), BanReason::ManualBan);
            }
            Err(err) => debug!(peer = %job.addr, "transaction dropped: {err}"),
        }
    }
}

fn archive_worker(
    rx: Receiver<ArchiveJob>,
    chain: Arc<ChainState<NodeStore>>,
    manager: Arc<ConnectionManager>,
    sync: Arc<SyncStatus>,
) {
    while let Ok(job) = rx.recv() {
        info!(peer = %job.addr, bytes = job.bytes.len(), "validating txhashset snapshot");
        match chain.apply_snapshot(&job.bytes) {
            Ok(tip) => {
                info!(height = tip.height, "txhashset snapshot applied");
                sync.note_txhashset_done();
            }
            Err(err) => {
                warn!(peer = %job.addr, "txhashset snapshot rejected: {err}");
                manager.ban(job.addr.ip(), BanReason::BadTxHashSet);
                sync.note_txhashset_failed();
            }
        }
    }
}
