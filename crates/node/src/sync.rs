//! The catch-up state machine: header chain, then optionally a txhashset
//! snapshot, then block bodies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mwd_chain::ChainState;
use mwd_consensus::constants::STATE_SYNC_THRESHOLD;
use mwd_consensus::Hash256;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::P2PConfig;
use crate::conn_manager::ConnectionManager;
use crate::connection::Connection;
use crate::msg::{BanReason, Message};
use crate::NodeStore;

const HEADER_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const TXHASHSET_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const BLOCK_SYNC_STALL: Duration = Duration::from_secs(60);
const BLOCK_REQUEST_BATCH: u64 = 32;
const BLOCK_REQUEST_RETRY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SyncPhase {
    NotSyncing = 0,
    HeaderSync = 1,
    TxHashSetSync = 2,
    BlockSync = 3,
}

impl SyncPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncPhase::HeaderSync,
            2 => SyncPhase::TxHashSetSync,
            3 => SyncPhase::BlockSync,
            _ => SyncPhase::NotSyncing,
        }
    }
}

const ARCHIVE_IDLE: u8 = 0;
const ARCHIVE_PENDING: u8 = 1;
const ARCHIVE_DONE: u8 = 2;
const ARCHIVE_FAILED: u8 = 3;

/// Shared, lock-free snapshot of sync progress, read by the processor on
/// every message.
pub struct SyncStatus {
    phase: AtomicU8,
    target_height: AtomicU64,
    target_difficulty: AtomicU64,
    archive_state: AtomicU8,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(SyncPhase::NotSyncing as u8),
            target_height: AtomicU64::new(0),
            target_difficulty: AtomicU64::new(0),
            archive_state: AtomicU8::new(ARCHIVE_IDLE),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn is_syncing(&self) -> bool {
        self.phase() != SyncPhase::NotSyncing
    }

    pub fn target_height(&self) -> u64 {
        self.target_height.load(Ordering::Relaxed)
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    fn set_target(&self, height: u64, difficulty: u64) {
        self.target_height.store(height, Ordering::Relaxed);
        self.target_difficulty.store(difficulty, Ordering::Relaxed);
    }

    /// True while a requested snapshot has not yet been resolved.
    pub fn awaiting_archive(&self) -> bool {
        self.archive_state.load(Ordering::Relaxed) == ARCHIVE_PENDING
    }

    fn set_archive_pending(&self) {
        self.archive_state.store(ARCHIVE_PENDING, Ordering::Relaxed);
    }

    pub fn note_txhashset_done(&self) {
        self.archive_state.store(ARCHIVE_DONE, Ordering::Relaxed);
    }

    pub fn note_txhashset_failed(&self) {
        self.archive_state.store(ARCHIVE_FAILED, Ordering::Relaxed);
    }

    fn archive_state(&self) -> u8 {
        self.archive_state.load(Ordering::Relaxed)
    }

    fn reset_archive(&self) {
        self.archive_state.store(ARCHIVE_IDLE, Ordering::Relaxed);
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the sync phases from a dedicated task.
pub struct Syncer {
    chain: Arc<ChainState<NodeStore>>,
    manager: Arc<ConnectionManager>,
    status: Arc<SyncStatus>,
    config: Arc<P2PConfig>,
    /// Connection id of the current sync source.
    source: Option<u64>,
    phase_deadline: Instant,
    last_header_height: u64,
    last_block_height: u64,
    block_progress_at: Instant,
    requested_blocks: HashMap<Hash256, Instant>,
}

impl Syncer {
    pub fn new(
        chain: Arc<ChainState<NodeStore>>,
        manager: Arc<ConnectionManager>,
        status: Arc<SyncStatus>,
        config: Arc<P2PConfig>,
    ) -> Self {
        Self {
            chain,
            manager,
            status,
            config,
            source: None,
            phase_deadline: Instant::now(),
            last_header_height: 0,
            last_block_height: 0,
            block_progress_at: Instant::now(),
            requested_blocks: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut sample_countdown = 0u32;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
            match self.status.phase() {
                SyncPhase::NotSyncing => {
                    // Sample the most-work peer every 10 seconds.
                    if sample_countdown == 0 {
                        sample_countdown = 10;
                        self.maybe_start_sync();
                    }
                    sample_countdown -= 1;
                }
                SyncPhase::HeaderSync => self.tick_header_sync(),
                SyncPhase::TxHashSetSync => self.tick_txhashset_sync(),
                SyncPhase::BlockSync => self.tick_block_sync(),
            }
        }
    }

    fn source_conn(&self) -> Option<Arc<Connection>> {
        self.source.and_then(|id| self.manager.get(id))
    }

    /// Drops the current source, banning it unless the reason is `None`,
    /// and falls back to peer selection.
    fn abandon_source(&mut self, reason: BanReason) {
        if reason != BanReason::None {
            if let Some(conn) = self.source_conn() {
                warn!(peer = %conn.peer.addr, %reason, "sync source failed");
                self.manager.ban(conn.peer.addr.ip(), reason);
            }
        }
        self.source = None;
        self.status.reset_archive();
        self.status.set_phase(SyncPhase::NotSyncing);
    }

    fn maybe_start_sync(&mut self) {
        let our_difficulty = self.chain.total_difficulty();
        let Some(peer) = self.manager.most_work_peer(our_difficulty) else {
            return;
        };
        info!(
            peer = %peer.peer.addr,
            peer_difficulty = peer.peer.total_difficulty(),
            our_difficulty,
            "starting header sync"
        );
        self.source = Some(peer.id);
        self.status
            .set_target(peer.peer.height(), peer.peer.total_difficulty());
        self.status.set_phase(SyncPhase::HeaderSync);
        self.phase_deadline = Instant::now() + HEADER_SYNC_TIMEOUT;
        self.last_header_height = self.chain.header_head().height;
        self.request_headers();
    }

    fn request_headers(&mut self) {
        let Some(conn) = self.source_conn() else {
            self.abandon_source(BanReason::None);
            return;
        };
        match self.chain.locator() {
            Ok(locator) => {
                conn.send(&Message::GetHeaders { locator });
            }
            Err(err) => warn!("locator build failed: {err}"),
        }
    }

    fn tick_header_sync(&mut self) {
        let header_head = self.chain.header_head();
        let target_difficulty = self.status.target_difficulty.load(Ordering::Relaxed);

        if header_head.total_difficulty >= target_difficulty {
            let behind = header_head
                .height
                .saturating_sub(self.chain.head().height);
            if behind > self.config.sync_horizon_blocks {
                info!(behind, "header chain complete, requesting txhashset");
                self.status.set_phase(SyncPhase::TxHashSetSync);
                self.status.reset_archive();
                self.phase_deadline = Instant::now() + TXHASHSET_TIMEOUT;
            } else {
                info!(behind, "header chain complete, fetching blocks");
                self.enter_block_sync();
            }
            return;
        }

        if header_head.height > self.last_header_height {
            self.last_header_height = header_head.height;
            self.phase_deadline = Instant::now() + HEADER_SYNC_TIMEOUT;
            self.request_headers();
        } else if Instant::now() > self.phase_deadline {
            self.abandon_source(BanReason::FraudHeight);
        }
    }

    fn tick_txhashset_sync(&mut self) {
        match self.status.archive_state() {
            ARCHIVE_DONE => {
                self.enter_block_sync();
                return;
            }
            ARCHIVE_FAILED => {
                self.abandon_source(BanReason::BadTxHashSet);
                return;
            }
            ARCHIVE_IDLE => {
                // Request a snapshot at a safe distance behind the header
                // tip so short reorgs cannot invalidate it.
                let header_head = self.chain.header_head();
                let height = header_head.height.saturating_sub(STATE_SYNC_THRESHOLD);
                let hash = match self.chain.header_hash_at(height) {
                    Ok(Some(hash)) => hash,
                    _ => {
                        warn!(height, "no header for snapshot request");
                        self.abandon_source(BanReason::None);
                        return;
                    }
                };
                let Some(conn) = self.source_conn() else {
                    self.abandon_source(BanReason::None);
                    return;
                };
                info!(height, "requesting txhashset snapshot");
                conn.send(&Message::TxHashSetRequest { hash, height });
                self.status.set_archive_pending();
            }
            _ => {}
        }
        if Instant::now() > self.phase_deadline {
            self.abandon_source(BanReason::BadTxHashSet);
        }
    }

    fn enter_block_sync(&mut self) {
        self.status.set_phase(SyncPhase::BlockSync);
        self.status.reset_archive();
        self.last_block_height = self.chain.head().height;
        self.block_progress_at = Instant::now();
        self.requested_blocks.clear();
    }

    fn tick_block_sync(&mut self) {
        let head = self.chain.head();
        let header_head = self.chain.header_head();

        if head.height >= header_head.height {
            info!(height = head.height, "block sync complete");
            self.source = None;
            self.requested_blocks.clear();
            self.status.set_phase(SyncPhase::NotSyncing);
            return;
        }

        if head.height > self.last_block_height {
            self.last_block_height = head.height;
            self.block_progress_at = Instant::now();
        } else if self.block_progress_at.elapsed() > BLOCK_SYNC_STALL {
            self.abandon_source(BanReason::FraudHeight);
            return;
        }

        // Fetch the next window of blocks in height order, spreading the
        // requests over every peer that advertises more work than us.
        let now = Instant::now();
        self.requested_blocks
            .retain(|_, at| now.duration_since(*at) < BLOCK_REQUEST_RETRY);

        let mut targets = Vec::new();
        if let Some(conn) = self.source_conn() {
            targets.push(conn);
        }
        if let Some(conn) = self.manager.most_work_peer(self.chain.total_difficulty()) {
            if !targets.iter().any(|existing| existing.id == conn.id) {
                targets.push(conn);
            }
        }
        if targets.is_empty() {
            self.abandon_source(BanReason::None);
            return;
        }

        let top = header_head.height.min(head.height + BLOCK_REQUEST_BATCH);
        let mut target_idx = 0usize;
        for height in head.height + 1..=top {
            let hash = match self.chain.header_hash_at(height) {
                Ok(Some(hash)) => hash,
                _ => break,
            };
            if self.requested_blocks.contains_key(&hash) {
                continue;
            }
            match self.chain.has_block(&hash) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    warn!("block lookup failed: {err}");
                    break;
                }
            }
            let conn = &targets[target_idx % targets.len()];
            target_idx += 1;
            debug!(height, peer = %conn.peer.addr, "requesting block");
            conn.send(&Message::GetBlock { hash });
            self.requested_blocks.insert(hash, now);
        }
    }
}
