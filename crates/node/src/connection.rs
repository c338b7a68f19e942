//! A live peer connection: session state, prioritized send queue, and the
//! read/write/ping loop.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mwd_primitives::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::P2PConfig;
use crate::conn_manager::ConnectionManager;
use crate::msg::{write_frame, BanReason, FrameError, FrameReader, Message};
use crate::processor::{MessageProcessor, ProcessResult};
use crate::rate_limit::TokenBucket;

/// Stream transport seam; TCP in production, in-memory duplex in tests.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Link for T {}

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_CLOSE: Duration = Duration::from_secs(120);
/// Hard cap on a streamed txhashset archive.
const MAX_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Live session state for one peer, shared read-only across the node.
pub struct ConnectedPeer {
    pub addr: SocketAddr,
    pub direction: Direction,
    pub capabilities: u32,
    pub user_agent: String,
    /// Negotiated numeric protocol version.
    pub version: u32,
    pub protocol: ProtocolVersion,
    total_difficulty: AtomicU64,
    height: AtomicU64,
}

impl ConnectedPeer {
    pub fn new(
        addr: SocketAddr,
        direction: Direction,
        capabilities: u32,
        user_agent: String,
        version: u32,
        total_difficulty: u64,
    ) -> Self {
        Self {
            addr,
            direction,
            capabilities,
            user_agent,
            version,
            protocol: ProtocolVersion::from_negotiated(version),
            total_difficulty: AtomicU64::new(total_difficulty),
            height: AtomicU64::new(0),
        }
    }

    pub fn update_totals(&self, total_difficulty: u64, height: u64) {
        self.total_difficulty
            .store(total_difficulty, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
    }

    pub fn total_difficulty(&self) -> u64 {
        self.total_difficulty.load(Ordering::Relaxed)
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }
}

struct SendQueue {
    inner: Mutex<VecDeque<(Vec<u8>, bool)>>,
    notify: Notify,
    cap: usize,
}

impl SendQueue {
    fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    /// Enqueues a frame. A full queue sheds the oldest gossip frame;
    /// critical frames are always admitted.
    fn push(&self, bytes: Vec<u8>, critical: bool) -> bool {
        let mut queue = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if queue.len() >= self.cap && !critical {
            let dropped = queue
                .iter()
                .position(|(_, queued_critical)| !queued_critical)
                .map(|idx| queue.remove(idx));
            if dropped.is_none() {
                // Nothing sheddable; drop the new gossip instead.
                return false;
            }
        }
        queue.push_back((bytes, critical));
        drop(queue);
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<Vec<u8>> {
        let mut queue = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.pop_front().map(|(bytes, _)| bytes)
    }
}

/// Handle to a running connection, held by the manager and the processor.
pub struct Connection {
    pub id: u64,
    pub peer: Arc<ConnectedPeer>,
    queue: Arc<SendQueue>,
    active: AtomicBool,
    disconnect: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("disconnect", &self.disconnect.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    pub fn new(id: u64, peer: ConnectedPeer, max_send_queue: usize) -> Self {
        Self {
            id,
            peer: Arc::new(peer),
            queue: Arc::new(SendQueue::new(max_send_queue)),
            active: AtomicBool::new(true),
            disconnect: AtomicBool::new(false),
        }
    }

    /// Enqueues a message; never blocks. Returns false when gossip was shed.
    pub fn send(&self, msg: &Message) -> bool {
        if !self.is_active() {
            return false;
        }
        let bytes = msg.encode(self.peer.protocol);
        self.queue.push(bytes, msg.is_critical())
    }

    /// Enqueues a message followed by a raw byte blob that must go out on
    /// the wire immediately after it (txhashset archives). Both are
    /// critical so ordering can never be broken by queue shedding.
    pub fn send_with_attachment(&self, msg: &Message, attachment: Vec<u8>) -> bool {
        if !self.is_active() {
            return false;
        }
        let bytes = msg.encode(self.peer.protocol);
        self.queue.push(bytes, true) && self.queue.push(attachment, true)
    }

    /// Idempotent; the run loop notices on its next iteration.
    pub fn disconnect(&self) {
        self.disconnect.store(true, Ordering::SeqCst);
        self.queue.notify.notify_one();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.disconnect.load(Ordering::SeqCst)
    }

    fn should_stop(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst)
    }
}

/// Why the connection loop ended; decides the ban policy.
enum LoopEnd {
    Closed,
    BadFrame,
    BadPayload,
    RateLimited,
}

/// Runs a connection to completion. Owns the link; spawns a writer task and
/// reads frames until close, error, or shutdown.
pub async fn run_connection(
    conn: Arc<Connection>,
    link: Box<dyn Link>,
    processor: Arc<MessageProcessor>,
    manager: Arc<ConnectionManager>,
    config: Arc<P2PConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = tokio::io::split(link);

    let writer_conn = Arc::clone(&conn);
    let mut writer_shutdown = shutdown.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_conn.queue.notify.notified() => {}
                _ = writer_shutdown.changed() => break,
            }
            while let Some(bytes) = writer_conn.queue.pop() {
                match timeout(SEND_TIMEOUT, write_frame(&mut writer, &bytes)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(peer = %writer_conn.peer.addr, "send failed: {err}");
                        writer_conn.disconnect();
                        return;
                    }
                    Err(_) => {
                        debug!(peer = %writer_conn.peer.addr, "send timed out");
                        writer_conn.disconnect();
                        return;
                    }
                }
            }
            if writer_conn.should_stop() {
                // Flush happened above; drop the socket.
                return;
            }
        }
    });

    let mut bucket = TokenBucket::new(config.rate_limit_msgs_per_sec, config.rate_limit_burst);
    let mut frames = FrameReader::new();
    let mut last_received = Instant::now();
    let mut last_ping = Instant::now();

    let end = loop {
        if conn.should_stop() || *shutdown.borrow() {
            break LoopEnd::Closed;
        }

        let frame = tokio::select! {
            frame = timeout(RECV_TIMEOUT, frames.next_frame(&mut reader)) => frame,
            _ = shutdown.changed() => break LoopEnd::Closed,
        };
        match frame {
            Err(_) => {
                // No complete frame inside the tick; idle bookkeeping.
                let idle = last_received.elapsed();
                if idle > IDLE_CLOSE {
                    debug!(peer = %conn.peer.addr, "idle for {}s, closing", idle.as_secs());
                    break LoopEnd::Closed;
                }
                if idle > PING_INTERVAL && last_ping.elapsed() > PING_INTERVAL {
                    last_ping = Instant::now();
                    conn.send(&processor.ping_message());
                }
            }
            Ok(Err(FrameError::Io(err))) => {
                debug!(peer = %conn.peer.addr, "socket closed: {err}");
                break LoopEnd::Closed;
            }
            Ok(Err(err)) => {
                warn!(peer = %conn.peer.addr, "bad frame: {err}");
                break LoopEnd::BadFrame;
            }
            Ok(Ok((header, payload))) => {
                last_received = Instant::now();
                if !bucket.allow() {
                    warn!(peer = %conn.peer.addr, "rate limit exceeded");
                    break LoopEnd::RateLimited;
                }
                let Some(msg_type) = header.msg_type else {
                    debug!(peer = %conn.peer.addr, msg_type = header.msg_type_raw, "unknown message type");
                    continue;
                };
                let msg = match Message::decode(msg_type, &payload, conn.peer.protocol) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(peer = %conn.peer.addr, ?msg_type, "bad payload: {err}");
                        break LoopEnd::BadPayload;
                    }
                };

                // The archive envelope is followed by raw bytes outside the
                // frame stream; pull them before the next frame.
                let msg = match msg {
                    Message::TxHashSetArchive {
                        hash,
                        height,
                        bytes,
                    } => {
                        if bytes > MAX_ARCHIVE_BYTES {
                            break LoopEnd::BadFrame;
                        }
                        match read_archive(&mut reader, bytes).await {
                            Ok(archive) => {
                                processor
                                    .process_archive(&conn, hash, height, archive)
                                    .await;
                                continue;
                            }
                            Err(err) => {
                                debug!(peer = %conn.peer.addr, "archive stream failed: {err}");
                                break LoopEnd::Closed;
                            }
                        }
                    }
                    other => other,
                };

                match processor.process(&conn, msg).await {
                    ProcessResult::Success
                    | ProcessResult::Syncing
                    | ProcessResult::NotFound
                    | ProcessResult::UnknownMessage => {}
                    ProcessResult::Disconnect => break LoopEnd::Closed,
                    ProcessResult::BanPeer(reason) => {
                        manager.ban(conn.peer.addr.ip(), reason);
                        break LoopEnd::Closed;
                    }
                }
            }
        }
    };

    match end {
        LoopEnd::Closed => {}
        LoopEnd::BadFrame | LoopEnd::BadPayload => {
            manager.ban(conn.peer.addr.ip(), BanReason::ManualBan);
        }
        LoopEnd::RateLimited => {
            manager.ban(conn.peer.addr.ip(), BanReason::ManualBan);
        }
    }

    conn.active.store(false, Ordering::SeqCst);
    conn.disconnect();
    manager.remove(conn.id);
    // Let the writer flush anything queued on the way out (ban reasons,
    // error notices) before the socket drops.
    let _ = timeout(Duration::from_secs(5), writer_task).await;
}

async fn read_archive<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u64,
) -> Result<Vec<u8>, std::io::Error> {
    let mut archive = Vec::with_capacity(len.min(16 * 1024 * 1024) as usize);
    let mut remaining = len;
    let mut chunk = vec![0u8; 256 * 1024];
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let read = timeout(SEND_TIMEOUT, reader.read(&mut chunk[..want]))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "archive stalled"))??;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "archive truncated",
            ));
        }
        archive.extend_from_slice(&chunk[..read]);
        remaining -= read as u64;
    }
    Ok(archive)
}
