//! Connection table: at most one live connection per peer IP, broadcast,
//! bans, and most-work selection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::config::P2PConfig;
use crate::connection::Connection;
use crate::msg::{BanReason, Message};
use crate::peer_book::PeerBook;

pub struct ConnectionManager {
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    by_ip: RwLock<HashMap<IpAddr, u64>>,
    next_id: AtomicU64,
    pub peer_book: Arc<PeerBook>,
    config: Arc<P2PConfig>,
    /// Process-wide handshake nonce for self-connect detection, generated
    /// once at startup.
    pub nonce: u64,
}

impl ConnectionManager {
    pub fn new(peer_book: Arc<PeerBook>, config: Arc<P2PConfig>, nonce: u64) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            by_ip: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            peer_book,
            config,
            nonce,
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_connected(&self, ip: &IpAddr) -> bool {
        self.by_ip
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(ip)
    }

    pub fn count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Inserts a freshly handshaken connection. Refuses a second connection
    /// from the same IP.
    pub fn register(&self, conn: Arc<Connection>) -> Result<(), Arc<Connection>> {
        let ip = conn.peer.addr.ip();
        let mut by_ip = self
            .by_ip
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if by_ip.contains_key(&ip) {
            return Err(conn);
        }
        by_ip.insert(ip, conn.id);
        drop(by_ip);
        self.connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(conn.id, conn);
        Ok(())
    }

    pub fn remove(&self, id: u64) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        if let Some(conn) = removed {
            let mut by_ip = self
                .by_ip
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if by_ip.get(&conn.peer.addr.ip()) == Some(&id) {
                by_ip.remove(&conn.peer.addr.ip());
            }
            debug!(peer = %conn.peer.addr, id, "connection removed");
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Fans a message out to every active connection except `except_id`.
    /// FIFO per connection, unordered across connections.
    pub fn broadcast(&self, msg: &Message, except_id: Option<u64>) {
        for conn in self.snapshot() {
            if Some(conn.id) == except_id || !conn.is_active() {
                continue;
            }
            conn.send(msg);
        }
    }

    /// Bans the IP: best-effort BanReason to a live connection, close it,
    /// and mark the peer DB for the ban window.
    pub fn ban(&self, ip: IpAddr, reason: BanReason) {
        info!(%ip, %reason, "banning peer");
        self.peer_book
            .ban(ip, reason, self.config.ban_window_secs);
        let id = self
            .by_ip
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&ip)
            .copied();
        if let Some(id) = id {
            if let Some(conn) = self.get(id) {
                conn.send(&Message::BanReason { reason });
                conn.disconnect();
            }
        }
    }

    /// Active peer with the highest advertised total difficulty above ours.
    pub fn most_work_peer(&self, our_total_difficulty: u64) -> Option<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|conn| conn.is_active())
            .filter(|conn| conn.peer.total_difficulty() > our_total_difficulty)
            .max_by_key(|conn| conn.peer.total_difficulty())
    }

    /// Closes every connection; used at shutdown.
    pub fn close_all(&self) {
        for conn in self.snapshot() {
            conn.send(&Message::Error {
                reason: "shutting down".to_string(),
            });
            conn.disconnect();
        }
    }
}
