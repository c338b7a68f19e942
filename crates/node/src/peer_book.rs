//! Peer database: known addresses, capabilities, contact times, and bans,
//! keyed by IP and persisted through the storage trait.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mwd_primitives::{DecodeError, Decoder, Encoder, ProtocolVersion};
use mwd_storage::{Column, KeyValueStore, StoreError};
use rand::seq::SliceRandom;
use tracing::warn;

use crate::msg::BanReason;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn ip_key(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => {
            let mut key = vec![4u8];
            key.extend_from_slice(&v4.octets());
            key
        }
        IpAddr::V6(v6) => {
            let mut key = vec![6u8];
            key.extend_from_slice(&v6.octets());
            key
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub capabilities: u32,
    pub user_agent: String,
    pub last_seen_secs: u64,
    pub banned_until_secs: u64,
    pub ban_reason: BanReason,
    pub last_txhashset_request_secs: u64,
}

impl PeerInfo {
    pub fn fresh(addr: SocketAddr) -> Self {
        Self {
            addr,
            capabilities: 0,
            user_agent: String::new(),
            last_seen_secs: 0,
            banned_until_secs: 0,
            ban_reason: BanReason::None,
            last_txhashset_request_secs: 0,
        }
    }

    fn serialized(&self) -> Vec<u8> {
        let mut encoder = Encoder::new(ProtocolVersion::V2);
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                encoder.write_u8(4);
                encoder.write_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                encoder.write_u8(6);
                encoder.write_bytes(&ip.octets());
            }
        }
        encoder.write_u16(self.addr.port());
        encoder.write_u32(self.capabilities);
        encoder.write_var_str(&self.user_agent);
        encoder.write_u64(self.last_seen_secs);
        encoder.write_u64(self.banned_until_secs);
        encoder.write_u32(self.ban_reason.as_u32());
        encoder.write_u64(self.last_txhashset_request_secs);
        encoder.into_inner()
    }

    fn read(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes, ProtocolVersion::V2);
        let ip = match decoder.read_u8()? {
            4 => IpAddr::from(decoder.read_fixed::<4>()?),
            6 => IpAddr::from(decoder.read_fixed::<16>()?),
            other => return Err(DecodeError::UnsupportedVariant(other)),
        };
        let port = decoder.read_u16()?;
        let capabilities = decoder.read_u32()?;
        let user_agent = decoder.read_var_str(256)?;
        let last_seen_secs = decoder.read_u64()?;
        let banned_until_secs = decoder.read_u64()?;
        let ban_reason = BanReason::from_u32(decoder.read_u32()?);
        let last_txhashset_request_secs = decoder.read_u64()?;
        decoder.expect_empty()?;
        Ok(Self {
            addr: SocketAddr::new(ip, port),
            capabilities,
            user_agent,
            last_seen_secs,
            banned_until_secs,
            ban_reason,
            last_txhashset_request_secs,
        })
    }
}

pub struct PeerBook {
    store: Arc<dyn KeyValueStore>,
}

impl PeerBook {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, ip: &IpAddr) -> Option<PeerInfo> {
        match self.store.get(Column::Peer, &ip_key(ip)) {
            Ok(Some(bytes)) => PeerInfo::read(&bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!("peer book read failed: {err}");
                None
            }
        }
    }

    fn put(&self, info: &PeerInfo) -> Result<(), StoreError> {
        self.store
            .put(Column::Peer, &ip_key(&info.addr.ip()), &info.serialized())
    }

    /// Adds gossiped addresses as fresh candidates, never overwriting known
    /// peers.
    pub fn add_fresh_peers(&self, addrs: &[SocketAddr]) -> usize {
        let mut inserted = 0;
        for addr in addrs {
            if addr.ip().is_unspecified() || addr.ip().is_loopback() {
                continue;
            }
            if self.get(&addr.ip()).is_none() && self.put(&PeerInfo::fresh(*addr)).is_ok() {
                inserted += 1;
            }
        }
        inserted
    }

    pub fn record_contact(&self, addr: SocketAddr, capabilities: u32, user_agent: &str) {
        let mut info = self
            .get(&addr.ip())
            .unwrap_or_else(|| PeerInfo::fresh(addr));
        info.addr = addr;
        info.capabilities = capabilities;
        info.user_agent = user_agent.to_string();
        info.last_seen_secs = now_secs();
        if let Err(err) = self.put(&info) {
            warn!("peer book write failed: {err}");
        }
    }

    pub fn ban(&self, ip: IpAddr, reason: BanReason, window_secs: u64) {
        let mut info = self
            .get(&ip)
            .unwrap_or_else(|| PeerInfo::fresh(SocketAddr::new(ip, 0)));
        info.banned_until_secs = now_secs().saturating_add(window_secs);
        info.ban_reason = reason;
        if let Err(err) = self.put(&info) {
            warn!("peer book ban write failed: {err}");
        }
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.get(ip)
            .map(|info| info.banned_until_secs > now_secs())
            .unwrap_or(false)
    }

    /// Up to `limit` non-banned peers matching every bit of `capabilities`.
    pub fn sample(&self, capabilities: u32, limit: usize) -> Vec<SocketAddr> {
        let entries = match self.store.scan_prefix(Column::Peer, &[]) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("peer book scan failed: {err}");
                return Vec::new();
            }
        };
        let now = now_secs();
        let mut out: Vec<SocketAddr> = entries
            .iter()
            .filter_map(|(_, bytes)| PeerInfo::read(bytes).ok())
            .filter(|info| info.banned_until_secs <= now)
            .filter(|info| info.capabilities & capabilities == capabilities)
            .filter(|info| info.addr.port() != 0)
            .map(|info| info.addr)
            .collect();
        out.shuffle(&mut rand::thread_rng());
        out.truncate(limit);
        out
    }

    /// Gate for txhashset snapshot serving: at most one request per peer per
    /// cooldown window. Updates the timestamp when the request is allowed.
    pub fn txhashset_request_allowed(&self, ip: &IpAddr, cooldown_secs: u64) -> bool {
        let now = now_secs();
        let mut info = self
            .get(ip)
            .unwrap_or_else(|| PeerInfo::fresh(SocketAddr::new(*ip, 0)));
        if info.last_txhashset_request_secs.saturating_add(cooldown_secs) > now {
            return false;
        }
        info.last_txhashset_request_secs = now;
        if let Err(err) = self.put(&info) {
            warn!("peer book write failed: {err}");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mwd_storage::memory::MemoryStore;

    fn book() -> PeerBook {
        PeerBook::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn second_txhashset_request_inside_cooldown_is_refused() {
        let book = book();
        let ip: IpAddr = "10.9.9.9".parse().expect("ip");
        assert!(book.txhashset_request_allowed(&ip, 7_200));
        assert!(!book.txhashset_request_allowed(&ip, 7_200));
        // A zero cooldown never refuses.
        assert!(book.txhashset_request_allowed(&ip, 0));
    }

    #[test]
    fn ban_expires_with_its_window() {
        let book = book();
        let ip: IpAddr = "10.8.8.8".parse().expect("ip");
        book.ban(ip, BanReason::BadBlock, 60);
        assert!(book.is_banned(&ip));
        book.ban(ip, BanReason::BadBlock, 0);
        assert!(!book.is_banned(&ip));
    }

    #[test]
    fn sample_filters_banned_and_capability_mismatch() {
        let book = book();
        let good: SocketAddr = "10.7.7.1:3414".parse().expect("addr");
        let banned: SocketAddr = "10.7.7.2:3414".parse().expect("addr");
        book.add_fresh_peers(&[good, banned]);
        book.record_contact(good, 0b111, "ua");
        book.record_contact(banned, 0b111, "ua");
        book.ban(banned.ip(), BanReason::ManualBan, 3_600);

        let sampled = book.sample(0b101, 10);
        assert_eq!(sampled, vec![good]);
        assert!(book.sample(0b1000, 10).is_empty());
    }
}
