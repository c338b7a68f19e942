use std::net::SocketAddr;
use std::sync::Arc;

use mwd_consensus::params::Network;
use mwd_node::config::P2PConfig;
use mwd_node::conn_manager::ConnectionManager;
use mwd_node::connection::{ConnectedPeer, Connection, Direction};
use mwd_node::msg::BanReason;
use mwd_node::peer_book::PeerBook;
use mwd_storage::memory::MemoryStore;

fn manager() -> Arc<ConnectionManager> {
    let store: Arc<dyn mwd_storage::KeyValueStore> = Arc::new(MemoryStore::new());
    let config = Arc::new(P2PConfig::for_network(Network::Testnet, [0u8; 32]));
    Arc::new(ConnectionManager::new(
        Arc::new(PeerBook::new(store)),
        config,
        1,
    ))
}

fn connection(manager: &ConnectionManager, addr: &str, total_difficulty: u64) -> Arc<Connection> {
    let addr: SocketAddr = addr.parse().expect("addr");
    Arc::new(Connection::new(
        manager.next_connection_id(),
        ConnectedPeer::new(
            addr,
            Direction::Outbound,
            0,
            String::new(),
            2,
            total_difficulty,
        ),
        16,
    ))
}

#[test]
fn at_most_one_connection_per_ip() {
    let manager = manager();
    let first = connection(&manager, "10.1.1.1:3414", 5);
    let second = connection(&manager, "10.1.1.1:9999", 6);
    let other_ip = connection(&manager, "10.1.1.2:3414", 7);

    manager.register(first).expect("first registers");
    assert!(manager.register(second).is_err());
    manager.register(other_ip).expect("different ip registers");
    assert_eq!(manager.count(), 2);
}

#[test]
fn removal_frees_the_ip() {
    let manager = manager();
    let first = connection(&manager, "10.2.2.2:3414", 5);
    let id = first.id;
    manager.register(first).expect("register");
    manager.remove(id);
    assert_eq!(manager.count(), 0);
    let again = connection(&manager, "10.2.2.2:3414", 5);
    manager.register(again).expect("ip reusable after removal");
}

#[test]
fn most_work_peer_requires_more_work_than_ours() {
    let manager = manager();
    manager
        .register(connection(&manager, "10.3.3.1:3414", 50))
        .expect("register");
    manager
        .register(connection(&manager, "10.3.3.2:3414", 80))
        .expect("register");

    let best = manager.most_work_peer(60).expect("peer above 60");
    assert_eq!(best.peer.total_difficulty(), 80);
    assert!(manager.most_work_peer(80).is_none());
}

#[test]
fn ban_marks_the_peer_book_and_disconnects() {
    let manager = manager();
    let conn = connection(&manager, "10.4.4.4:3414", 5);
    let ip = conn.peer.addr.ip();
    manager.register(Arc::clone(&conn)).expect("register");

    assert!(!manager.peer_book.is_banned(&ip));
    manager.ban(ip, BanReason::BadBlock);
    assert!(manager.peer_book.is_banned(&ip));
    assert!(!conn.is_active());
}
