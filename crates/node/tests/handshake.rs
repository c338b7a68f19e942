use std::net::SocketAddr;
use std::sync::Arc;

use mwd_consensus::params::Network;
use mwd_node::config::P2PConfig;
use mwd_node::conn_manager::ConnectionManager;
use mwd_node::handshake::{self, HandshakeError};
use mwd_node::peer_book::PeerBook;
use mwd_storage::memory::MemoryStore;

fn test_config(genesis: [u8; 32]) -> Arc<P2PConfig> {
    Arc::new(P2PConfig::for_network(Network::Testnet, genesis))
}

fn test_manager(config: &Arc<P2PConfig>, nonce: u64) -> Arc<ConnectionManager> {
    let store: Arc<dyn mwd_storage::KeyValueStore> = Arc::new(MemoryStore::new());
    Arc::new(ConnectionManager::new(
        Arc::new(PeerBook::new(store)),
        Arc::clone(config),
        nonce,
    ))
}

fn peer_addr(last: u8) -> SocketAddr {
    format!("127.0.0.{last}:3414").parse().expect("addr")
}

#[tokio::test]
async fn handshake_negotiates_min_version() {
    let config = test_config([9u8; 32]);
    let manager = test_manager(&config, 1);

    let (mut dial_side, mut accept_side) = tokio::io::duplex(64 * 1024);
    let accept_config = Arc::clone(&config);
    let accept_manager = Arc::clone(&manager);
    let inbound = tokio::spawn(async move {
        handshake::inbound(&mut accept_side, &accept_config, &accept_manager, peer_addr(2), 10)
            .await
    });
    let outbound = handshake::outbound(&mut dial_side, &config, 2, peer_addr(2), 42).await;

    let outbound = outbound.expect("outbound handshake");
    let inbound = inbound.await.expect("join").expect("inbound handshake");
    assert_eq!(outbound.version, config.protocol_version);
    assert_eq!(inbound.version, config.protocol_version);
    assert_eq!(inbound.total_difficulty, 42);
    assert_eq!(outbound.total_difficulty, 10);
}

#[tokio::test]
async fn self_connect_is_dropped_without_reply() {
    let config = test_config([9u8; 32]);
    let nonce = 777;
    let manager = test_manager(&config, nonce);

    let (mut dial_side, mut accept_side) = tokio::io::duplex(64 * 1024);
    let accept_config = Arc::clone(&config);
    let accept_manager = Arc::clone(&manager);
    let inbound = tokio::spawn(async move {
        handshake::inbound(&mut accept_side, &accept_config, &accept_manager, peer_addr(3), 0)
            .await
    });
    // Dialing our own listener: the Hand carries our own nonce.
    let outbound = handshake::outbound(&mut dial_side, &config, nonce, peer_addr(3), 0).await;

    match inbound.await.expect("join") {
        Err(HandshakeError::SelfConnect) => {}
        other => panic!("expected self-connect drop, got {other:?}"),
    }
    // No Shake ever arrives; the dialer times out or sees the pipe close.
    assert!(outbound.is_err());
    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn genesis_mismatch_is_refused() {
    let config_a = test_config([1u8; 32]);
    let config_b = test_config([2u8; 32]);
    let manager_b = test_manager(&config_b, 5);

    let (mut dial_side, mut accept_side) = tokio::io::duplex(64 * 1024);
    let inbound = tokio::spawn(async move {
        handshake::inbound(&mut accept_side, &config_b, &manager_b, peer_addr(4), 0).await
    });
    let _ = handshake::outbound(&mut dial_side, &config_a, 6, peer_addr(4), 0).await;
    match inbound.await.expect("join") {
        Err(HandshakeError::GenesisMismatch) => {}
        other => panic!("expected genesis mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_address_is_refused_at_handshake() {
    use mwd_node::connection::{ConnectedPeer, Connection, Direction};

    let config = test_config([9u8; 32]);
    let manager = test_manager(&config, 1);
    let addr = peer_addr(5);
    let existing = Arc::new(Connection::new(
        manager.next_connection_id(),
        ConnectedPeer::new(addr, Direction::Inbound, 0, String::new(), 2, 0),
        16,
    ));
    manager.register(existing).expect("register");

    let (mut dial_side, mut accept_side) = tokio::io::duplex(64 * 1024);
    let accept_config = Arc::clone(&config);
    let accept_manager = Arc::clone(&manager);
    let inbound = tokio::spawn(async move {
        handshake::inbound(&mut accept_side, &accept_config, &accept_manager, addr, 0).await
    });
    let _ = handshake::outbound(&mut dial_side, &config, 99, addr, 0).await;
    match inbound.await.expect("join") {
        Err(HandshakeError::AlreadyConnected) => {}
        other => panic!("expected duplicate refusal, got {other:?}"),
    }
    assert_eq!(manager.count(), 1);
}
