//! Hand/Shake exchange performed on a raw link before a connection joins
//! the table.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mwd_primitives::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

use crate::config::P2PConfig;
use crate::conn_manager::ConnectionManager;
use crate::msg::{
    capabilities, read_frame, write_frame, BanReason, Hand, Message, MsgType, Shake,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug)]
pub enum HandshakeError {
    Io(std::io::Error),
    /// Bad frame or undecodable payload.
    Malformed,
    /// First message was not the one the protocol requires.
    UnexpectedMessage(Option<MsgType>),
    /// The peer is us.
    SelfConnect,
    /// Another live connection already exists for this IP.
    AlreadyConnected,
    /// The peer follows a different chain.
    GenesisMismatch,
    /// The peer told us we are banned.
    Banned(BanReason),
    TimedOut,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Io(err) => write!(f, "{err}"),
            HandshakeError::Malformed => write!(f, "malformed handshake"),
            HandshakeError::UnexpectedMessage(msg_type) => {
                write!(f, "unexpected handshake message {msg_type:?}")
            }
            HandshakeError::SelfConnect => write!(f, "connected to self"),
            HandshakeError::AlreadyConnected => write!(f, "already connected to this address"),
            HandshakeError::GenesisMismatch => write!(f, "different genesis"),
            HandshakeError::Banned(reason) => write!(f, "peer banned us: {reason}"),
            HandshakeError::TimedOut => write!(f, "handshake timed out"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        HandshakeError::Io(err)
    }
}

/// What the exchange learned about the peer.
#[derive(Debug)]
pub struct PeerSession {
    pub capabilities: u32,
    pub user_agent: String,
    /// Negotiated numeric version: `min(ours, theirs)`.
    pub version: u32,
    pub total_difficulty: u64,
}

async fn read_handshake_frame<L: AsyncRead + Unpin>(
    link: &mut L,
) -> Result<Message, HandshakeError> {
    let (header, payload) = match timeout(HANDSHAKE_TIMEOUT, read_frame(link)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(crate::msg::FrameError::Io(err))) => return Err(HandshakeError::Io(err)),
        Ok(Err(_)) => return Err(HandshakeError::Malformed),
        Err(_) => return Err(HandshakeError::TimedOut),
    };
    let msg_type = header
        .msg_type
        .ok_or(HandshakeError::UnexpectedMessage(None))?;
    // Handshake messages predate negotiation; they are V1-stable.
    Message::decode(msg_type, &payload, ProtocolVersion::V1)
        .map_err(|_| HandshakeError::Malformed)
}

async fn send<L: AsyncWrite + Unpin>(link: &mut L, msg: &Message) -> Result<(), HandshakeError> {
    match timeout(
        HANDSHAKE_TIMEOUT,
        write_frame(link, &msg.encode(ProtocolVersion::V1)),
    )
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(crate::msg::FrameError::Io(err))) => Err(HandshakeError::Io(err)),
        Ok(Err(_)) => Err(HandshakeError::Malformed),
        Err(_) => Err(HandshakeError::TimedOut),
    }
}

/// Dial side: send Hand, expect Shake. A BanReason reply is surfaced with
/// its reason.
pub async fn outbound<L: AsyncRead + AsyncWrite + Unpin>(
    link: &mut L,
    config: &Arc<P2PConfig>,
    nonce: u64,
    peer_addr: SocketAddr,
    our_total_difficulty: u64,
) -> Result<PeerSession, HandshakeError> {
    let sender_addr = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        config.p2p_port,
    );
    let hand = Message::Hand(Hand {
        version: config.protocol_version,
        capabilities: capabilities::FULL_NODE,
        nonce,
        total_difficulty: our_total_difficulty,
        sender_addr,
        receiver_addr: peer_addr,
        user_agent: config.user_agent.clone(),
        genesis: config.genesis_hash,
    });
    send(link, &hand).await?;

    match read_handshake_frame(link).await? {
        Message::Shake(shake) => {
            if shake.genesis != config.genesis_hash {
                return Err(HandshakeError::GenesisMismatch);
            }
            Ok(PeerSession {
                capabilities: shake.capabilities,
                user_agent: shake.user_agent,
                version: config.protocol_version.min(shake.version),
                total_difficulty: shake.total_difficulty,
            })
        }
        Message::BanReason { reason } => {
            debug!(peer = %peer_addr, %reason, "ban reason during handshake");
            Err(HandshakeError::Banned(reason))
        }
        other => Err(HandshakeError::UnexpectedMessage(Some(other.msg_type()))),
    }
}

/// Accept side: read Hand, check self-connect and duplicate address, reply
/// Shake with the negotiated version.
pub async fn inbound<L: AsyncRead + AsyncWrite + Unpin>(
    link: &mut L,
    config: &Arc<P2PConfig>,
    manager: &ConnectionManager,
    peer_addr: SocketAddr,
    our_total_difficulty: u64,
) -> Result<PeerSession, HandshakeError> {
    let hand = match read_handshake_frame(link).await? {
        Message::Hand(hand) => hand,
        other => return Err(HandshakeError::UnexpectedMessage(Some(other.msg_type()))),
    };
    if hand.nonce == manager.nonce {
        // Dialed our own listening port; drop without replying.
        return Err(HandshakeError::SelfConnect);
    }
    if manager.is_connected(&peer_addr.ip()) {
        return Err(HandshakeError::AlreadyConnected);
    }
    if hand.genesis != config.genesis_hash {
        return Err(HandshakeError::GenesisMismatch);
    }

    let version = config.protocol_version.min(hand.version);
    let shake = Message::Shake(Shake {
        version,
        capabilities: capabilities::FULL_NODE,
        total_difficulty: our_total_difficulty,
        user_agent: config.user_agent.clone(),
        genesis: config.genesis_hash,
    });
    send(link, &shake).await?;

    Ok(PeerSession {
        capabilities: hand.capabilities,
        user_agent: hand.user_agent,
        version,
        total_difficulty: hand.total_difficulty,
    })
}
