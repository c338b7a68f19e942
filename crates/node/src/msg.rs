//! Wire frames and message payloads.
//!
//! Every frame is `magic[2] | type[1] | len[8] | payload[len]`, big-endian.
//! Payload layouts depend on the negotiated protocol version only where the
//! underlying types do (kernels). An unknown type is not a codec error; the
//! processor decides what to do with it.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use mwd_consensus::constants::{MAX_HEADERS_PER_MSG, MAX_LOCATOR_SIZE, MAX_PEER_ADDRS};
use mwd_consensus::Hash256;
use mwd_primitives::{
    Block, BlockHeader, CompactBlock, DecodeError, Decoder, Encoder, ProtocolVersion, Transaction,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: [u8; 2] = [0x1E, 0xC5];
pub const FRAME_HEADER_SIZE: usize = 11;

/// Peer capability bits advertised in Hand/Shake and GetPeerAddrs.
pub mod capabilities {
    pub const UNKNOWN: u32 = 0;
    /// Can serve the full header history.
    pub const HEADER_HIST: u32 = 1;
    /// Can serve txhashset snapshots.
    pub const TXHASHSET_HIST: u32 = 1 << 1;
    /// Can gossip peer addresses.
    pub const PEER_LIST: u32 = 1 << 2;
    pub const FULL_NODE: u32 = HEADER_HIST | TXHASHSET_HIST | PEER_LIST;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MsgType {
    Error = 0,
    Hand = 1,
    Shake = 2,
    Ping = 3,
    Pong = 4,
    GetPeerAddrs = 5,
    PeerAddrs = 6,
    GetHeaders = 7,
    Header = 8,
    Headers = 9,
    GetBlock = 10,
    Block = 11,
    GetCompactBlock = 12,
    CompactBlock = 13,
    StemTransaction = 14,
    Transaction = 15,
    TxHashSetRequest = 16,
    TxHashSetArchive = 17,
    BanReason = 18,
    GetTransaction = 19,
    TransactionKernel = 20,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MsgType::Error),
            1 => Some(MsgType::Hand),
            2 => Some(MsgType::Shake),
            3 => Some(MsgType::Ping),
            4 => Some(MsgType::Pong),
            5 => Some(MsgType::GetPeerAddrs),
            6 => Some(MsgType::PeerAddrs),
            7 => Some(MsgType::GetHeaders),
            8 => Some(MsgType::Header),
            9 => Some(MsgType::Headers),
            10 => Some(MsgType::GetBlock),
            11 => Some(MsgType::Block),
            12 => Some(MsgType::GetCompactBlock),
            13 => Some(MsgType::CompactBlock),
            14 => Some(MsgType::StemTransaction),
            15 => Some(MsgType::Transaction),
            16 => Some(MsgType::TxHashSetRequest),
            17 => Some(MsgType::TxHashSetArchive),
            18 => Some(MsgType::BanReason),
            19 => Some(MsgType::GetTransaction),
            20 => Some(MsgType::TransactionKernel),
            _ => None,
        }
    }
}

/// Per-type payload caps; anything larger is a bad frame.
pub fn max_msg_len(msg_type: Option<MsgType>) -> u64 {
    match msg_type {
        Some(MsgType::Error) => 1_024,
        Some(MsgType::Hand) | Some(MsgType::Shake) => 1_024,
        Some(MsgType::Ping) | Some(MsgType::Pong) => 16,
        Some(MsgType::GetPeerAddrs) => 4,
        Some(MsgType::PeerAddrs) => 64 * 1_024,
        Some(MsgType::GetHeaders) => 1_024,
        Some(MsgType::Header) => 32 * 1_024,
        Some(MsgType::Headers) => 16 * 1_024 * 1_024,
        Some(MsgType::GetBlock) | Some(MsgType::GetCompactBlock) => 32,
        Some(MsgType::Block) => 16 * 1_024 * 1_024,
        Some(MsgType::CompactBlock) => 2 * 1_024 * 1_024,
        Some(MsgType::StemTransaction) | Some(MsgType::Transaction) => 4 * 1_024 * 1_024,
        Some(MsgType::TxHashSetRequest) => 40,
        Some(MsgType::TxHashSetArchive) => 64,
        Some(MsgType::BanReason) => 4,
        Some(MsgType::GetTransaction) | Some(MsgType::TransactionKernel) => 32,
        // Unknown types are skipped, but still bounded.
        None => 1_024 * 1_024,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BanReason {
    None,
    BadBlock,
    BadCompactBlock,
    BadBlockHeader,
    BadTxHashSet,
    ManualBan,
    /// Advertised work the peer could not substantiate within sync timeouts.
    FraudHeight,
    BadHandshake,
}

impl BanReason {
    pub fn as_u32(self) -> u32 {
        match self {
            BanReason::None => 0,
            BanReason::BadBlock => 1,
            BanReason::BadCompactBlock => 2,
            BanReason::BadBlockHeader => 3,
            BanReason::BadTxHashSet => 4,
            BanReason::ManualBan => 5,
            BanReason::FraudHeight => 6,
            BanReason::BadHandshake => 7,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => BanReason::BadBlock,
            2 => BanReason::BadCompactBlock,
            3 => BanReason::BadBlockHeader,
            4 => BanReason::BadTxHashSet,
            5 => BanReason::ManualBan,
            6 => BanReason::FraudHeight,
            7 => BanReason::BadHandshake,
            _ => BanReason::None,
        }
    }
}

impl fmt::Display for BanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BanReason::None => "none",
            BanReason::BadBlock => "bad block",
            BanReason::BadCompactBlock => "bad compact block",
            BanReason::BadBlockHeader => "bad block header",
            BanReason::BadTxHashSet => "bad txhashset",
            BanReason::ManualBan => "manual ban",
            BanReason::FraudHeight => "fraud height",
            BanReason::BadHandshake => "bad handshake",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Hand {
    pub version: u32,
    pub capabilities: u32,
    pub nonce: u64,
    pub total_difficulty: u64,
    pub sender_addr: SocketAddr,
    pub receiver_addr: SocketAddr,
    pub user_agent: String,
    pub genesis: Hash256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Shake {
    pub version: u32,
    pub capabilities: u32,
    pub total_difficulty: u64,
    pub user_agent: String,
    pub genesis: Hash256,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Error { reason: String },
    Hand(Hand),
    Shake(Shake),
    Ping { total_difficulty: u64, height: u64 },
    Pong { total_difficulty: u64, height: u64 },
    GetPeerAddrs { capabilities: u32 },
    PeerAddrs { peers: Vec<SocketAddr> },
    GetHeaders { locator: Vec<Hash256> },
    Header(Box<BlockHeader>),
    Headers(Vec<BlockHeader>),
    GetBlock { hash: Hash256 },
    Block(Box<Block>),
    GetCompactBlock { hash: Hash256 },
    CompactBlock(Box<CompactBlock>),
    StemTransaction(Box<Transaction>),
    Transaction(Box<Transaction>),
    TxHashSetRequest { hash: Hash256, height: u64 },
    /// Envelope only; `bytes` of raw archive follow outside the framing.
    TxHashSetArchive { hash: Hash256, height: u64, bytes: u64 },
    BanReason { reason: BanReason },
    GetTransaction { kernel_hash: Hash256 },
    TransactionKernel { kernel_hash: Hash256 },
}

fn write_sock_addr(encoder: &mut Encoder, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            encoder.write_u8(0);
            encoder.write_bytes(&ip.octets());
        }
        IpAddr::V6(ip) => {
            encoder.write_u8(1);
            encoder.write_bytes(&ip.octets());
        }
    }
    encoder.write_u16(addr.port());
}

fn read_sock_addr(decoder: &mut Decoder<'_>) -> Result<SocketAddr, DecodeError> {
    let family = decoder.read_u8()?;
    let ip = match family {
        0 => IpAddr::from(decoder.read_fixed::<4>()?),
        1 => IpAddr::from(decoder.read_fixed::<16>()?),
        other => return Err(DecodeError::UnsupportedVariant(other)),
    };
    let port = decoder.read_u16()?;
    Ok(SocketAddr::new(ip, port))
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Error { .. } => MsgType::Error,
            Message::Hand(_) => MsgType::Hand,
            Message::Shake(_) => MsgType::Shake,
            Message::Ping { .. } => MsgType::Ping,
            Message::Pong { .. } => MsgType::Pong,
            Message::GetPeerAddrs { .. } => MsgType::GetPeerAddrs,
            Message::PeerAddrs { .. } => MsgType::PeerAddrs,
            Message::GetHeaders { .. } => MsgType::GetHeaders,
            Message::Header(_) => MsgType::Header,
            Message::Headers(_) => MsgType::Headers,
            Message::GetBlock { .. } => MsgType::GetBlock,
            Message::Block(_) => MsgType::Block,
            Message::GetCompactBlock { .. } => MsgType::GetCompactBlock,
            Message::CompactBlock(_) => MsgType::CompactBlock,
            Message::StemTransaction(_) => MsgType::StemTransaction,
            Message::Transaction(_) => MsgType::Transaction,
            Message::TxHashSetRequest { .. } => MsgType::TxHashSetRequest,
            Message::TxHashSetArchive { .. } => MsgType::TxHashSetArchive,
            Message::BanReason { .. } => MsgType::BanReason,
            Message::GetTransaction { .. } => MsgType::GetTransaction,
            Message::TransactionKernel { .. } => MsgType::TransactionKernel,
        }
    }

    /// True for messages that may never be dropped from a full send queue.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Message::Hand(_)
                | Message::Shake(_)
                | Message::Pong { .. }
                | Message::BanReason { .. }
                | Message::Error { .. }
        )
    }

    fn write_payload(&self, encoder: &mut Encoder) {
        match self {
            Message::Error { reason } => encoder.write_var_str(reason),
            Message::Hand(hand) => {
                encoder.write_u32(hand.version);
                encoder.write_u32(hand.capabilities);
                encoder.write_u64(hand.nonce);
                encoder.write_u64(hand.total_difficulty);
                write_sock_addr(encoder, &hand.sender_addr);
                write_sock_addr(encoder, &hand.receiver_addr);
                encoder.write_var_str(&hand.user_agent);
                encoder.write_bytes(&hand.genesis);
            }
            Message::Shake(shake) => {
                encoder.write_u32(shake.version);
                encoder.write_u32(shake.capabilities);
                encoder.write_u64(shake.total_difficulty);
                encoder.write_var_str(&shake.user_agent);
                encoder.write_bytes(&shake.genesis);
            }
            Message::Ping {
                total_difficulty,
                height,
            }
            | Message::Pong {
                total_difficulty,
                height,
            } => {
                encoder.write_u64(*total_difficulty);
                encoder.write_u64(*height);
            }
            Message::GetPeerAddrs { capabilities } => encoder.write_u32(*capabilities),
            Message::PeerAddrs { peers } => {
                encoder.write_u32(peers.len() as u32);
                for peer in peers {
                    write_sock_addr(encoder, peer);
                }
            }
            Message::GetHeaders { locator } => {
                encoder.write_u8(locator.len() as u8);
                for hash in locator {
                    encoder.write_bytes(hash);
                }
            }
            Message::Header(header) => header.write(encoder),
            Message::Headers(headers) => {
                encoder.write_u16(headers.len() as u16);
                for header in headers {
                    header.write(encoder);
                }
            }
            Message::GetBlock { hash } | Message::GetCompactBlock { hash } => {
                encoder.write_bytes(hash)
            }
            Message::Block(block) => block.write(encoder),
            Message::CompactBlock(cb) => cb.write(encoder),
            Message::StemTransaction(tx) | Message::Transaction(tx) => tx.write(encoder),
            Message::TxHashSetRequest { hash, height } => {
                encoder.write_bytes(hash);
                encoder.write_u64(*height);
            }
            Message::TxHashSetArchive {
                hash,
                height,
                bytes,
            } => {
                encoder.write_bytes(hash);
                encoder.write_u64(*height);
                encoder.write_u64(*bytes);
            }
            Message::BanReason { reason } => encoder.write_u32(reason.as_u32()),
            Message::GetTransaction { kernel_hash }
            | Message::TransactionKernel { kernel_hash } => encoder.write_bytes(kernel_hash),
        }
    }

    pub fn read_payload(
        msg_type: MsgType,
        decoder: &mut Decoder<'_>,
    ) -> Result<Message, DecodeError> {
        let msg = match msg_type {
            MsgType::Error => Message::Error {
                reason: decoder.read_var_str(1_024)?,
            },
            MsgType::Hand => Message::Hand(Hand {
                version: decoder.read_u32()?,
                capabilities: decoder.read_u32()?,
                nonce: decoder.read_u64()?,
                total_difficulty: decoder.read_u64()?,
                sender_addr: read_sock_addr(decoder)?,
                receiver_addr: read_sock_addr(decoder)?,
                user_agent: decoder.read_var_str(256)?,
                genesis: decoder.read_fixed::<32>()?,
            }),
            MsgType::Shake => Message::Shake(Shake {
                version: decoder.read_u32()?,
                capabilities: decoder.read_u32()?,
                total_difficulty: decoder.read_u64()?,
                user_agent: decoder.read_var_str(256)?,
                genesis: decoder.read_fixed::<32>()?,
            }),
            MsgType::Ping => Message::Ping {
                total_difficulty: decoder.read_u64()?,
                height: decoder.read_u64()?,
            },
            MsgType::Pong => Message::Pong {
                total_difficulty: decoder.read_u64()?,
                height: decoder.read_u64()?,
            },
            MsgType::GetPeerAddrs => Message::GetPeerAddrs {
                capabilities: decoder.read_u32()?,
            },
            MsgType::PeerAddrs => {
                let count = decoder.read_u32()? as usize;
                if count > MAX_PEER_ADDRS {
                    return Err(DecodeError::CountTooLarge);
                }
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    peers.push(read_sock_addr(decoder)?);
                }
                Message::PeerAddrs { peers }
            }
            MsgType::GetHeaders => {
                let count = decoder.read_u8()? as usize;
                if count > MAX_LOCATOR_SIZE {
                    return Err(DecodeError::CountTooLarge);
                }
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(decoder.read_fixed::<32>()?);
                }
                Message::GetHeaders { locator }
            }
            MsgType::Header => Message::Header(Box::new(BlockHeader::read(decoder)?)),
            MsgType::Headers => {
                let count = decoder.read_u16()? as usize;
                if count > MAX_HEADERS_PER_MSG {
                    return Err(DecodeError::CountTooLarge);
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::read(decoder)?);
                }
                Message::Headers(headers)
            }
            MsgType::GetBlock => Message::GetBlock {
                hash: decoder.read_fixed::<32>()?,
            },
            MsgType::Block => Message::Block(Box::new(Block::read(decoder)?)),
            MsgType::GetCompactBlock => Message::GetCompactBlock {
                hash: decoder.read_fixed::<32>()?,
            },
            MsgType::CompactBlock => Message::CompactBlock(Box::new(CompactBlock::read(decoder)?)),
            MsgType::StemTransaction => {
                Message::StemTransaction(Box::new(Transaction::read(decoder)?))
            }
            MsgType::Transaction => Message::Transaction(Box::new(Transaction::read(decoder)?)),
            MsgType::TxHashSetRequest => Message::TxHashSetRequest {
                hash: decoder.read_fixed::<32>()?,
                height: decoder.read_u64()?,
            },
            MsgType::TxHashSetArchive => Message::TxHashSetArchive {
                hash: decoder.read_fixed::<32>()?,
                height: decoder.read_u64()?,
                bytes: decoder.read_u64()?,
            },
            MsgType::BanReason => Message::BanReason {
                reason: BanReason::from_u32(decoder.read_u32()?),
            },
            MsgType::GetTransaction => Message::GetTransaction {
                kernel_hash: decoder.read_fixed::<32>()?,
            },
            MsgType::TransactionKernel => Message::TransactionKernel {
                kernel_hash: decoder.read_fixed::<32>()?,
            },
        };
        decoder.expect_empty()?;
        Ok(msg)
    }

    /// Serializes the full frame: header plus payload.
    pub fn encode(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut payload = Encoder::new(version);
        self.write_payload(&mut payload);
        let payload = payload.into_inner();

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&MAGIC);
        frame.push(self.msg_type() as u8);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    pub fn decode(
        msg_type: MsgType,
        payload: &[u8],
        version: ProtocolVersion,
    ) -> Result<Message, DecodeError> {
        let mut decoder = Decoder::new(payload, version);
        Self::read_payload(msg_type, &mut decoder)
    }
}

#[derive(Debug)]
pub enum FrameError {
    BadMagic,
    LengthExceeded { msg_type: u8, len: u64 },
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BadMagic => write!(f, "bad frame magic"),
            FrameError::LengthExceeded { msg_type, len } => {
                write!(f, "frame length {len} exceeds cap for type {msg_type}")
            }
            FrameError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// A parsed frame header.
#[derive(Clone, Copy, Debug)]
pub struct MsgHeader {
    pub msg_type_raw: u8,
    pub msg_type: Option<MsgType>,
    pub len: u64,
}

impl MsgHeader {
    pub fn parse(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, FrameError> {
        if bytes[0..2] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        let msg_type_raw = bytes[2];
        let msg_type = MsgType::from_u8(msg_type_raw);
        let len = u64::from_be_bytes(bytes[3..11].try_into().expect("8 bytes"));
        if len > max_msg_len(msg_type) {
            return Err(FrameError::LengthExceeded {
                msg_type: msg_type_raw,
                len,
            });
        }
        Ok(Self {
            msg_type_raw,
            msg_type,
            len,
        })
    }
}

/// Reads one frame header and its payload. Not cancellation-safe; used
/// where the whole exchange sits under one timeout (handshake).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(MsgHeader, Vec<u8>), FrameError> {
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = MsgHeader::parse(&header_bytes)?;
    let mut payload = vec![0u8; header.len as usize];
    reader.read_exact(&mut payload).await?;
    Ok((header, payload))
}

/// Incremental frame reader that survives cancellation: partial bytes stay
/// buffered, so the read loop can wrap `next_frame` in short timeouts
/// without ever desynchronizing the stream.
pub struct FrameReader {
    header_buf: [u8; FRAME_HEADER_SIZE],
    header_have: usize,
    header: Option<MsgHeader>,
    payload: Vec<u8>,
    payload_have: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            header_buf: [0u8; FRAME_HEADER_SIZE],
            header_have: 0,
            header: None,
            payload: Vec::new(),
            payload_have: 0,
        }
    }

    /// Drives the current frame to completion.
    pub async fn next_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<(MsgHeader, Vec<u8>), FrameError> {
        loop {
            match self.header {
                None => {
                    let n = reader.read(&mut self.header_buf[self.header_have..]).await?;
                    if n == 0 {
                        return Err(FrameError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed",
                        )));
                    }
                    self.header_have += n;
                    if self.header_have == FRAME_HEADER_SIZE {
                        let header = MsgHeader::parse(&self.header_buf)?;
                        self.header_have = 0;
                        self.payload = vec![0u8; header.len as usize];
                        self.payload_have = 0;
                        self.header = Some(header);
                    }
                }
                Some(header) => {
                    if self.payload_have == self.payload.len() {
                        self.header = None;
                        return Ok((header, std::mem::take(&mut self.payload)));
                    }
                    let n = reader.read(&mut self.payload[self.payload_have..]).await?;
                    if n == 0 {
                        return Err(FrameError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed mid-frame",
                        )));
                    }
                    self.payload_have += n;
                }
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
