use std::net::SocketAddr;

use mwd_consensus::constants::{EDGEBITS, PROOFSIZE};
use mwd_node::msg::{
    capabilities, max_msg_len, BanReason, FrameError, Hand, Message, MsgHeader, MsgType, Shake,
    FRAME_HEADER_SIZE, MAGIC,
};
use mwd_primitives::{
    BlindingBytes, Block, BlockHeader, Commitment, KernelFeatures, OutputFeatures, ProofOfWork,
    ProtocolVersion, RangeProofBytes, ShortId, SignatureBytes, Transaction, TransactionBody,
    TxInput, TxKernel, TxOutput,
};

fn sample_header() -> BlockHeader {
    BlockHeader {
        version: 1,
        height: 77,
        timestamp: 1_600_000_000,
        prev_hash: [1u8; 32],
        prev_root: [2u8; 32],
        output_root: [3u8; 32],
        range_proof_root: [4u8; 32],
        kernel_root: [5u8; 32],
        total_kernel_offset: [6u8; 32],
        output_mmr_size: 12,
        kernel_mmr_size: 5,
        total_difficulty: 909,
        secondary_scaling: 1,
        nonce: 4,
        pow: ProofOfWork {
            edge_bits: EDGEBITS,
            nonces: (0..PROOFSIZE as u64).map(|i| i * 2 + 1).collect(),
        },
    }
}

fn sample_body() -> TransactionBody {
    let mut body = TransactionBody {
        inputs: vec![TxInput {
            features: OutputFeatures::Plain,
            commit: Commitment([7u8; 33]),
        }],
        outputs: vec![TxOutput {
            features: OutputFeatures::Plain,
            commit: Commitment([8u8; 33]),
            proof: RangeProofBytes(vec![9u8; 300]),
        }],
        kernels: vec![TxKernel {
            features: KernelFeatures::Plain,
            fee: 2,
            lock_height: 0,
            excess: Commitment([10u8; 33]),
            excess_sig: SignatureBytes([11u8; 64]),
        }],
    };
    body.sort();
    body
}

fn sample_block() -> Block {
    Block {
        header: sample_header(),
        offset: BlindingBytes([12u8; 32]),
        body: sample_body(),
    }
}

fn all_messages() -> Vec<Message> {
    let addr_v4: SocketAddr = "10.0.0.1:3414".parse().expect("addr");
    let addr_v6: SocketAddr = "[2001:db8::1]:3414".parse().expect("addr");
    let block = sample_block();
    vec![
        Message::Error {
            reason: "gone".to_string(),
        },
        Message::Hand(Hand {
            version: 2,
            capabilities: capabilities::FULL_NODE,
            nonce: 12345,
            total_difficulty: 99,
            sender_addr: addr_v4,
            receiver_addr: addr_v6,
            user_agent: "MW/mwd test".to_string(),
            genesis: [20u8; 32],
        }),
        Message::Shake(Shake {
            version: 2,
            capabilities: capabilities::FULL_NODE,
            total_difficulty: 98,
            user_agent: "MW/mwd test".to_string(),
            genesis: [20u8; 32],
        }),
        Message::Ping {
            total_difficulty: 5,
            height: 6,
        },
        Message::Pong {
            total_difficulty: 7,
            height: 8,
        },
        Message::GetPeerAddrs {
            capabilities: capabilities::PEER_LIST,
        },
        Message::PeerAddrs {
            peers: vec![addr_v4, addr_v6],
        },
        Message::GetHeaders {
            locator: vec![[1u8; 32], [2u8; 32]],
        },
        Message::Header(Box::new(sample_header())),
        Message::Headers(vec![sample_header(), sample_header()]),
        Message::GetBlock { hash: [3u8; 32] },
        Message::Block(Box::new(block.clone())),
        Message::GetCompactBlock { hash: [4u8; 32] },
        Message::CompactBlock(Box::new(block.to_compact(55))),
        Message::StemTransaction(Box::new(Transaction {
            offset: BlindingBytes([13u8; 32]),
            body: sample_body(),
        })),
        Message::Transaction(Box::new(Transaction {
            offset: BlindingBytes([14u8; 32]),
            body: sample_body(),
        })),
        Message::TxHashSetRequest {
            hash: [5u8; 32],
            height: 1_000,
        },
        Message::TxHashSetArchive {
            hash: [6u8; 32],
            height: 1_000,
            bytes: 4_096,
        },
        Message::BanReason {
            reason: BanReason::BadBlock,
        },
        Message::GetTransaction {
            kernel_hash: [15u8; 32],
        },
        Message::TransactionKernel {
            kernel_hash: [16u8; 32],
        },
    ]
}

#[test]
fn every_message_roundtrips_on_both_versions() {
    let msgs = all_messages();
    assert_eq!(msgs.len(), 21);
    for version in [ProtocolVersion::V1, ProtocolVersion::V2] {
        for msg in &msgs {
            let frame = msg.encode(version);
            let header_bytes: [u8; FRAME_HEADER_SIZE] =
                frame[..FRAME_HEADER_SIZE].try_into().expect("header");
            let header = MsgHeader::parse(&header_bytes).expect("parse header");
            assert_eq!(header.msg_type, Some(msg.msg_type()));
            assert_eq!(header.len as usize, frame.len() - FRAME_HEADER_SIZE);
            let decoded =
                Message::decode(header.msg_type.expect("type"), &frame[FRAME_HEADER_SIZE..], version)
                    .unwrap_or_else(|err| panic!("decode {:?} failed: {err}", msg.msg_type()));
            assert_eq!(&decoded, msg);
        }
    }
}

#[test]
fn message_ids_are_stable() {
    for (idx, msg) in all_messages().iter().enumerate() {
        assert_eq!(msg.msg_type() as u8, idx as u8);
    }
}

#[test]
fn bad_magic_is_a_bad_frame() {
    let mut frame = Message::Ping {
        total_difficulty: 1,
        height: 1,
    }
    .encode(ProtocolVersion::V2);
    frame[0] = 0xFF;
    let header_bytes: [u8; FRAME_HEADER_SIZE] =
        frame[..FRAME_HEADER_SIZE].try_into().expect("header");
    assert!(matches!(
        MsgHeader::parse(&header_bytes),
        Err(FrameError::BadMagic)
    ));
}

#[test]
fn oversized_length_is_rejected_per_type() {
    let mut bytes = [0u8; FRAME_HEADER_SIZE];
    bytes[..2].copy_from_slice(&MAGIC);
    bytes[2] = MsgType::Ping as u8;
    bytes[3..11].copy_from_slice(&1_000u64.to_be_bytes());
    assert!(matches!(
        MsgHeader::parse(&bytes),
        Err(FrameError::LengthExceeded { .. })
    ));
}

#[test]
fn unknown_type_is_not_fatal_at_the_codec() {
    let mut bytes = [0u8; FRAME_HEADER_SIZE];
    bytes[..2].copy_from_slice(&MAGIC);
    bytes[2] = 200;
    bytes[3..11].copy_from_slice(&4u64.to_be_bytes());
    let header = MsgHeader::parse(&bytes).expect("unknown type parses");
    assert_eq!(header.msg_type, None);
    assert_eq!(header.msg_type_raw, 200);
    assert!(header.len <= max_msg_len(None));
}

#[test]
fn short_id_layout_is_six_bytes() {
    let id = ShortId([1, 2, 3, 4, 5, 6]);
    assert_eq!(id.0.len(), 6);
}
