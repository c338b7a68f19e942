//! The siphash-2-4 variant used to derive edge endpoints in the Cuckoo
//! graph family. Keys are used directly as the initial lanes, and blocks of
//! consecutive hashes are XOR-reduced backwards so a single edge value
//! depends on its whole block.

use mwd_consensus::constants::EDGE_BLOCK_BITS;
use mwd_primitives::hash::hash;

/// Number of consecutive siphash outputs per edge block.
pub const EDGE_BLOCK_SIZE: usize = 1 << EDGE_BLOCK_BITS;
pub const EDGE_BLOCK_MASK: u64 = (EDGE_BLOCK_SIZE as u64) - 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SipHashKeys {
    pub k0: u64,
    pub k1: u64,
    pub k2: u64,
    pub k3: u64,
}

impl SipHashKeys {
    /// Derives the four keys from a 32-byte header seed, little-endian.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let word = |i: usize| {
            u64::from_le_bytes(seed[i * 8..(i + 1) * 8].try_into().expect("8 bytes"))
        };
        Self {
            k0: word(0),
            k1: word(1),
            k2: word(2),
            k3: word(3),
        }
    }

    /// Keys for a header: blake2b-256 of the pre-PoW serialization.
    pub fn from_header_bytes(pre_pow: &[u8]) -> Self {
        Self::from_seed(&hash(pre_pow))
    }
}

struct SipState {
    v: [u64; 4],
}

impl SipState {
    fn new(keys: &SipHashKeys) -> Self {
        Self {
            v: [keys.k0, keys.k1, keys.k2, keys.k3],
        }
    }

    fn round(&mut self) {
        let v = &mut self.v;
        v[0] = v[0].wrapping_add(v[1]);
        v[2] = v[2].wrapping_add(v[3]);
        v[1] = v[1].rotate_left(13);
        v[3] = v[3].rotate_left(16);
        v[1] ^= v[0];
        v[3] ^= v[2];
        v[0] = v[0].rotate_left(32);
        v[2] = v[2].wrapping_add(v[1]);
        v[0] = v[0].wrapping_add(v[3]);
        v[1] = v[1].rotate_left(17);
        v[3] = v[3].rotate_left(21);
        v[1] ^= v[2];
        v[3] ^= v[0];
        v[2] = v[2].rotate_left(32);
    }

    fn hash24(&mut self, nonce: u64) {
        self.v[3] ^= nonce;
        self.round();
        self.round();
        self.v[0] ^= nonce;
        self.v[2] ^= 0xff;
        self.round();
        self.round();
        self.round();
        self.round();
    }

    fn xor_lanes(&self) -> u64 {
        self.v[0] ^ self.v[1] ^ self.v[2] ^ self.v[3]
    }
}

/// Fills `buf` with the siphash outputs for the block containing `edge` and
/// returns the XOR-reduced value for that edge.
pub fn sipblock(keys: &SipHashKeys, edge: u64, buf: &mut [u64; EDGE_BLOCK_SIZE]) -> u64 {
    let edge0 = edge & !EDGE_BLOCK_MASK;
    let mut state = SipState::new(keys);
    for i in 0..EDGE_BLOCK_SIZE {
        state.hash24(edge0 + i as u64);
        buf[i] = state.xor_lanes();
    }
    for i in (1..EDGE_BLOCK_SIZE).rev() {
        buf[i - 1] ^= buf[i];
    }
    buf[(edge & EDGE_BLOCK_MASK) as usize]
}
