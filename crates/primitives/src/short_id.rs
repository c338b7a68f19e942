//! Compact-block kernel short identifiers.
//!
//! A short id is the low 48 bits of a keyed siphash-2-4 over the kernel
//! hash, keyed per block so ids cannot be precomputed across blocks.

use mwd_consensus::Hash256;

use crate::hash::hash_parts;

pub const SHORT_ID_SIZE: usize = 6;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ShortId(pub [u8; SHORT_ID_SIZE]);

impl ShortId {
    /// Short id of `kernel_hash` under the key derived from the enclosing
    /// block's hash and nonce.
    pub fn from_kernel_hash(kernel_hash: &Hash256, block_hash: &Hash256, nonce: u64) -> Self {
        let key = hash_parts(&[block_hash, &nonce.to_le_bytes()]);
        let k0 = u64::from_le_bytes(key[0..8].try_into().expect("8 bytes"));
        let k1 = u64::from_le_bytes(key[8..16].try_into().expect("8 bytes"));
        let full = siphash24(k0, k1, kernel_hash);
        let mut out = [0u8; SHORT_ID_SIZE];
        out.copy_from_slice(&full.to_le_bytes()[..SHORT_ID_SIZE]);
        Self(out)
    }
}

fn sip_round(v: &mut [u64; 4]) {
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

/// Standard siphash-2-4 over a byte slice.
pub fn siphash24(k0: u64, k1: u64, data: &[u8]) -> u64 {
    let mut v = [
        k0 ^ 0x736f_6d65_7073_6575,
        k1 ^ 0x646f_7261_6e64_6f6d,
        k0 ^ 0x6c79_6765_6e65_7261,
        k1 ^ 0x7465_6462_7974_6573,
    ];

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let m = u64::from_le_bytes(chunk.try_into().expect("8 bytes"));
        v[3] ^= m;
        sip_round(&mut v);
        sip_round(&mut v);
        v[0] ^= m;
    }

    let rest = chunks.remainder();
    let mut last = (data.len() as u64) << 56;
    for (i, byte) in rest.iter().enumerate() {
        last |= (*byte as u64) << (8 * i);
    }
    v[3] ^= last;
    sip_round(&mut v);
    sip_round(&mut v);
    v[0] ^= last;

    v[2] ^= 0xff;
    sip_round(&mut v);
    sip_round(&mut v);
    sip_round(&mut v);
    sip_round(&mut v);

    v[0] ^ v[1] ^ v[2] ^ v[3]
}
