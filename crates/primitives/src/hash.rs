use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use mwd_consensus::Hash256;

type Blake2b256 = Blake2b<U32>;

pub fn hash(data: &[u8]) -> Hash256 {
    let digest = Blake2b256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn hash_parts(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Hashes `data` prefixed with a big-endian position, the node hash used by
/// the append-only MMRs.
pub fn hash_with_index(index: u64, data: &[u8]) -> Hash256 {
    hash_parts(&[&index.to_be_bytes(), data])
}

pub fn to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// First four bytes of the hash in hex, for log lines.
pub fn short_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(8);
    for byte in &hash[..4] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
