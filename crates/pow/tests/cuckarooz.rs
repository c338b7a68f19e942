use std::collections::{HashMap, HashSet};

use mwd_pow::cuckarooz::{verify, PowError};
use mwd_pow::siphash::{sipblock, SipHashKeys, EDGE_BLOCK_SIZE};
use mwd_primitives::ProofOfWork;

/// Small graph so cycles are findable without a miner; the verifier code
/// path is identical at consensus size.
const TEST_EDGE_BITS: u8 = 7;
const MAX_CYCLE: usize = 14;

fn keys_for(seed_byte: u8) -> SipHashKeys {
    let mut header = [0u8; 80];
    header[0] = seed_byte;
    SipHashKeys::from_header_bytes(&header)
}

fn graph_edges(keys: &SipHashKeys) -> Vec<(u64, u64)> {
    let edge_count = 1u64 << TEST_EDGE_BITS;
    let node_mask = (2u64 << TEST_EDGE_BITS) - 1;
    let mut buf = [0u64; EDGE_BLOCK_SIZE];
    (0..edge_count)
        .map(|edge| {
            let value = sipblock(keys, edge, &mut buf);
            (value & node_mask, (value >> 32) & node_mask)
        })
        .collect()
}

/// Depth-first search for a simple even-length cycle, returned as ascending
/// edge indices.
fn find_cycle(edges: &[(u64, u64)]) -> Option<Vec<u64>> {
    let mut adjacency: HashMap<u64, Vec<(usize, u64)>> = HashMap::new();
    for (idx, (u, v)) in edges.iter().enumerate() {
        if u == v {
            continue;
        }
        adjacency.entry(*u).or_default().push((idx, *v));
        adjacency.entry(*v).or_default().push((idx, *u));
    }

    fn walk(
        adjacency: &HashMap<u64, Vec<(usize, u64)>>,
        start: u64,
        current: u64,
        used_edges: &mut Vec<usize>,
        visited: &mut HashSet<u64>,
    ) -> bool {
        if used_edges.len() > MAX_CYCLE {
            return false;
        }
        for (edge, next) in adjacency.get(&current).map(Vec::as_slice).unwrap_or(&[]) {
            if used_edges.contains(edge) {
                continue;
            }
            if *next == start {
                if used_edges.len() >= 3 && (used_edges.len() + 1) % 2 == 0 {
                    used_edges.push(*edge);
                    return true;
                }
                continue;
            }
            if visited.contains(next) {
                continue;
            }
            used_edges.push(*edge);
            visited.insert(*next);
            if walk(adjacency, start, *next, used_edges, visited) {
                return true;
            }
            visited.remove(next);
            used_edges.pop();
        }
        false
    }

    let mut starts: Vec<u64> = adjacency.keys().copied().collect();
    starts.sort_unstable();
    for start in starts {
        let mut used_edges = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(start);
        if walk(&adjacency, start, start, &mut used_edges, &mut visited) {
            let mut nonces: Vec<u64> = used_edges.into_iter().map(|idx| idx as u64).collect();
            nonces.sort_unstable();
            nonces.dedup();
            if nonces.len() % 2 == 0 && nonces.len() >= 4 {
                return Some(nonces);
            }
        }
    }
    None
}

/// Finds a seed whose graph contains a small cycle.
fn solved_graph() -> (SipHashKeys, Vec<u64>) {
    for seed in 0u8..=200 {
        let keys = keys_for(seed);
        if let Some(nonces) = find_cycle(&graph_edges(&keys)) {
            return (keys, nonces);
        }
    }
    panic!("no cycle found in any test graph");
}

#[test]
fn valid_cycle_verifies() {
    let (keys, nonces) = solved_graph();
    let proof = ProofOfWork {
        edge_bits: TEST_EDGE_BITS,
        nonces,
    };
    assert_eq!(verify(&proof, &keys), Ok(()));
}

#[test]
fn verification_is_deterministic() {
    let (keys, nonces) = solved_graph();
    let proof = ProofOfWork {
        edge_bits: TEST_EDGE_BITS,
        nonces,
    };
    assert_eq!(verify(&proof, &keys), verify(&proof, &keys));
}

#[test]
fn swapped_order_is_too_small() {
    let (keys, mut nonces) = solved_graph();
    nonces.swap(0, 1);
    let proof = ProofOfWork {
        edge_bits: TEST_EDGE_BITS,
        nonces,
    };
    assert_eq!(verify(&proof, &keys), Err(PowError::TooSmall));
}

#[test]
fn oversized_edge_is_too_big() {
    let (keys, mut nonces) = solved_graph();
    let last = nonces.len() - 1;
    nonces[last] = 1 << TEST_EDGE_BITS;
    let proof = ProofOfWork {
        edge_bits: TEST_EDGE_BITS,
        nonces,
    };
    assert_eq!(verify(&proof, &keys), Err(PowError::TooBig));
}

#[test]
fn tampered_nonce_fails() {
    let (keys, mut nonces) = solved_graph();
    // Bump the last edge to a fresh index; its endpoints no longer pair up.
    let last = nonces.len() - 1;
    let replacement = (0..(1 << TEST_EDGE_BITS))
        .rev()
        .find(|candidate| !nonces.contains(candidate) && *candidate > nonces[last - 1])
        .expect("free edge index");
    nonces[last] = replacement;
    let proof = ProofOfWork {
        edge_bits: TEST_EDGE_BITS,
        nonces,
    };
    let result = verify(&proof, &keys);
    assert!(matches!(
        result,
        Err(PowError::NonMatching)
            | Err(PowError::Branch)
            | Err(PowError::DeadEnd)
            | Err(PowError::ShortCycle)
    ));
}

#[test]
fn odd_proof_size_rejected() {
    let keys = keys_for(0);
    let proof = ProofOfWork {
        edge_bits: TEST_EDGE_BITS,
        nonces: vec![1, 2, 3],
    };
    assert_eq!(verify(&proof, &keys), Err(PowError::InvalidProofSize));
}

#[test]
fn ascending_random_edges_do_not_pair() {
    let keys = keys_for(3);
    // Strictly ascending but arbitrary; the endpoint XOR accumulator flags
    // it long before cycle-following.
    let proof = ProofOfWork {
        edge_bits: TEST_EDGE_BITS,
        nonces: (0..42).map(|i| i * 3).collect(),
    };
    let result = verify(&proof, &keys);
    assert!(result.is_err());
}
