/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Merkle trees over sectors and over lists of sector roots.
//!
//! ## Tree shape
//!
//! Leaves are hashed as `H(0x00 || leaf)` and interior nodes as `H(0x01 || left || right)`. A tree over
//! `n > 1` leaves splits them so that the left subtree holds the largest power of two strictly smaller
//! than `n`; for sectors, whose leaf count is a power of two, the tree is perfectly balanced.
//!
//! Two kinds of tree are used:
//! 1. A **sector tree**, whose leaves are the 64-byte segments of a sector. Its root is the sector's
//!    Merkle root, the identity under which hosts store the sector.
//! 2. A **roots tree**, whose leaves are the sector roots of a contract in storage order. Its root is the
//!    file Merkle root carried in every contract revision.
//!
//! ## Range proofs
//!
//! A range proof for leaves `[start, end)` is the list of roots of every maximal subtree lying entirely
//! outside the range, in left-to-right order. The verifier recomputes the root from the leaves in the
//! range plus those subtree roots.

use crate::types::constants::{SEGMENTS_PER_SECTOR, SEGMENT_SIZE};
use crate::types::crypto_primitives::hash_all;
use crate::types::data_types::{CryptoHash, SectorRoot};

const LEAF_PREFIX: [u8; 1] = [0x00];
const NODE_PREFIX: [u8; 1] = [0x01];

pub fn leaf_hash(leaf: &[u8]) -> CryptoHash {
    hash_all(&[&LEAF_PREFIX, leaf])
}

pub fn node_hash(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    hash_all(&[&NODE_PREFIX, &left.bytes(), &right.bytes()])
}

/// Size of the left subtree of a tree with `n >= 2` leaves.
fn split_point(n: usize) -> usize {
    let mut p = 1;
    while p * 2 < n {
        p *= 2;
    }
    p
}

/// Root of the tree whose leaf hashes are `leaves`. The empty tree has the zero root.
pub fn root_from_leaves(leaves: &[CryptoHash]) -> CryptoHash {
    match leaves.len() {
        0 => CryptoHash::default(),
        1 => leaves[0],
        n => {
            let m = split_point(n);
            node_hash(&root_from_leaves(&leaves[..m]), &root_from_leaves(&leaves[m..]))
        }
    }
}

/// Leaf hashes of the 64-byte segments of `data`. A trailing partial segment is hashed as-is.
pub fn segment_leaves(data: &[u8]) -> Vec<CryptoHash> {
    data.chunks(SEGMENT_SIZE as usize).map(leaf_hash).collect()
}

/// Merkle root of a sector (or any data, segmented into 64-byte leaves).
pub fn sector_root(data: &[u8]) -> SectorRoot {
    root_from_leaves(&segment_leaves(data))
}

/// Leaf hashes of a list of sector roots.
pub fn roots_leaves(roots: &[SectorRoot]) -> Vec<CryptoHash> {
    roots.iter().map(|root| leaf_hash(&root.bytes())).collect()
}

/// The file Merkle root of a contract holding `roots` in storage order.
pub fn roots_root(roots: &[SectorRoot]) -> CryptoHash {
    root_from_leaves(&roots_leaves(roots))
}

/// Build the range proof for `[start, end)` over `leaves`.
pub fn range_proof(leaves: &[CryptoHash], start: usize, end: usize) -> Vec<CryptoHash> {
    let mut proof = Vec::new();
    if start >= end || end > leaves.len() {
        return proof;
    }
    build_proof(leaves, 0, leaves.len(), start, end, &mut proof);
    proof
}

fn build_proof(leaves: &[CryptoHash], lo: usize, hi: usize, start: usize, end: usize, proof: &mut Vec<CryptoHash>) {
    if hi <= start || lo >= end {
        proof.push(root_from_leaves(&leaves[lo..hi]));
        return;
    }
    if hi - lo == 1 {
        return;
    }
    let mid = lo + split_point(hi - lo);
    build_proof(leaves, lo, mid, start, end, proof);
    build_proof(leaves, mid, hi, start, end, proof);
}

/// Verify that `range_leaves` are the leaves `[start, end)` of a tree with `num_leaves` leaves and root
/// `root`, given the `proof` produced by [`range_proof`].
pub fn verify_range_proof(
    range_leaves: &[CryptoHash],
    proof: &[CryptoHash],
    start: usize,
    end: usize,
    num_leaves: usize,
    root: &CryptoHash,
) -> bool {
    if start >= end || end > num_leaves || range_leaves.len() != end - start {
        return false;
    }
    let mut proof_iter = proof.iter();
    let computed = compute_root(range_leaves, &mut proof_iter, 0, num_leaves, start, end);
    computed.as_ref() == Some(root) && proof_iter.next().is_none()
}

fn compute_root<'a>(
    range_leaves: &[CryptoHash],
    proof: &mut impl Iterator<Item = &'a CryptoHash>,
    lo: usize,
    hi: usize,
    start: usize,
    end: usize,
) -> Option<CryptoHash> {
    if hi <= start || lo >= end {
        return proof.next().copied();
    }
    if hi - lo == 1 {
        return Some(range_leaves[lo - start]);
    }
    let mid = lo + split_point(hi - lo);
    let left = compute_root(range_leaves, proof, lo, mid, start, end)?;
    let right = compute_root(range_leaves, proof, mid, hi, start, end)?;
    Some(node_hash(&left, &right))
}

/// Range proof for the segments `[start_segment, end_segment)` of a full sector.
pub fn sector_range_proof(sector: &[u8], start_segment: usize, end_segment: usize) -> Vec<CryptoHash> {
    range_proof(&segment_leaves(sector), start_segment, end_segment)
}

/// Verify that `data` is exactly the segments `[start_segment, end_segment)` of the sector with root
/// `root`.
pub fn verify_sector_range(data: &[u8], proof: &[CryptoHash], start_segment: usize, end_segment: usize, root: &SectorRoot) -> bool {
    if data.len() as u64 != (end_segment.saturating_sub(start_segment)) as u64 * SEGMENT_SIZE {
        return false;
    }
    verify_range_proof(
        &segment_leaves(data),
        proof,
        start_segment,
        end_segment,
        SEGMENTS_PER_SECTOR as usize,
        root,
    )
}

/// Segment-aligned bounds `[start_segment, end_segment)` covering the byte range `[offset, offset+length)`.
pub fn segment_bounds(offset: u64, length: u64) -> (usize, usize) {
    let start = offset / SEGMENT_SIZE;
    let end = (offset + length + SEGMENT_SIZE - 1) / SEGMENT_SIZE;
    (start as usize, end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<CryptoHash> {
        (0..n).map(|i| leaf_hash(&(i as u64).to_le_bytes())).collect()
    }

    #[test]
    fn range_proofs_verify_for_unbalanced_trees() {
        for n in [1usize, 2, 3, 5, 7, 8, 13] {
            let leaves = leaves(n);
            let root = root_from_leaves(&leaves);
            for start in 0..n {
                for end in start + 1..=n {
                    let proof = range_proof(&leaves, start, end);
                    assert!(verify_range_proof(&leaves[start..end], &proof, start, end, n, &root));
                }
            }
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let leaves = leaves(6);
        let root = root_from_leaves(&leaves);
        let proof = range_proof(&leaves, 2, 4);
        let mut tampered = leaves[2..4].to_vec();
        tampered[1] = leaf_hash(b"evil");
        assert!(!verify_range_proof(&tampered, &proof, 2, 4, 6, &root));
        assert!(!verify_range_proof(&leaves[2..4], &proof[1..], 2, 4, 6, &root));
    }

    #[test]
    fn sector_segment_proof_round_trips() {
        let mut sector = vec![0u8; crate::types::constants::SECTOR_SIZE as usize];
        sector[1000..1100].copy_from_slice(&[7u8; 100]);
        let root = sector_root(&sector);
        let (start, end) = segment_bounds(990, 120);
        let proof = sector_range_proof(&sector, start, end);
        let data = &sector[start * 64..end * 64];
        assert!(verify_sector_range(data, &proof, start, end, &root));
    }
}
