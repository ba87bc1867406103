//! RFC 6962 Merkle tree hashing and inclusion proofs.

use sha2::{Digest, Sha256};
use thiserror::Error;

pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("leaf index {index} is outside a tree of size {size}")]
    IndexOutOfRange { index: u64, size: u64 },
    #[error("proof has {got} hashes, expected {want}")]
    WrongProofSize { got: usize, want: usize },
    #[error("calculated root {calculated} does not match expected root {expected}")]
    RootMismatch { calculated: String, expected: String },
}

pub fn hash_leaf(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hash_children(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Checks that `leaf_hash` sits at `index` in the tree of `size` leaves whose
/// head is `root`.
pub fn verify_inclusion(
    index: u64,
    size: u64,
    leaf_hash: &Hash,
    proof: &[Hash],
    root: &Hash,
) -> Result<(), ProofError> {
    let calculated = root_from_inclusion_proof(index, size, leaf_hash, proof)?;
    if &calculated != root {
        return Err(ProofError::RootMismatch {
            calculated: hex::encode(calculated),
            expected: hex::encode(root),
        });
    }
    Ok(())
}

/// Recomputes the tree head implied by an inclusion proof.
pub fn root_from_inclusion_proof(
    index: u64,
    size: u64,
    leaf_hash: &Hash,
    proof: &[Hash],
) -> Result<Hash, ProofError> {
    if index >= size {
        return Err(ProofError::IndexOutOfRange { index, size });
    }
    // The path splits into the part below the point where the leaf's subtree
    // and the right border of the tree diverge, and the border above it.
    let inner = (u64::BITS - (index ^ (size - 1)).leading_zeros()) as usize;
    let border = index.checked_shr(inner as u32).unwrap_or(0).count_ones() as usize;
    if proof.len() != inner + border {
        return Err(ProofError::WrongProofSize {
            got: proof.len(),
            want: inner + border,
        });
    }

    let mut seed = *leaf_hash;
    for (i, sibling) in proof[..inner].iter().enumerate() {
        seed = if (index >> i) & 1 == 0 {
            hash_children(&seed, sibling)
        } else {
            hash_children(sibling, &seed)
        };
    }
    for sibling in &proof[inner..] {
        seed = hash_children(sibling, &seed);
    }
    Ok(seed)
}

/// Merkle tree head over already-hashed leaves.
pub fn root_hash(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => Sha256::digest(b"").into(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            hash_children(&root_hash(&leaves[..k]), &root_hash(&leaves[k..]))
        }
    }
}

/// Audit path for the leaf at `index`, ordered from the leaf upwards.
pub fn inclusion_proof(leaves: &[Hash], index: usize) -> Vec<Hash> {
    let n = leaves.len();
    if n <= 1 || index >= n {
        return Vec::new();
    }
    let k = split_point(n);
    if index < k {
        let mut path = inclusion_proof(&leaves[..k], index);
        path.push(root_hash(&leaves[k..]));
        path
    } else {
        let mut path = inclusion_proof(&leaves[k..], index - k);
        path.push(root_hash(&leaves[..k]));
        path
    }
}

/// Largest power of two strictly smaller than `n` (n > 1).
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k << 1 < n {
        k <<= 1;
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| hash_leaf(format!("leaf {}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_tree_root() {
        assert_eq!(
            hex::encode(root_hash(&[])),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_leaf_and_node_prefixes_differ() {
        let data = [0u8; 64];
        let (left, right) = data.split_at(32);
        let left: Hash = left.try_into().unwrap();
        let right: Hash = right.try_into().unwrap();
        assert_ne!(hash_leaf(&data), hash_children(&left, &right));
    }

    #[test]
    fn test_every_leaf_verifies_for_many_sizes() {
        for size in 1..=17usize {
            let tree = leaves(size);
            let root = root_hash(&tree);
            for index in 0..size {
                let proof = inclusion_proof(&tree, index);
                verify_inclusion(index as u64, size as u64, &tree[index], &proof, &root)
                    .unwrap_or_else(|e| panic!("size {} index {}: {}", size, index, e));
            }
        }
    }

    #[test]
    fn test_wrong_leaf_rejected() {
        let tree = leaves(7);
        let root = root_hash(&tree);
        let proof = inclusion_proof(&tree, 3);
        let result = verify_inclusion(3, 7, &tree[4], &proof, &root);
        assert!(matches!(result, Err(ProofError::RootMismatch { .. })));
    }

    #[test]
    fn test_wrong_index_or_size_rejected() {
        let tree = leaves(6);
        let root = root_hash(&tree);
        let proof = inclusion_proof(&tree, 2);
        assert!(verify_inclusion(3, 6, &tree[2], &proof, &root).is_err());
        assert!(matches!(
            verify_inclusion(6, 6, &tree[2], &proof, &root),
            Err(ProofError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            verify_inclusion(2, 6, &tree[2], &proof[1..], &root),
            Err(ProofError::WrongProofSize { .. })
        ));
    }
}
