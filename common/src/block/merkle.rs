// Merkle commitment over transaction hashes
//
// Binary tree where leaves are transaction hashes and parents are
// sha256(left || right). Levels of odd length duplicate their last node.
// The root of an empty leaf set is sha256("").

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{sha256, Hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofPosition {
    Left,
    Right,
}

/// One step of a Merkle inclusion proof: the sibling hash and the side it
/// sits on relative to the running hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    pub sibling: Hash,
    pub position: ProofPosition,
}

pub struct MerkleTree {
    // Bottom-up levels; each level is padded to even length by duplicating
    // its last node, except the final single-node root level.
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn new(leaves: Vec<Hash>) -> Self {
        let mut levels = Vec::new();
        if leaves.is_empty() {
            return MerkleTree { levels };
        }

        let mut current = leaves;
        loop {
            if current.len() > 1 && current.len() % 2 != 0 {
                let last = current[current.len() - 1].clone();
                current.push(last);
            }
            levels.push(current.clone());
            if current.len() == 1 {
                break;
            }

            let mut next = Vec::with_capacity(current.len() / 2);
            for pair in current.chunks(2) {
                next.push(hash_pair(&pair[0], &pair[1]));
            }
            current = next;
        }

        MerkleTree { levels }
    }

    /// Root of the empty leaf set.
    pub fn empty_root() -> Hash {
        sha256(b"")
    }

    pub fn root(&self) -> Hash {
        match self.levels.last() {
            Some(level) => level[0].clone(),
            None => Self::empty_root(),
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(|level| level.len()).unwrap_or(0)
    }

    /// Inclusion proof for the leaf at `index`, ordered bottom-up.
    /// Returns None if the index is out of range.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofNode>> {
        if self.levels.is_empty() || index >= self.levels[0].len() {
            return None;
        }

        let mut proof = Vec::new();
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = position ^ 1;
            let (sibling, side) = if sibling_index < position {
                (level[sibling_index].clone(), ProofPosition::Left)
            } else {
                (level[sibling_index].clone(), ProofPosition::Right)
            };
            proof.push(ProofNode {
                sibling,
                position: side,
            });
            position /= 2;
        }
        Some(proof)
    }

    /// Recompute the root from a leaf and its proof, compare against `root`.
    pub fn verify(leaf: &Hash, proof: &[ProofNode], root: &Hash) -> bool {
        let mut current = leaf.clone();
        for node in proof {
            current = match node.position {
                ProofPosition::Left => hash_pair(&node.sibling, &current),
                ProofPosition::Right => hash_pair(&current, &node.sibling),
            };
        }
        current == *root
    }
}

/// Calculate the merkle root committing to a list of leaf hashes.
pub fn calculate_merkle_root(leaves: Vec<Hash>) -> Hash {
    MerkleTree::new(leaves).root()
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    let result: [u8; 32] = hasher.finalize().into();
    Hash::new(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(n: u8) -> Hash {
        sha256(&[n])
    }

    #[test]
    fn test_empty_root_is_sha256_of_empty_string() {
        let tree = MerkleTree::new(vec![]);
        assert_eq!(tree.root(), sha256(b""));
        assert_eq!(
            tree.root().to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_single_leaf_pairs_with_itself() {
        let tree = MerkleTree::new(vec![leaf(1)]);
        assert_eq!(tree.root(), hash_pair(&leaf(1), &leaf(1)));
    }

    #[test]
    fn test_two_leaves() {
        let tree = MerkleTree::new(vec![leaf(1), leaf(2)]);
        assert_eq!(tree.root(), hash_pair(&leaf(1), &leaf(2)));
    }

    #[test]
    fn test_three_leaves_duplicates_last() {
        let tree = MerkleTree::new(vec![leaf(1), leaf(2), leaf(3)]);

        // Level 0: [l1, l2, l3, l3]
        // Level 1: [h(l1||l2), h(l3||l3)]
        let h12 = hash_pair(&leaf(1), &leaf(2));
        let h33 = hash_pair(&leaf(3), &leaf(3));
        assert_eq!(tree.root(), hash_pair(&h12, &h33));
    }

    #[test]
    fn test_proof_round_trip() {
        let leaves: Vec<Hash> = (0..7).map(leaf).collect();
        let tree = MerkleTree::new(leaves.clone());
        let root = tree.root();

        for (i, l) in leaves.iter().enumerate() {
            let proof = tree.proof(i).unwrap();
            assert!(MerkleTree::verify(l, &proof, &root), "leaf {} failed", i);
        }
    }

    #[test]
    fn test_proof_out_of_range() {
        let tree = MerkleTree::new(vec![leaf(1), leaf(2)]);
        assert!(tree.proof(2).is_none());
        assert!(MerkleTree::new(vec![]).proof(0).is_none());
    }

    #[test]
    fn test_tampered_proof_fails() {
        let leaves: Vec<Hash> = (0..4).map(leaf).collect();
        let tree = MerkleTree::new(leaves.clone());
        let root = tree.root();
        let mut proof = tree.proof(1).unwrap();

        // flip one byte of the first sibling
        let mut bytes = proof[0].sibling.clone().to_bytes();
        bytes[0] ^= 0x01;
        proof[0].sibling = Hash::new(bytes);
        assert!(!MerkleTree::verify(&leaves[1], &proof, &root));
    }

    proptest! {
        #[test]
        fn prop_every_leaf_proves_inclusion(count in 1usize..32, flip in 0usize..31) {
            let leaves: Vec<Hash> = (0..count).map(|i| sha256(&[i as u8, 0xAB])).collect();
            let tree = MerkleTree::new(leaves.clone());
            let root = tree.root();

            let index = flip % count;
            let proof = tree.proof(index).unwrap();
            prop_assert!(MerkleTree::verify(&leaves[index], &proof, &root));

            // flipping any bit of the leaf must break the proof
            let mut bytes = leaves[index].clone().to_bytes();
            bytes[flip % 32] ^= 0x80;
            let corrupted = Hash::new(bytes);
            prop_assert!(!MerkleTree::verify(&corrupted, &proof, &root));
        }

        #[test]
        fn prop_root_is_deterministic(count in 0usize..24) {
            let leaves: Vec<Hash> = (0..count).map(|i| sha256(&[i as u8, 0xCD])).collect();
            prop_assert_eq!(
                MerkleTree::new(leaves.clone()).root(),
                MerkleTree::new(leaves).root()
            );
        }
    }
}
