//! Merkle Tree Builder
//!
//! Binary hash tree over event digests, used to anchor a whole batch with one ledger
//! message while keeping per-event inclusion proofs.
//!
//! # Rules
//! - Level 0 is the leaf list in arrival order (leaves are never re-sorted)
//! - `combine(a, b) = H(min(a, b) || max(a, b))` over the lowercase hex strings
//! - A level with odd cardinality duplicates its last node
//! - The root is the single node of the top level
//!
//! The sorted pair rule must not change: roots already anchored on the ledger were
//! produced with it, and proofs built any other way will not verify against them.

use crate::digest::{self, Digest};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Side on which a sibling sits relative to the path node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Right,
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStep {
    pub sibling_digest: Digest,
    pub position: Position,
}

/// Inclusion proof for one leaf, ordered leaf to root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    /// Arrival index of the leaf
    pub leaf_index: usize,
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Combine two sibling digests; operand order does not affect the result
pub fn combine(a: &Digest, b: &Digest) -> Digest {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut joined = String::with_capacity(lo.as_str().len() + hi.as_str().len());
    joined.push_str(lo.as_str());
    joined.push_str(hi.as_str());
    digest::digest_bytes(joined.as_bytes())
}

/// Merkle tree structure
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// All nodes level by level, leaves at index 0
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Build a tree over pre-hashed leaves
    pub fn build(leaves: Vec<Digest>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(CoreError::InvalidBatch);
        }

        let mut levels = vec![leaves];

        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next: Vec<Digest> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => combine(left, right),
                    [last] => combine(last, last),
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(next);
        }

        Ok(Self { levels })
    }

    /// Build a tree over raw items, digesting each in canonical form first
    pub fn build_from_items<T: Serialize>(items: &[T]) -> Result<Self> {
        let leaves = items
            .iter()
            .map(digest::digest)
            .collect::<Result<Vec<_>>>()?;
        Self::build(leaves)
    }

    pub fn root(&self) -> &Digest {
        // build() guarantees a non-empty top level
        &self.levels[self.levels.len() - 1][0]
    }

    pub fn leaves(&self) -> &[Digest] {
        &self.levels[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// Number of levels above the leaves; equals the proof length
    pub fn height(&self) -> usize {
        self.levels.len() - 1
    }

    /// Generate an inclusion proof for the leaf at `leaf_index`
    pub fn generate_proof(&self, leaf_index: usize) -> Result<MerkleProof> {
        if leaf_index >= self.leaf_count() {
            return Err(CoreError::InvalidLeafIndex {
                index: leaf_index,
                count: self.leaf_count(),
            });
        }

        let mut steps = Vec::with_capacity(self.height());
        let mut index = leaf_index;

        for level in &self.levels[..self.levels.len() - 1] {
            let step = if index % 2 == 1 {
                ProofStep {
                    sibling_digest: level[index - 1].clone(),
                    position: Position::Left,
                }
            } else {
                // Odd level: the last node pairs with its own copy
                let sibling = level.get(index + 1).unwrap_or(&level[index]);
                ProofStep {
                    sibling_digest: sibling.clone(),
                    position: Position::Right,
                }
            };
            steps.push(step);
            index /= 2;
        }

        Ok(MerkleProof { leaf_index, steps })
    }

    /// Generate proofs for every leaf, in leaf order
    pub fn generate_all_proofs(&self) -> Vec<MerkleProof> {
        (0..self.leaf_count())
            .filter_map(|i| self.generate_proof(i).ok())
            .collect()
    }
}

/// Replay a proof from a leaf and return the root it implies
pub fn compute_root(leaf: &Digest, proof: &MerkleProof) -> Digest {
    proof
        .steps
        .iter()
        .fold(leaf.clone(), |acc, step| combine(&acc, &step.sibling_digest))
}

/// Verify that `leaf` is included under `root`
pub fn verify_proof(leaf: &Digest, proof: &MerkleProof, root: &Digest) -> bool {
    compute_root(leaf, proof) == *root
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(n: u32) -> Digest {
        digest::digest_bytes(format!("leaf-{}", n).as_bytes())
    }

    fn leaves(count: u32) -> Vec<Digest> {
        (0..count).map(leaf).collect()
    }

    #[test]
    fn test_empty_leaves_rejected() {
        assert!(matches!(
            MerkleTree::build(Vec::new()),
            Err(CoreError::InvalidBatch)
        ));
    }

    #[test]
    fn test_single_leaf_tree() {
        let tree = MerkleTree::build(vec![leaf(1)]).unwrap();
        assert_eq!(tree.root(), &leaf(1));
        assert_eq!(tree.height(), 0);

        let proof = tree.generate_proof(0).unwrap();
        assert!(proof.is_empty());
        assert!(verify_proof(&leaf(1), &proof, tree.root()));
    }

    #[test]
    fn test_combine_is_order_independent() {
        assert_eq!(combine(&leaf(1), &leaf(2)), combine(&leaf(2), &leaf(1)));
    }

    #[test]
    fn test_three_leaves_duplicate_last() {
        let l = leaves(3);
        let tree = MerkleTree::build(l.clone()).unwrap();

        let left = combine(&l[0], &l[1]);
        let right = combine(&l[2], &l[2]);
        assert_eq!(tree.root(), &combine(&left, &right));
        assert_eq!(tree.height(), 2);
    }

    #[test]
    fn test_leaf_order_is_preserved() {
        let l = leaves(4);
        let tree = MerkleTree::build(l.clone()).unwrap();
        assert_eq!(tree.leaves(), l.as_slice());
    }

    #[test]
    fn test_out_of_range_index() {
        let tree = MerkleTree::build(leaves(4)).unwrap();
        assert!(matches!(
            tree.generate_proof(4),
            Err(CoreError::InvalidLeafIndex { index: 4, count: 4 })
        ));
    }

    #[test]
    fn test_proof_positions() {
        let tree = MerkleTree::build(leaves(4)).unwrap();
        let proof = tree.generate_proof(1).unwrap();
        assert_eq!(proof.steps[0].position, Position::Left);
        assert_eq!(proof.steps[0].sibling_digest, leaf(0));
        assert_eq!(proof.steps[1].position, Position::Right);
    }

    #[test]
    fn test_proof_length_is_log2() {
        let tree = MerkleTree::build(leaves(9)).unwrap();
        for proof in tree.generate_all_proofs() {
            assert_eq!(proof.len(), 4);
        }
    }

    #[test]
    fn test_tampered_sibling_fails() {
        let tree = MerkleTree::build(leaves(5)).unwrap();
        let mut proof = tree.generate_proof(2).unwrap();
        proof.steps[0].sibling_digest = leaf(99);
        assert!(!verify_proof(&leaf(2), &proof, tree.root()));
    }

    #[test]
    fn test_build_from_items() {
        let items = vec![serde_json::json!({"a": 1}), serde_json::json!({"a": 2})];
        let tree = MerkleTree::build_from_items(&items).unwrap();
        assert_eq!(tree.leaves()[0], digest::digest_value(&items[0]));
    }

    #[test]
    fn test_proof_serde_shape() {
        let tree = MerkleTree::build(leaves(2)).unwrap();
        let proof = tree.generate_proof(0).unwrap();
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["leafIndex"], 0);
        assert_eq!(json["steps"][0]["position"], "right");
        assert!(json["steps"][0]["siblingDigest"].is_string());
    }

    proptest! {
        #[test]
        fn prop_every_leaf_verifies(count in 1u32..64) {
            let l = leaves(count);
            let tree = MerkleTree::build(l.clone()).unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.generate_proof(i).unwrap();
                prop_assert!(verify_proof(leaf, &proof, tree.root()));
            }
        }

        #[test]
        fn prop_mutating_a_leaf_invalidates_other_proofs(count in 2u32..40, seed in any::<u32>()) {
            let original = leaves(count);
            let j = (seed % count) as usize;
            let tree = MerkleTree::build(original.clone()).unwrap();

            let mut mutated = original.clone();
            mutated[j] = digest::digest_bytes(b"tampered");
            let new_tree = MerkleTree::build(mutated).unwrap();
            prop_assert_ne!(tree.root(), new_tree.root());

            for i in (0..count as usize).filter(|&i| i != j) {
                let old_proof = tree.generate_proof(i).unwrap();
                prop_assert!(!verify_proof(&original[i], &old_proof, new_tree.root()));
            }
        }
    }
}
