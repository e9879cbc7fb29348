//! Merkle inclusion proofs.

use getset::{CopyGetters, Getters};
use incrementalmerkletree::{Hashable, Level};

use crate::hash::{zero_hashes, MerkleHash};

/// Inclusion proof of `leaf` at position `indices` under `root`.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct MerkleProof {
    /// Proven leaf hash
    #[getset(get_copy = "pub")]
    leaf: MerkleHash,
    /// Sibling at each level, leaf level first.
    #[getset(get = "pub")]
    elements: Vec<MerkleHash>,
    /// Leaf position; bit `i` set means the path node at level `i` is a right child.
    #[getset(get_copy = "pub")]
    indices: u64,
    /// Root the path hashes up to
    #[getset(get_copy = "pub")]
    root: MerkleHash,
}

impl MerkleProof {
    pub fn from_parts(
        leaf: MerkleHash,
        elements: Vec<MerkleHash>,
        indices: u64,
        root: MerkleHash,
    ) -> Self {
        MerkleProof {
            leaf,
            elements,
            indices,
            root,
        }
    }

    /// Proof for a zero value input, which spends no real leaf. Its root is computed from
    /// empty siblings so it verifies, but matches no tree root.
    pub fn dummy(leaf: MerkleHash, depth: u8) -> Self {
        let elements: Vec<MerkleHash> = zero_hashes(depth)
            .into_iter()
            .take(depth as usize)
            .collect();
        let root = fold_path(leaf, &elements, 0);
        MerkleProof {
            leaf,
            elements,
            indices: 0,
            root,
        }
    }

    /// Recomputes the root from the leaf and siblings.
    pub fn verify(&self) -> bool {
        fold_path(self.leaf, &self.elements, self.indices) == self.root
    }
}

fn fold_path(leaf: MerkleHash, elements: &[MerkleHash], indices: u64) -> MerkleHash {
    elements
        .iter()
        .enumerate()
        .fold(leaf, |current, (level, sibling)| {
            let level_marker = Level::from(level as u8);
            if (indices >> level) & 1 == 1 {
                MerkleHash::combine(level_marker, sibling, &current)
            } else {
                MerkleHash::combine(level_marker, &current, sibling)
            }
        })
}
