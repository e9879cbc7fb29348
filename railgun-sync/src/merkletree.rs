//! Fixed depth incremental merkle trees.
//!
//! [`Merkletree`] is shared by the UTXO tree ([`utxo::UtxoMerkletree`]) and the txid tree
//! ([`txid::TxidMerkletree`]). Leaves are buffered in a position indexed write queue and applied
//! in contiguous runs, updating the `depth` nodes above each new leaf.
//!
//! Leaves written since the last [`Merkletree::take_changes`] are tracked so the store only
//! writes what changed. Nodes are never stored; [`Merkletree::from_layout`] rebuilds them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use getset::{CopyGetters, Getters};
use incrementalmerkletree::{Hashable, Level};
use zcash_encoding::Vector;

use railgun_status::tree_validity::TreeValidity;

use crate::hash::{zero_hashes, MerkleHash};
use crate::primitives::{Commitment, RailgunTransactionWithHash};

use self::error::MerkletreeError;
use self::proof::MerkleProof;

pub mod error;
/// Inclusion proofs
pub mod proof;
/// Railgun transaction tree
pub mod txid;
/// Commitment tree and its nullifier and unshield tables
pub mod utxo;

/// Leaf types storable in a [`Merkletree`].
pub trait MerkleLeaf: Clone + Debug + PartialEq {
    /// Hash inserted at level 0
    fn leaf_hash(&self) -> MerkleHash;
    /// Deserialize a leaf
    fn read<R: Read>(reader: R) -> io::Result<Self>;
    /// Serialize a leaf
    fn write<W: Write>(&self, writer: W) -> io::Result<()>;
}

impl MerkleLeaf for Commitment {
    fn leaf_hash(&self) -> MerkleHash {
        self.hash
    }
    fn read<R: Read>(reader: R) -> io::Result<Self> {
        Commitment::read(reader)
    }
    fn write<W: Write>(&self, writer: W) -> io::Result<()> {
        Commitment::write(self, writer)
    }
}

impl MerkleLeaf for RailgunTransactionWithHash {
    fn leaf_hash(&self) -> MerkleHash {
        self.hash()
    }
    fn read<R: Read>(reader: R) -> io::Result<Self> {
        RailgunTransactionWithHash::read(reader)
    }
    fn write<W: Write>(&self, writer: W) -> io::Result<()> {
        RailgunTransactionWithHash::write(self, writer)
    }
}

/// A single tree: applied leaves, every node level and its root validity.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Tree<L> {
    /// Applied leaves in position order
    #[getset(get = "pub")]
    leaves: Vec<L>,
    // nodes[0] holds leaf hashes, nodes[depth] holds the root once a leaf exists
    nodes: Vec<Vec<MerkleHash>>,
    /// Whether every root of this tree was accepted
    #[getset(get_copy = "pub")]
    validity: TreeValidity,
}

impl<L> Tree<L> {
    fn new(depth: u8) -> Self {
        Tree {
            leaves: Vec::new(),
            nodes: vec![Vec::new(); depth as usize + 1],
            validity: TreeValidity::Valid,
        }
    }
}

/// Length and validity of one stored tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct StoredTree {
    /// Tree number
    number: u32,
    /// Applied leaves
    length: u64,
    /// Root validity when stored
    validity: TreeValidity,
}

/// Shape of a [`Merkletree`]: everything but its leaves.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct TreeLayout {
    /// Levels above the leaves
    #[getset(get_copy = "pub")]
    depth: u8,
    /// Every tree, in number order
    #[getset(get = "pub")]
    trees: Vec<StoredTree>,
}

impl TreeLayout {
    /// Version written at the start of [`Self::write`]
    pub fn serialized_version() -> u64 {
        1
    }

    /// Deserialize into a new layout
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let _version = reader.read_u64::<LittleEndian>()?;
        let depth = reader.read_u8()?;
        let trees = Vector::read(&mut reader, |r| {
            let number = r.read_u32::<LittleEndian>()?;
            let length = r.read_u64::<LittleEndian>()?;
            let validity = match r.read_u8()? {
                0 => TreeValidity::Valid,
                _ => TreeValidity::InvalidFrom(r.read_u64::<LittleEndian>()?),
            };
            Ok(StoredTree {
                number,
                length,
                validity,
            })
        })?;
        Ok(TreeLayout { depth, trees })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(Self::serialized_version())?;
        writer.write_u8(self.depth)?;
        Vector::write(&mut writer, &self.trees, |w, t| {
            w.write_u32::<LittleEndian>(t.number)?;
            w.write_u64::<LittleEndian>(t.length)?;
            match t.validity {
                TreeValidity::Valid => w.write_u8(0),
                TreeValidity::InvalidFrom(position) => {
                    w.write_u8(1)?;
                    w.write_u64::<LittleEndian>(position)
                }
            }
        })
    }
}

/// A leaf written since the last [`Merkletree::take_changes`].
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct StoredLeaf<L> {
    /// Tree number
    #[getset(get_copy = "pub")]
    tree: u32,
    /// Position in the tree
    #[getset(get_copy = "pub")]
    position: u64,
    /// The leaf itself
    #[getset(get = "pub")]
    leaf: L,
}

/// Current layout plus the leaves written since the previous call to
/// [`Merkletree::take_changes`].
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct TreeChanges<L> {
    /// Layout after the changes
    layout: TreeLayout,
    /// Leaves to write
    leaves: Vec<StoredLeaf<L>>,
}

impl<L> TreeChanges<L> {
    /// Splits into the layout and the changed leaves.
    pub fn into_parts(self) -> (TreeLayout, Vec<StoredLeaf<L>>) {
        (self.layout, self.leaves)
    }
}

/// A run of leaves applied to one tree by [`Merkletree::apply_next_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct AppliedBatch {
    /// Tree the leaves landed in
    tree: u32,
    /// Position of the first leaf
    start: u64,
    /// Number of leaves
    len: u64,
    /// Root after the batch
    root: MerkleHash,
}

/// Numbered trees of depth `depth` plus the queue of leaves waiting to be applied.
#[derive(Debug, Clone)]
pub struct Merkletree<L> {
    depth: u8,
    zeros: Vec<MerkleHash>,
    trees: BTreeMap<u32, Tree<L>>,
    write_queue: BTreeMap<u32, BTreeMap<u64, L>>,
    // applied positions written since the last take_changes
    changed: BTreeMap<u32, BTreeSet<u64>>,
}

impl<L: MerkleLeaf> Merkletree<L> {
    /// Creates an empty set of trees with `2^depth` leaves each.
    pub fn new(depth: u8) -> Self {
        Merkletree {
            depth,
            zeros: zero_hashes(depth),
            trees: BTreeMap::new(),
            write_queue: BTreeMap::new(),
            changed: BTreeMap::new(),
        }
    }

    /// Rebuilds trees from a stored layout, fetching every leaf with `read_leaf`.
    pub fn from_layout<E, F>(layout: &TreeLayout, mut read_leaf: F) -> Result<Self, E>
    where
        F: FnMut(u32, u64) -> Result<L, E>,
    {
        let depth = layout.depth;
        let mut merkletree = Merkletree::new(depth);
        for stored in &layout.trees {
            let mut t = Tree::new(depth);
            for position in 0..stored.length {
                let leaf = read_leaf(stored.number, position)?;
                let index = t.leaves.len();
                t.nodes[0].push(leaf.leaf_hash());
                t.leaves.push(leaf);
                update_path(&mut t, &merkletree.zeros, depth, index);
            }
            t.validity = stored.validity;
            merkletree.trees.insert(stored.number, t);
        }
        Ok(merkletree)
    }

    /// Levels above the leaves.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Leaves per tree.
    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    /// Number of applied leaves in `tree`.
    pub fn tree_length(&self, tree: u32) -> u64 {
        self.trees
            .get(&tree)
            .map_or(0, |t| t.leaves.len() as u64)
    }

    /// Highest tree number holding applied leaves or a validity marker, `0` when empty.
    pub fn latest_tree(&self) -> u32 {
        self.trees.keys().next_back().copied().unwrap_or(0)
    }

    /// Applied leaves, nodes and validity of `tree`.
    pub fn tree(&self, tree: u32) -> Option<&Tree<L>> {
        self.trees.get(&tree)
    }

    /// Current root of `tree`; the empty root for a tree with no leaves.
    pub fn root(&self, tree: u32) -> MerkleHash {
        self.trees
            .get(&tree)
            .and_then(|t| t.nodes[self.depth as usize].first().copied())
            .unwrap_or(self.zeros[self.depth as usize])
    }

    /// Applied leaf at `(tree, position)`. Queued leaves are not visible.
    pub fn get_leaf(&self, tree: u32, position: u64) -> Option<&L> {
        self.trees
            .get(&tree)
            .and_then(|t| t.leaves.get(position as usize))
    }

    /// Mutable access for side data that does not change the leaf hash.
    pub(crate) fn get_leaf_mut(&mut self, tree: u32, position: u64) -> Option<&mut L> {
        let leaf = self
            .trees
            .get_mut(&tree)
            .and_then(|t| t.leaves.get_mut(position as usize))?;
        self.changed.entry(tree).or_default().insert(position);
        Some(leaf)
    }

    /// Root validity of `tree`; trees not yet started are valid.
    pub fn validity(&self, tree: u32) -> TreeValidity {
        self.trees
            .get(&tree)
            .map_or(TreeValidity::Valid, |t| t.validity)
    }

    /// Lowest tree whose last root was rejected.
    pub fn first_invalid_tree(&self) -> Option<u32> {
        self.trees
            .iter()
            .find(|(_, t)| !t.validity.is_valid())
            .map(|(number, _)| *number)
    }

    /// Number of queued leaves for `tree`, applied or not.
    pub fn queued_len(&self, tree: u32) -> usize {
        self.write_queue.get(&tree).map_or(0, |queue| queue.len())
    }

    /// Buffers `leaves` at `start_position..`. Positions already applied are ignored; for
    /// pending positions the last write wins.
    pub fn queue_leaves(
        &mut self,
        tree: u32,
        start_position: u64,
        leaves: Vec<L>,
    ) -> Result<(), MerkletreeError> {
        let capacity = self.capacity();
        let end = start_position + leaves.len() as u64;
        if end > capacity {
            return Err(MerkletreeError::PositionOutOfRange {
                tree,
                position: end - 1,
                capacity,
            });
        }

        let applied = self.tree_length(tree);
        let queue = self.write_queue.entry(tree).or_default();
        for (position, leaf) in (start_position..).zip(leaves) {
            if position < applied {
                if self.trees.get(&tree).and_then(|t| t.leaves.get(position as usize))
                    != Some(&leaf)
                {
                    tracing::debug!(
                        "ignoring conflicting leaf for applied position {}:{}",
                        tree,
                        position
                    );
                }
                continue;
            }
            queue.insert(position, leaf);
        }

        Ok(())
    }

    /// The queued leaf at the highest `(tree, position)`.
    pub fn last_queued_leaf(&self) -> Option<(u32, u64, &L)> {
        self.write_queue
            .iter()
            .rev()
            .find_map(|(tree, queue)| {
                queue
                    .iter()
                    .next_back()
                    .map(|(position, leaf)| (*tree, *position, leaf))
            })
    }

    /// The applied leaf at the highest `(tree, position)`.
    pub fn last_applied_leaf(&self) -> Option<(u32, u64, &L)> {
        self.trees.iter().rev().find_map(|(tree, t)| {
            t.leaves
                .last()
                .map(|leaf| (*tree, t.leaves.len() as u64 - 1, leaf))
        })
    }

    /// Tree numbers with queued leaves.
    pub fn queued_trees(&self) -> Vec<u32> {
        self.write_queue
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(tree, _)| *tree)
            .collect()
    }

    /// Applies the longest contiguous run of queued leaves starting at the current length of
    /// `tree`. Returns `None` if the next position is a gap.
    pub fn apply_next_batch(&mut self, tree: u32) -> Option<AppliedBatch> {
        let start = self.tree_length(tree);
        let queue = self.write_queue.get_mut(&tree)?;

        // leaves queued before their position was applied by an earlier batch
        let mut pending = queue.split_off(&start);
        std::mem::swap(queue, &mut pending);

        let mut batch = Vec::new();
        while let Some(leaf) = queue.remove(&(start + batch.len() as u64)) {
            batch.push(leaf);
        }
        if queue.is_empty() {
            self.write_queue.remove(&tree);
        }
        if batch.is_empty() {
            return None;
        }

        let len = batch.len() as u64;
        for leaf in batch {
            self.insert_leaf(tree, leaf);
        }

        Some(AppliedBatch {
            tree,
            start,
            len,
            root: self.root(tree),
        })
    }

    /// Applies every contiguous run without external validation. Returns the applied batches.
    pub fn apply_queue_unvalidated(&mut self) -> Vec<AppliedBatch> {
        let mut batches = Vec::new();
        for tree in self.queued_trees() {
            if let Some(batch) = self.apply_next_batch(tree) {
                self.confirm_batch(&batch);
                batches.push(batch);
            }
        }
        batches
    }

    /// Marks a batch as externally validated, clearing an invalid marker it covers.
    pub fn confirm_batch(&mut self, batch: &AppliedBatch) {
        if let Some(t) = self.trees.get_mut(&batch.tree) {
            if t.validity.cleared_by_batch_at(batch.start) {
                t.validity = TreeValidity::Valid;
            }
        }
    }

    /// Undoes a rejected batch and marks its tree invalid from the batch start.
    pub fn reject_batch(&mut self, batch: &AppliedBatch) {
        self.truncate_tree(batch.tree, batch.start, false);
        if let Some(t) = self.trees.get_mut(&batch.tree) {
            let invalid_from = match t.validity {
                TreeValidity::InvalidFrom(position) => position.min(batch.start),
                TreeValidity::Valid => batch.start,
            };
            t.validity = TreeValidity::InvalidFrom(invalid_from);
        }
    }

    fn insert_leaf(&mut self, tree: u32, leaf: L) {
        let depth = self.depth;
        let t = self.trees.entry(tree).or_insert_with(|| Tree::new(depth));
        let index = t.leaves.len();
        t.nodes[0].push(leaf.leaf_hash());
        t.leaves.push(leaf);
        update_path(t, &self.zeros, depth, index);
        self.changed.entry(tree).or_default().insert(index as u64);
    }

    /// Drops every applied leaf of `tree` at or after `new_length`, along with queued leaves
    /// from that position on. Empty trees other than tree 0 are removed when `remove_empty`.
    pub fn truncate_tree(&mut self, tree: u32, new_length: u64, remove_empty: bool) {
        if let Some(queue) = self.write_queue.get_mut(&tree) {
            queue.split_off(&new_length);
        }
        if let Some(changed) = self.changed.get_mut(&tree) {
            changed.split_off(&new_length);
        }
        let depth = self.depth;
        let Some(t) = self.trees.get_mut(&tree) else {
            return;
        };
        if new_length >= t.leaves.len() as u64 {
            return;
        }

        let new_length = new_length as usize;
        t.leaves.truncate(new_length);
        for (level, nodes) in t.nodes.iter_mut().enumerate() {
            let kept = (new_length + (1 << level) - 1) >> level;
            nodes.truncate(kept);
        }
        if new_length > 0 {
            update_path(t, &self.zeros, depth, new_length - 1);
        } else if remove_empty && tree != 0 {
            self.trees.remove(&tree);
        }
    }

    /// Drops every leaf and queued leaf in trees after `tree`.
    pub fn remove_trees_after(&mut self, tree: u32) {
        self.trees.split_off(&(tree + 1));
        self.write_queue.split_off(&(tree + 1));
        self.changed.split_off(&(tree + 1));
    }

    /// Drops every queued leaf. Applied leaves are kept.
    pub fn clear_write_queue(&mut self) {
        self.write_queue.clear();
    }

    /// Wipes all trees and the queue.
    pub fn clear(&mut self) {
        self.trees.clear();
        self.write_queue.clear();
        self.changed.clear();
    }

    /// Number and length of every tree, without leaves.
    pub fn layout(&self) -> TreeLayout {
        TreeLayout {
            depth: self.depth,
            trees: self
                .trees
                .iter()
                .map(|(number, t)| StoredTree {
                    number: *number,
                    length: t.leaves.len() as u64,
                    validity: t.validity,
                })
                .collect(),
        }
    }

    /// Returns the layout and the leaves written since the previous call, and forgets them.
    pub fn take_changes(&mut self) -> TreeChanges<L> {
        let mut leaves = Vec::new();
        for (tree, positions) in std::mem::take(&mut self.changed) {
            for position in positions {
                if let Some(leaf) = self.get_leaf(tree, position) {
                    leaves.push(StoredLeaf {
                        tree,
                        position,
                        leaf: leaf.clone(),
                    });
                }
            }
        }
        TreeChanges {
            layout: self.layout(),
            leaves,
        }
    }

    /// Marks every applied leaf as changed, so the next [`Self::take_changes`] returns them all.
    pub fn mark_all_changed(&mut self) {
        self.changed = self
            .trees
            .iter()
            .map(|(number, t)| (*number, (0..t.leaves.len() as u64).collect()))
            .collect();
    }

    /// Root of `tree` as it was right after the leaf at `index` was applied.
    ///
    /// Left siblings on the path are complete subtrees, so their current value is also their
    /// historical one; right siblings were empty at that point.
    pub fn historical_root(&self, tree: u32, index: u64) -> Option<MerkleHash> {
        let t = self.trees.get(&tree)?;
        let mut current = *t.nodes[0].get(index as usize)?;
        let mut node_index = index as usize;
        for level in 0..self.depth as usize {
            current = if node_index % 2 == 0 {
                MerkleHash::combine(Level::from(level as u8), &current, &self.zeros[level])
            } else {
                MerkleHash::combine(
                    Level::from(level as u8),
                    &t.nodes[level][node_index - 1],
                    &current,
                )
            };
            node_index >>= 1;
        }
        Some(current)
    }

    /// Inclusion proof for an applied leaf against the current root of its tree.
    pub fn merkle_proof(&self, tree: u32, index: u64) -> Option<MerkleProof> {
        let t = self.trees.get(&tree)?;
        let leaf = *t.nodes[0].get(index as usize)?;
        let mut elements = Vec::with_capacity(self.depth as usize);
        let mut node_index = index as usize;
        for level in 0..self.depth as usize {
            let sibling = t.nodes[level]
                .get(node_index ^ 1)
                .copied()
                .unwrap_or(self.zeros[level]);
            elements.push(sibling);
            node_index >>= 1;
        }
        Some(MerkleProof::from_parts(
            leaf,
            elements,
            index,
            self.root(tree),
        ))
    }
}

// recomputes every node above leaf `index`, which must be the last leaf of its subtree at
// each level or have all of its left siblings present
fn update_path<L>(t: &mut Tree<L>, zeros: &[MerkleHash], depth: u8, index: usize) {
    let mut node_index = index;
    for level in 0..depth as usize {
        let left_index = node_index & !1;
        let left = t.nodes[level][left_index];
        let right = t.nodes[level]
            .get(left_index + 1)
            .copied()
            .unwrap_or(zeros[level]);
        let parent = MerkleHash::combine(Level::from(level as u8), &left, &right);
        let parent_index = node_index >> 1;
        let upper = &mut t.nodes[level + 1];
        if parent_index < upper.len() {
            upper[parent_index] = parent;
        } else {
            upper.push(parent);
        }
        node_index = parent_index;
    }
}
