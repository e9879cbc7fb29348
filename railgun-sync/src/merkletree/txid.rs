//! The railgun txid tree.
//!
//! Leaves are appended in indexer order. For V2 every transaction must extend the verification
//! hash chain of the one before it; a break is treated as a shallow reorg of the tail.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use getset::{CopyGetters, Getters};

use railgun_config::Chain;

use crate::hash::{verification_hash, MerkleHash};
use crate::merkletree::error::MerkletreeError;
use crate::merkletree::{Merkletree, StoredLeaf, TreeLayout};
use crate::primitives::{
    global_utxo_position, RailgunTransaction, RailgunTransactionWithHash, TxidVersion,
};

/// Result of [`TxidMerkletree::queue_railgun_transactions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// This many transactions were queued.
    Queued(usize),
    /// The tree already reaches the externally validated index.
    Skipped,
    /// A verification hash did not extend the chain. Nothing from the batch was queued and
    /// `truncated` committed leaves were dropped from the tail.
    ChainBreak {
        /// Committed leaves removed from the tail
        truncated: u64,
    },
}

/// Stored summary of a [`TxidMerkletree`].
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct TxidMeta {
    /// Transaction tree shape
    #[getset(get = "pub")]
    layout: TreeLayout,
    /// Capacity of the UTXO trees the transactions point into
    #[getset(get_copy = "pub")]
    utxo_tree_capacity: u64,
}

impl TxidMeta {
    /// Version written at the start of [`Self::write`]
    pub fn serialized_version() -> u64 {
        1
    }

    /// Deserialize a stored meta
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let _version = reader.read_u64::<LittleEndian>()?;
        let layout = TreeLayout::read(&mut reader)?;
        Ok(TxidMeta {
            layout,
            utxo_tree_capacity: reader.read_u64::<LittleEndian>()?,
        })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(Self::serialized_version())?;
        self.layout.write(&mut writer)?;
        writer.write_u64::<LittleEndian>(self.utxo_tree_capacity)
    }
}

/// What a [`TxidMerkletree`] changed since the previous [`TxidMerkletree::take_changes`].
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct TxidChanges {
    /// Network of the tree
    #[getset(get_copy = "pub")]
    chain: Chain,
    /// Transaction format of the tree
    #[getset(get_copy = "pub")]
    txid_version: TxidVersion,
    /// Meta to write after the leaves
    #[getset(get = "pub")]
    meta: TxidMeta,
    /// Transactions written since the last take
    #[getset(get = "pub")]
    leaves: Vec<StoredLeaf<RailgunTransactionWithHash>>,
}

/// Txid tree for one (chain, txid version).
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct TxidMerkletree {
    /// Network of this tree
    #[getset(get_copy = "pub")]
    chain: Chain,
    /// Transaction format of this tree
    #[getset(get_copy = "pub")]
    txid_version: TxidVersion,
    /// Transaction leaves and nodes
    #[getset(get = "pub")]
    merkletree: Merkletree<RailgunTransactionWithHash>,
    /// Capacity of the UTXO trees the transactions point into
    #[getset(get_copy = "pub")]
    utxo_tree_capacity: u64,
}

impl TxidMerkletree {
    /// Creates an empty tree. `utxo_tree_capacity` converts UTXO positions to global ones.
    pub fn new(chain: Chain, txid_version: TxidVersion, depth: u8, utxo_tree_capacity: u64) -> Self {
        TxidMerkletree {
            chain,
            txid_version,
            merkletree: Merkletree::new(depth),
            utxo_tree_capacity,
        }
    }

    /// Reassembles a tree from its stored meta and leaves.
    pub fn from_stored(
        chain: Chain,
        txid_version: TxidVersion,
        merkletree: Merkletree<RailgunTransactionWithHash>,
        utxo_tree_capacity: u64,
    ) -> Self {
        TxidMerkletree {
            chain,
            txid_version,
            merkletree,
            utxo_tree_capacity,
        }
    }

    /// Linearises a `(tree, index)` pair of this tree.
    pub fn global_position(&self, tree: u32, index: u64) -> u64 {
        tree as u64 * self.merkletree.capacity() + index
    }

    /// Inverse of [`Self::global_position`].
    pub fn tree_and_index(&self, global_position: u64) -> (u32, u64) {
        let capacity = self.merkletree.capacity();
        ((global_position / capacity) as u32, global_position % capacity)
    }

    /// Position of the latest applied transaction.
    pub fn latest_tree_and_index(&self) -> Option<(u32, u64)> {
        self.merkletree
            .last_applied_leaf()
            .map(|(tree, index, _)| (tree, index))
    }

    /// Latest applied transaction; its graph id is the indexer cursor.
    pub fn latest_transaction(&self) -> Option<&RailgunTransactionWithHash> {
        self.merkletree
            .last_applied_leaf()
            .map(|(_, _, transaction)| transaction)
    }

    /// Global position of the latest applied transaction.
    pub fn latest_global_index(&self) -> Option<u64> {
        self.latest_tree_and_index()
            .map(|(tree, index)| self.global_position(tree, index))
    }

    /// Global index and latest tree root, as reported to POI validators.
    pub fn latest_railgun_txid_data(&self) -> (Option<u64>, MerkleHash) {
        let root = self.merkletree.root(self.merkletree.latest_tree());
        (self.latest_global_index(), root)
    }

    /// Applied transaction at `(tree, index)`.
    pub fn get_transaction(&self, tree: u32, index: u64) -> Option<&RailgunTransactionWithHash> {
        self.merkletree.get_leaf(tree, index)
    }

    /// Whether the local tree already reaches `latest_validated_index`.
    pub fn is_synced_to_validated_index(&self, latest_validated_index: u64) -> bool {
        self.latest_global_index()
            .is_some_and(|latest| latest >= latest_validated_index)
    }

    /// Checks and queues `transactions` after every applied and queued leaf.
    ///
    /// On a V2 verification hash break the pending queue is dropped, `truncation_depth` leaves
    /// are removed from the committed tail and the rest of the batch is not accepted.
    pub fn queue_railgun_transactions(
        &mut self,
        transactions: Vec<RailgunTransaction>,
        latest_validated_index: Option<u64>,
        truncation_depth: u64,
    ) -> Result<QueueOutcome, MerkletreeError> {
        if let Some(validated) = latest_validated_index {
            if self.is_synced_to_validated_index(validated) {
                return Ok(QueueOutcome::Skipped);
            }
        }

        let tail = self
            .merkletree
            .last_queued_leaf()
            .or_else(|| self.merkletree.last_applied_leaf())
            .map(|(tree, index, leaf)| {
                (
                    self.global_position(tree, index) + 1,
                    leaf.transaction().verification_hash,
                )
            });
        let (mut next_position, mut previous_hash) = tail.unwrap_or((0, None));

        let mut to_queue = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            if self.txid_version == TxidVersion::V2PoseidonMerkle {
                let expected = transaction
                    .nullifiers
                    .first()
                    .map(|first| verification_hash(previous_hash, first));
                if expected.is_none() || transaction.verification_hash != expected {
                    tracing::error!(
                        "[{}] invalid verification hash for {} txid {}: stopping queue of railgun txids",
                        self.txid_version,
                        self.chain,
                        transaction.txid
                    );
                    self.merkletree.clear_write_queue();
                    let truncated = self.truncate_tail(truncation_depth);
                    return Ok(QueueOutcome::ChainBreak { truncated });
                }
                previous_hash = expected;
            }
            to_queue.push(RailgunTransactionWithHash::new(
                transaction,
                self.utxo_tree_capacity,
            ));
        }

        let queued = to_queue.len();
        for transaction in to_queue {
            let (tree, index) = self.tree_and_index(next_position);
            self.merkletree.queue_leaves(tree, index, vec![transaction])?;
            next_position += 1;
        }
        Ok(QueueOutcome::Queued(queued))
    }

    /// Drops queued transactions that were never applied.
    pub fn clear_write_queue(&mut self) {
        self.merkletree.clear_write_queue();
    }

    /// Applies queued transactions. Returns the number of leaves added.
    pub fn apply_queue(&mut self) -> u64 {
        self.merkletree
            .apply_queue_unvalidated()
            .iter()
            .map(|batch| batch.len())
            .sum()
    }

    /// Removes up to `count` leaves from the tail. Returns the number removed.
    pub fn truncate_tail(&mut self, count: u64) -> u64 {
        let total = self.latest_global_index().map_or(0, |latest| latest + 1);
        let kept = total.saturating_sub(count);
        self.keep_leaves(kept);
        total - kept
    }

    /// Removes every leaf after `global_index`.
    pub fn clear_leaves_after_index(&mut self, global_index: u64) {
        self.keep_leaves(global_index + 1);
    }

    fn keep_leaves(&mut self, count: u64) {
        let (tree, index) = self.tree_and_index(count);
        self.merkletree.remove_trees_after(tree);
        self.merkletree.truncate_tree(tree, index, true);
    }

    /// Root of `tree` right after the transaction at `index` was applied.
    pub fn historical_root(&self, tree: u32, index: u64) -> Option<MerkleHash> {
        self.merkletree.historical_root(tree, index)
    }

    /// Compares a root claimed by a validator with the stored history.
    pub fn validate_historical_root(&self, tree: u32, index: u64, root: &MerkleHash) -> bool {
        self.historical_root(tree, index).as_ref() == Some(root)
    }

    /// Whether the transaction at `(tree, index)` was mined before `block_number`.
    pub fn occurred_before_block(&self, tree: u32, index: u64, block_number: u64) -> bool {
        self.get_transaction(tree, index)
            .is_some_and(|t| t.transaction().block_number < block_number)
    }

    /// Global UTXO position of the first output of the transaction at `(tree, index)`.
    pub fn global_utxo_position_for_transaction(&self, tree: u32, index: u64) -> Option<u64> {
        self.get_transaction(tree, index).map(|t| {
            global_utxo_position(
                t.transaction().utxo_tree_out,
                t.transaction().utxo_batch_start_position_out,
                self.utxo_tree_capacity,
            )
        })
    }

    /// Wipes every transaction and the queue.
    pub fn clear(&mut self) {
        self.merkletree.clear();
    }

    /// Returns the leaves written since the previous call and the current meta.
    pub fn take_changes(&mut self) -> TxidChanges {
        let (layout, leaves) = self.merkletree.take_changes().into_parts();
        TxidChanges {
            chain: self.chain,
            txid_version: self.txid_version,
            meta: TxidMeta {
                layout,
                utxo_tree_capacity: self.utxo_tree_capacity,
            },
            leaves,
        }
    }

    /// Marks every transaction as changed. Used after a failed write.
    pub fn mark_all_changed(&mut self) {
        self.merkletree.mark_all_changed();
    }
}
