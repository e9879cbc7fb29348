//! The UTXO commitment tree with its nullifier and unshield side tables.
//!
//! Side tables are persisted as append only logs: each new nullifier, and each new or updated
//! unshield, is one log entry. Replaying a log in order gives the current table.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use getset::{CopyGetters, Getters};

use railgun_config::Chain;

use crate::hash::MerkleHash;
use crate::merkletree::error::MerkletreeError;
use crate::merkletree::{Merkletree, StoredLeaf, TreeLayout};
use crate::primitives::{Commitment, Nullifier, Txid, TxidVersion, UnshieldStoredEvent};
use crate::traits::ValidateMerkleroot;

/// Commitment tree for one (chain, txid version).
///
/// Side tables are independent of tree validity: nullifiers and unshields are stored as soon
/// as they are delivered.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct UtxoMerkletree {
    /// Network of this tree
    #[getset(get_copy = "pub")]
    chain: Chain,
    /// Transaction format of this tree
    #[getset(get_copy = "pub")]
    txid_version: TxidVersion,
    /// Commitment leaves and nodes
    #[getset(get = "pub")]
    merkletree: Merkletree<Commitment>,
    nullifiers: BTreeMap<MerkleHash, Nullifier>,
    unshields: BTreeMap<(Txid, MerkleHash), UnshieldStoredEvent>,
    new_nullifiers: Vec<Nullifier>,
    changed_unshields: BTreeSet<(Txid, MerkleHash)>,
    nullifier_log_len: u64,
    unshield_log_len: u64,
}

/// Stored summary of a [`UtxoMerkletree`]: its tree layout and side table log lengths.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct UtxoMeta {
    /// Commitment tree shape
    #[getset(get = "pub")]
    layout: TreeLayout,
    /// Stored nullifier log entries
    #[getset(get_copy = "pub")]
    nullifier_log_len: u64,
    /// Stored unshield log entries
    #[getset(get_copy = "pub")]
    unshield_log_len: u64,
}

impl UtxoMeta {
    /// Version written at the start of [`Self::write`]
    pub fn serialized_version() -> u64 {
        1
    }

    /// Deserialize a stored meta
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let _version = reader.read_u64::<LittleEndian>()?;
        let layout = TreeLayout::read(&mut reader)?;
        Ok(UtxoMeta {
            layout,
            nullifier_log_len: reader.read_u64::<LittleEndian>()?,
            unshield_log_len: reader.read_u64::<LittleEndian>()?,
        })
    }

    /// Serialize into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(Self::serialized_version())?;
        self.layout.write(&mut writer)?;
        writer.write_u64::<LittleEndian>(self.nullifier_log_len)?;
        writer.write_u64::<LittleEndian>(self.unshield_log_len)
    }
}

/// What a [`UtxoMerkletree`] changed since the previous [`UtxoMerkletree::take_changes`].
///
/// Log entries carry their index in the nullifier or unshield log.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct UtxoChanges {
    /// Network of the tree
    #[getset(get_copy = "pub")]
    chain: Chain,
    /// Transaction format of the tree
    #[getset(get_copy = "pub")]
    txid_version: TxidVersion,
    /// Meta to write after everything else
    #[getset(get = "pub")]
    meta: UtxoMeta,
    /// Commitments written since the last take
    #[getset(get = "pub")]
    leaves: Vec<StoredLeaf<Commitment>>,
    /// New nullifier log entries
    #[getset(get = "pub")]
    nullifiers: Vec<(u64, Nullifier)>,
    /// New unshield log entries
    #[getset(get = "pub")]
    unshields: Vec<(u64, UnshieldStoredEvent)>,
}

impl UtxoMerkletree {
    /// Creates an empty tree with empty side tables.
    pub fn new(chain: Chain, txid_version: TxidVersion, depth: u8) -> Self {
        UtxoMerkletree {
            chain,
            txid_version,
            merkletree: Merkletree::new(depth),
            nullifiers: BTreeMap::new(),
            unshields: BTreeMap::new(),
            new_nullifiers: Vec::new(),
            changed_unshields: BTreeSet::new(),
            nullifier_log_len: 0,
            unshield_log_len: 0,
        }
    }

    /// Reassembles a tree from stored parts. Later log entries replace earlier ones.
    pub fn from_stored(
        chain: Chain,
        txid_version: TxidVersion,
        merkletree: Merkletree<Commitment>,
        nullifier_log: Vec<Nullifier>,
        unshield_log: Vec<UnshieldStoredEvent>,
    ) -> Self {
        let nullifier_log_len = nullifier_log.len() as u64;
        let unshield_log_len = unshield_log.len() as u64;
        UtxoMerkletree {
            chain,
            txid_version,
            merkletree,
            nullifiers: nullifier_log
                .into_iter()
                .map(|n| (n.nullifier, n))
                .collect(),
            unshields: unshield_log
                .into_iter()
                .map(|u| ((u.txid, u.token_hash()), u))
                .collect(),
            new_nullifiers: Vec::new(),
            changed_unshields: BTreeSet::new(),
            nullifier_log_len,
            unshield_log_len,
        }
    }

    /// Buffers commitments at `start_position..` of `tree`.
    pub fn queue_leaves(
        &mut self,
        tree: u32,
        start_position: u64,
        commitments: Vec<Commitment>,
    ) -> Result<(), MerkletreeError> {
        self.merkletree
            .queue_leaves(tree, start_position, commitments)
    }

    /// Applies every contiguous queued run and checks each new root with `validator`.
    ///
    /// A rejected root, or a validator that cannot answer, rolls the batch back and marks the
    /// tree invalid from the batch start. Returns the number of leaves applied and validated.
    pub async fn apply_queue<V>(&mut self, validator: &V) -> u64
    where
        V: ValidateMerkleroot + Sync + ?Sized,
    {
        let mut validated_leaves = 0;
        for tree in self.merkletree.queued_trees() {
            let Some(batch) = self.merkletree.apply_next_batch(tree) else {
                continue;
            };
            let is_valid = match validator
                .validate_merkleroot(self.chain, self.txid_version, tree, batch.root())
                .await
            {
                Ok(is_valid) => is_valid,
                Err(e) => {
                    tracing::warn!(
                        "[{}] merkleroot validation unavailable for {} tree {}: {:?}",
                        self.txid_version,
                        self.chain,
                        tree,
                        e
                    );
                    false
                }
            };

            if is_valid {
                self.merkletree.confirm_batch(&batch);
                validated_leaves += batch.len();
            } else {
                tracing::warn!(
                    "[{}] invalid merkleroot for {} tree {}: {} leaves from position {} rolled back",
                    self.txid_version,
                    self.chain,
                    tree,
                    batch.len(),
                    batch.start()
                );
                self.merkletree.reject_batch(&batch);
            }
        }
        validated_leaves
    }

    #[cfg(test)]
    pub(crate) fn apply_queue_unvalidated(&mut self) {
        self.merkletree.apply_queue_unvalidated();
    }

    /// Applied commitment at `(tree, position)`.
    pub fn get_commitment(&self, tree: u32, position: u64) -> Option<&Commitment> {
        self.merkletree.get_leaf(tree, position)
    }

    /// Lowest tree with a rejected root.
    pub fn first_invalid_tree(&self) -> Option<u32> {
        self.merkletree.first_invalid_tree()
    }

    /// Highest tree holding a leaf, or 0.
    pub fn latest_tree(&self) -> u32 {
        self.merkletree.latest_tree()
    }

    /// Current root of `tree`.
    pub fn root(&self, tree: u32) -> MerkleHash {
        self.merkletree.root(tree)
    }

    /// Sets the railgun txid of an applied transact commitment.
    ///
    /// Returns `false` when nothing is stored at the position yet; the caller retries on a later
    /// pass. Non-transact commitments are left untouched.
    pub fn backfill_railgun_txid(
        &mut self,
        tree: u32,
        position: u64,
        railgun_txid: MerkleHash,
    ) -> bool {
        match self.merkletree.get_leaf_mut(tree, position) {
            Some(commitment) => {
                commitment.set_railgun_txid(railgun_txid);
                true
            }
            None => false,
        }
    }

    /// Stores spent nullifiers. Re-delivered nullifiers are not logged again.
    pub fn record_nullifiers(&mut self, nullifiers: &[Nullifier]) {
        for nullifier in nullifiers {
            if self.nullifiers.get(&nullifier.nullifier) == Some(nullifier) {
                continue;
            }
            self.nullifiers
                .insert(nullifier.nullifier, nullifier.clone());
            self.new_nullifiers.push(nullifier.clone());
        }
    }

    /// Transaction that spent `nullifier`.
    pub fn get_nullifier_txid(&self, nullifier: &MerkleHash) -> Option<Txid> {
        self.nullifiers.get(nullifier).map(|n| n.txid)
    }

    /// The spending transaction, if every nullifier is recorded and all share one transaction.
    pub fn get_completed_txid_from_nullifiers(&self, nullifiers: &[MerkleHash]) -> Option<Txid> {
        let (first, rest) = nullifiers.split_first()?;
        let txid = self.get_nullifier_txid(first)?;
        rest.iter()
            .all(|nullifier| self.get_nullifier_txid(nullifier) == Some(txid))
            .then_some(txid)
    }

    /// Stores unshield events. The whole call is rejected if any event has zero value or
    /// conflicts with a stored event for the same `(txid, token hash)`.
    pub fn record_unshield_events(
        &mut self,
        events: Vec<UnshieldStoredEvent>,
    ) -> Result<(), MerkletreeError> {
        for event in &events {
            if event.amount == 0 && event.fee == 0 {
                return Err(MerkletreeError::InvalidUnshieldAmount { txid: event.txid });
            }
            let key = (event.txid, event.token_hash());
            if let Some(stored) = self.unshields.get(&key) {
                if !stored.same_event_as(event) {
                    return Err(MerkletreeError::DuplicateUnshield {
                        txid: key.0,
                        token_hash: key.1,
                    });
                }
            }
        }

        for mut event in events {
            let key = (event.txid, event.token_hash());
            if let Some(stored) = self.unshields.get(&key) {
                event.railgun_txid = event.railgun_txid.or(stored.railgun_txid);
            }
            self.unshields.insert(key, event);
            self.changed_unshields.insert(key);
        }
        Ok(())
    }

    /// Replaces the stored unshield keyed by `(txid, token_hash)`.
    pub fn update_unshield_event(
        &mut self,
        txid: Txid,
        token_hash: MerkleHash,
        event: UnshieldStoredEvent,
    ) -> Result<(), MerkletreeError> {
        let actual = event.token_hash();
        if actual != token_hash {
            return Err(MerkletreeError::TokenHashMismatch {
                expected: token_hash,
                actual,
            });
        }
        match self.unshields.get_mut(&(txid, token_hash)) {
            Some(stored) => {
                *stored = event;
                self.changed_unshields.insert((txid, token_hash));
                Ok(())
            }
            None => Err(MerkletreeError::UnshieldNotFound { txid, token_hash }),
        }
    }

    /// Every unshield stored for `txid`, one per token.
    pub fn get_all_unshield_events_for_txid(&self, txid: &Txid) -> Vec<&UnshieldStoredEvent> {
        self.unshields
            .range((*txid, MerkleHash::ZERO)..=(*txid, MerkleHash([0xff; 32])))
            .map(|(_, event)| event)
            .collect()
    }

    /// Block of the latest applied commitment, searching back from the first invalid tree, or
    /// from the latest tree when all are valid.
    pub fn most_recent_valid_commitment_block(&self) -> Option<u64> {
        let search_tree = self
            .first_invalid_tree()
            .unwrap_or_else(|| self.latest_tree());
        (0..=search_tree).rev().find_map(|tree| {
            let leaves = self.merkletree.tree(tree)?.leaves();
            leaves.iter().rev().find_map(|leaf| leaf.block_number)
        })
    }

    /// Wipes the tree and both side tables.
    pub fn clear(&mut self) {
        self.merkletree.clear();
        self.nullifiers.clear();
        self.unshields.clear();
        self.new_nullifiers.clear();
        self.changed_unshields.clear();
        self.nullifier_log_len = 0;
        self.unshield_log_len = 0;
    }

    /// Returns everything changed since the previous call and forgets it.
    pub fn take_changes(&mut self) -> UtxoChanges {
        let (layout, leaves) = self.merkletree.take_changes().into_parts();

        let nullifiers: Vec<(u64, Nullifier)> = (self.nullifier_log_len..)
            .zip(std::mem::take(&mut self.new_nullifiers))
            .collect();
        self.nullifier_log_len += nullifiers.len() as u64;

        let changed: Vec<UnshieldStoredEvent> = std::mem::take(&mut self.changed_unshields)
            .into_iter()
            .filter_map(|key| self.unshields.get(&key).cloned())
            .collect();
        let unshields: Vec<(u64, UnshieldStoredEvent)> =
            (self.unshield_log_len..).zip(changed).collect();
        self.unshield_log_len += unshields.len() as u64;

        UtxoChanges {
            chain: self.chain,
            txid_version: self.txid_version,
            meta: UtxoMeta {
                layout,
                nullifier_log_len: self.nullifier_log_len,
                unshield_log_len: self.unshield_log_len,
            },
            leaves,
            nullifiers,
            unshields,
        }
    }

    /// Marks every leaf and side table entry as changed, restarting both logs. Used after a
    /// failed write, when the store may hold only part of the last changes.
    pub fn mark_all_changed(&mut self) {
        self.merkletree.mark_all_changed();
        self.new_nullifiers = self.nullifiers.values().cloned().collect();
        self.nullifier_log_len = 0;
        self.changed_unshields = self.unshields.keys().copied().collect();
        self.unshield_log_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{CommitmentKind, TokenData};
    use crate::traits::SyncInterface;

    struct RejectTree(Option<u32>);

    impl SyncInterface for RejectTree {
        type Error = String;
    }

    #[async_trait::async_trait]
    impl ValidateMerkleroot for RejectTree {
        async fn validate_merkleroot(
            &self,
            _chain: Chain,
            _txid_version: TxidVersion,
            tree: u32,
            _root: MerkleHash,
        ) -> Result<bool, String> {
            Ok(self.0 != Some(tree))
        }
    }

    fn transact(tree: u32, index: u64, block: Option<u64>) -> Commitment {
        Commitment {
            hash: MerkleHash::from_u64(tree as u64 * 100 + index + 1),
            txid: MerkleHash::from_u64(index),
            block_number: block,
            timestamp: None,
            utxo_tree: tree,
            utxo_index: index,
            kind: CommitmentKind::Transact {
                ciphertext: vec![],
                railgun_txid: None,
            },
        }
    }

    fn unshield(txid: u64, amount: u128) -> UnshieldStoredEvent {
        UnshieldStoredEvent {
            txid: MerkleHash::from_u64(txid),
            token: TokenData::erc20([3u8; 20]),
            to_address: [4u8; 20],
            amount,
            fee: 0,
            block_number: 5,
            event_log_index: Some(1),
            railgun_txid: None,
            timestamp: None,
        }
    }

    fn utxo_tree() -> UtxoMerkletree {
        UtxoMerkletree::new(Chain::evm(1), TxidVersion::V2PoseidonMerkle, 4)
    }

    #[tokio::test]
    async fn rejected_root_marks_only_that_tree() {
        let mut utxo = utxo_tree();
        utxo.queue_leaves(0, 0, vec![transact(0, 0, Some(1))])
            .unwrap();
        utxo.queue_leaves(1, 0, vec![transact(1, 0, Some(9))])
            .unwrap();

        let validated = utxo.apply_queue(&RejectTree(Some(1))).await;

        assert_eq!(validated, 1);
        assert_eq!(utxo.first_invalid_tree(), Some(1));
        assert!(utxo.get_commitment(0, 0).is_some());
        assert!(utxo.get_commitment(1, 0).is_none());
    }

    #[tokio::test]
    async fn resume_block_walks_back_past_blockless_leaves() {
        let mut utxo = utxo_tree();
        utxo.queue_leaves(
            0,
            0,
            vec![
                transact(0, 0, Some(10)),
                transact(0, 1, Some(12)),
                transact(0, 2, None),
            ],
        )
        .unwrap();
        utxo.apply_queue(&RejectTree(None)).await;
        assert_eq!(utxo.most_recent_valid_commitment_block(), Some(12));

        // an empty invalid tree falls back to the tree before it
        utxo.queue_leaves(1, 0, vec![transact(1, 0, Some(40))])
            .unwrap();
        utxo.apply_queue(&RejectTree(Some(1))).await;
        assert_eq!(utxo.most_recent_valid_commitment_block(), Some(12));
    }

    #[tokio::test]
    async fn backfill_is_a_no_op_for_missing_positions() {
        let mut utxo = utxo_tree();
        let railgun_txid = MerkleHash::from_u64(77);
        assert!(!utxo.backfill_railgun_txid(0, 0, railgun_txid));

        utxo.queue_leaves(0, 0, vec![transact(0, 0, Some(1))])
            .unwrap();
        utxo.apply_queue(&RejectTree(None)).await;
        let root = utxo.root(0);

        assert!(utxo.backfill_railgun_txid(0, 0, railgun_txid));
        assert_eq!(
            utxo.get_commitment(0, 0).unwrap().railgun_txid(),
            Some(railgun_txid)
        );
        assert_eq!(utxo.root(0), root);
    }

    #[test]
    fn zero_value_unshield_is_rejected() {
        let mut utxo = utxo_tree();
        assert!(matches!(
            utxo.record_unshield_events(vec![unshield(1, 10), unshield(2, 0)]),
            Err(MerkletreeError::InvalidUnshieldAmount { .. })
        ));
        assert!(utxo
            .get_all_unshield_events_for_txid(&MerkleHash::from_u64(1))
            .is_empty());
    }

    #[test]
    fn conflicting_unshield_is_rejected_and_identical_is_idempotent() {
        let mut utxo = utxo_tree();
        utxo.record_unshield_events(vec![unshield(1, 10)]).unwrap();
        utxo.record_unshield_events(vec![unshield(1, 10)]).unwrap();
        assert!(matches!(
            utxo.record_unshield_events(vec![unshield(1, 11)]),
            Err(MerkletreeError::DuplicateUnshield { .. })
        ));

        let mut other_token = unshield(1, 5);
        other_token.token = TokenData::erc20([8u8; 20]);
        utxo.record_unshield_events(vec![other_token]).unwrap();
        assert_eq!(
            utxo.get_all_unshield_events_for_txid(&MerkleHash::from_u64(1))
                .len(),
            2
        );
    }

    #[test]
    fn update_unshield_checks_token_hash() {
        let mut utxo = utxo_tree();
        let event = unshield(1, 10);
        utxo.record_unshield_events(vec![event.clone()]).unwrap();

        let mut updated = event.clone();
        updated.railgun_txid = Some(MerkleHash::from_u64(3));
        assert!(matches!(
            utxo.update_unshield_event(event.txid, MerkleHash::from_u64(1), updated.clone()),
            Err(MerkletreeError::TokenHashMismatch { .. })
        ));
        utxo.update_unshield_event(event.txid, event.token_hash(), updated)
            .unwrap();
        assert_eq!(
            utxo.get_all_unshield_events_for_txid(&event.txid)[0].railgun_txid,
            Some(MerkleHash::from_u64(3))
        );
    }

    #[test]
    fn completed_txid_needs_every_nullifier_from_one_transaction() {
        let mut utxo = utxo_tree();
        let spend = |nullifier: u64, txid: u64| Nullifier {
            txid: MerkleHash::from_u64(txid),
            nullifier: MerkleHash::from_u64(nullifier),
            tree_number: 0,
            block_number: 3,
        };
        utxo.record_nullifiers(&[spend(1, 50), spend(2, 50), spend(3, 51)]);

        let n = MerkleHash::from_u64;
        assert_eq!(
            utxo.get_completed_txid_from_nullifiers(&[n(1), n(2)]),
            Some(MerkleHash::from_u64(50))
        );
        assert_eq!(utxo.get_completed_txid_from_nullifiers(&[n(1), n(3)]), None);
        assert_eq!(utxo.get_completed_txid_from_nullifiers(&[n(1), n(4)]), None);
        assert_eq!(utxo.get_nullifier_txid(&n(3)), Some(MerkleHash::from_u64(51)));
    }

    fn spend(nullifier: u64, txid: u64) -> Nullifier {
        Nullifier {
            txid: MerkleHash::from_u64(txid),
            nullifier: MerkleHash::from_u64(nullifier),
            tree_number: 0,
            block_number: 1,
        }
    }

    #[tokio::test]
    async fn changes_rebuild_tree_and_side_tables() {
        let mut utxo = utxo_tree();
        utxo.queue_leaves(0, 0, vec![transact(0, 0, Some(1))])
            .unwrap();
        utxo.apply_queue(&RejectTree(None)).await;
        let event = unshield(1, 10);
        utxo.record_unshield_events(vec![event.clone()]).unwrap();
        utxo.record_nullifiers(&[spend(9, 2)]);
        let first = utxo.take_changes();

        let mut updated = event.clone();
        updated.railgun_txid = Some(MerkleHash::from_u64(3));
        utxo.update_unshield_event(event.txid, event.token_hash(), updated)
            .unwrap();
        let second = utxo.take_changes();
        assert!(second.leaves().is_empty());
        assert!(second.nullifiers().is_empty());
        assert_eq!(second.unshields()[0].0, 1);

        let mut bytes = Vec::new();
        second.meta().write(&mut bytes).unwrap();
        let meta = UtxoMeta::read(&bytes[..]).unwrap();
        assert_eq!(meta.unshield_log_len(), 2);
        assert_eq!(meta.nullifier_log_len(), 1);

        let merkletree = Merkletree::from_layout(meta.layout(), |tree, position| {
            first
                .leaves()
                .iter()
                .find(|l| l.tree() == tree && l.position() == position)
                .map(|l| l.leaf().clone())
                .ok_or(())
        })
        .unwrap();
        let unshield_log = first
            .unshields()
            .iter()
            .chain(second.unshields())
            .map(|(_, u)| u.clone())
            .collect();
        let nullifier_log = first.nullifiers().iter().map(|(_, n)| n.clone()).collect();
        let restored = UtxoMerkletree::from_stored(
            Chain::evm(1),
            TxidVersion::V2PoseidonMerkle,
            merkletree,
            nullifier_log,
            unshield_log,
        );

        assert_eq!(restored.root(0), utxo.root(0));
        assert_eq!(
            restored.get_nullifier_txid(&MerkleHash::from_u64(9)),
            Some(MerkleHash::from_u64(2))
        );
        let stored = restored.get_all_unshield_events_for_txid(&MerkleHash::from_u64(1));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].railgun_txid, Some(MerkleHash::from_u64(3)));
    }

    #[test]
    fn redelivered_side_table_entries_are_logged_once() {
        let mut utxo = utxo_tree();
        utxo.record_nullifiers(&[spend(1, 5), spend(2, 5)]);
        utxo.record_unshield_events(vec![unshield(1, 10)]).unwrap();
        utxo.take_changes();

        utxo.record_nullifiers(&[spend(1, 5), spend(3, 6)]);
        utxo.record_unshield_events(vec![unshield(1, 10)]).unwrap();
        let changes = utxo.take_changes();
        assert_eq!(changes.nullifiers().len(), 1);
        assert_eq!(changes.nullifiers()[0].0, 2);
        // an identical unshield rewrites its entry
        assert_eq!(changes.unshields().len(), 1);

        utxo.mark_all_changed();
        let all = utxo.take_changes();
        assert_eq!(all.nullifiers().len(), 3);
        assert_eq!(all.nullifiers()[0].0, 0);
        assert_eq!(all.meta().unshield_log_len(), 1);
    }

    #[test]
    fn clear_restarts_the_logs() {
        let mut utxo = utxo_tree();
        utxo.record_nullifiers(&[spend(1, 5)]);
        utxo.take_changes();
        utxo.clear();
        let changes = utxo.take_changes();
        assert_eq!(changes.meta().nullifier_log_len(), 0);
        assert!(changes.meta().layout().trees().is_empty());
    }
}
