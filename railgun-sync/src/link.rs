//! Back-references from the UTXO tree to the railgun transactions that produced its leaves.
//!
//! The txid feed can run ahead of the UTXO feed. Transactions are linked in feed order and
//! linking stops at the first one whose outputs are not all stored yet.

use std::collections::BTreeMap;

use crate::hash::MerkleHash;
use crate::merkletree::error::MerkletreeError;
use crate::merkletree::utxo::UtxoMerkletree;
use crate::primitives::{RailgunTransactionWithHash, Txid, UnshieldStoredEvent};

/// Splits a pre-V2 unshield value into `(amount, fee)`.
pub(crate) fn amount_fee_from_value(value: u128, fee_bps: u128) -> (u128, u128) {
    let fee = value * fee_bps / 10_000;
    (value - fee, fee)
}

fn is_pre_v2(transaction: &RailgunTransactionWithHash, engine_v2_start_block: u64) -> bool {
    transaction.transaction().block_number < engine_v2_start_block
}

/// Number of leading `transactions` whose unshield and standard outputs are all present in
/// `utxo`, and whose pre-V2 unshields can be stored without a conflict. Nothing is modified.
pub(crate) fn linkable_prefix(
    utxo: &UtxoMerkletree,
    transactions: &[RailgunTransactionWithHash],
    engine_v2_start_block: u64,
    fee_bps: u128,
) -> usize {
    let mut synthesised: BTreeMap<(Txid, MerkleHash), UnshieldStoredEvent> = BTreeMap::new();
    for (i, transaction) in transactions.iter().enumerate() {
        if let Some(missing) = missing_dependency(utxo, transaction, engine_v2_start_block) {
            tracing::debug!(
                "[{}] stopping link of railgun txids at {}: missing {}",
                utxo.txid_version(),
                transaction.railgun_txid(),
                missing
            );
            return i;
        }
        if !is_pre_v2(transaction, engine_v2_start_block) {
            continue;
        }
        let Some(event) = synthesised_unshield(transaction, fee_bps) else {
            continue;
        };
        let key = (event.txid, event.token_hash());
        let stored = synthesised.get(&key).or_else(|| {
            utxo.get_all_unshield_events_for_txid(&key.0)
                .into_iter()
                .find(|stored| stored.token_hash() == key.1)
        });
        if stored.is_some_and(|stored| !stored.same_event_as(&event)) {
            tracing::warn!(
                "[{}] stopping link of railgun txids at {}: pre-V2 unshield conflicts with stored unshield {} token {}",
                utxo.txid_version(),
                transaction.railgun_txid(),
                key.0,
                key.1
            );
            return i;
        }
        synthesised.insert(key, event);
    }
    transactions.len()
}

fn missing_dependency(
    utxo: &UtxoMerkletree,
    transaction: &RailgunTransactionWithHash,
    engine_v2_start_block: u64,
) -> Option<String> {
    let tx = transaction.transaction();
    if let Some(unshield) = &tx.unshield {
        if !is_pre_v2(transaction, engine_v2_start_block) {
            let token_hash = unshield.token.token_hash();
            let found = utxo
                .get_all_unshield_events_for_txid(&tx.txid)
                .iter()
                .any(|event| event.token_hash() == token_hash);
            if !found {
                return Some(format!("unshield {} token {}", tx.txid, token_hash));
            }
        }
    }

    (0..tx.standard_commitments().len() as u64)
        .map(|i| tx.utxo_batch_start_position_out + i)
        .find(|position| utxo.get_commitment(tx.utxo_tree_out, *position).is_none())
        .map(|position| format!("commitment {}:{}", tx.utxo_tree_out, position))
}

/// The unshield event stored for a pre-V2 transaction, which has no on-chain event of its own.
/// `None` when there is no unshield or its value is zero.
fn synthesised_unshield(
    transaction: &RailgunTransactionWithHash,
    fee_bps: u128,
) -> Option<UnshieldStoredEvent> {
    let tx = transaction.transaction();
    let unshield = tx.unshield.as_ref().filter(|unshield| unshield.value != 0)?;
    let (amount, fee) = amount_fee_from_value(unshield.value, fee_bps);
    Some(UnshieldStoredEvent {
        txid: tx.txid,
        token: unshield.token.clone(),
        to_address: unshield.to_address,
        amount,
        fee,
        block_number: tx.block_number,
        event_log_index: None,
        railgun_txid: Some(transaction.railgun_txid()),
        timestamp: Some(tx.timestamp),
    })
}

/// Back-fills the railgun txid of every output of `transactions` into `utxo`.
///
/// Callers pass a prefix already checked with [`linkable_prefix`]. Pre-V2 unshields have no
/// on-chain event and are stored from the transaction, with the fee taken at `fee_bps`.
pub(crate) fn link_railgun_transactions(
    utxo: &mut UtxoMerkletree,
    transactions: &[RailgunTransactionWithHash],
    engine_v2_start_block: u64,
    fee_bps: u128,
) -> Result<(), MerkletreeError> {
    for transaction in transactions {
        let railgun_txid = transaction.railgun_txid();
        let tx = transaction.transaction();

        if let Some(unshield) = &tx.unshield {
            if !is_pre_v2(transaction, engine_v2_start_block) {
                backfill_unshield(utxo, tx.txid, unshield.token.token_hash(), railgun_txid)?;
            } else if let Some(event) = synthesised_unshield(transaction, fee_bps) {
                utxo.record_unshield_events(vec![event])?;
            } else {
                tracing::warn!(
                    "[{}] zero value pre-V2 unshield in {} not stored",
                    utxo.txid_version(),
                    tx.txid
                );
            }
        }

        for i in 0..tx.standard_commitments().len() as u64 {
            let position = tx.utxo_batch_start_position_out + i;
            if !utxo.backfill_railgun_txid(tx.utxo_tree_out, position, railgun_txid) {
                tracing::warn!(
                    "[{}] commitment {}:{} disappeared before linking",
                    utxo.txid_version(),
                    tx.utxo_tree_out,
                    position
                );
            }
        }
    }
    Ok(())
}

fn backfill_unshield(
    utxo: &mut UtxoMerkletree,
    txid: MerkleHash,
    token_hash: MerkleHash,
    railgun_txid: MerkleHash,
) -> Result<(), MerkletreeError> {
    let stored = utxo
        .get_all_unshield_events_for_txid(&txid)
        .into_iter()
        .find(|event| event.token_hash() == token_hash)
        .cloned();
    match stored {
        Some(event) if event.railgun_txid == Some(railgun_txid) => Ok(()),
        Some(mut event) => {
            event.railgun_txid = Some(railgun_txid);
            utxo.update_unshield_event(txid, token_hash, event)
        }
        None => Err(MerkletreeError::UnshieldNotFound { txid, token_hash }),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use railgun_config::Chain;

    use super::*;
    use crate::primitives::{
        Commitment, CommitmentKind, RailgunTransaction, TokenData, TxidVersion, UnshieldPreimage,
    };

    const CAPACITY: u64 = 1 << 16;
    const V2_START: u64 = 100;

    fn transact(tree: u32, index: u64) -> Commitment {
        Commitment {
            hash: MerkleHash::from_u64(1_000 + index),
            txid: MerkleHash::from_u64(7),
            block_number: Some(150),
            timestamp: None,
            utxo_tree: tree,
            utxo_index: index,
            kind: CommitmentKind::Transact {
                ciphertext: vec![1, 2, 3],
                railgun_txid: None,
            },
        }
    }

    fn utxo_with_leaves(count: u64) -> UtxoMerkletree {
        let mut utxo = UtxoMerkletree::new(Chain::evm(1), TxidVersion::V2PoseidonMerkle, 16);
        let leaves = (0..count).map(|i| transact(0, i)).collect();
        utxo.queue_leaves(0, 0, leaves).unwrap();
        utxo.apply_queue_unvalidated();
        utxo
    }

    fn transaction(
        start: u64,
        outputs: u64,
        unshield: Option<UnshieldPreimage>,
        block_number: u64,
    ) -> RailgunTransactionWithHash {
        let mut commitments: Vec<MerkleHash> =
            (0..outputs).map(|i| MerkleHash::from_u64(start + i)).collect();
        if unshield.is_some() {
            commitments.push(MerkleHash::from_u64(99_999));
        }
        RailgunTransactionWithHash::new(
            RailgunTransaction {
                version: TxidVersion::V2PoseidonMerkle,
                graph_id: format!("{:04}", start),
                nullifiers: vec![MerkleHash::from_u64(500 + start)],
                commitments,
                bound_params_hash: MerkleHash::from_u64(3),
                unshield,
                txid: MerkleHash::from_u64(7),
                utxo_tree_in: 0,
                utxo_tree_out: 0,
                utxo_batch_start_position_out: start,
                block_number,
                timestamp: 1_700_000_000,
                verification_hash: None,
            },
            CAPACITY,
        )
    }

    fn unshield(value: u128) -> UnshieldPreimage {
        UnshieldPreimage {
            to_address: [9; 20],
            token: TokenData::erc20([4; 20]),
            value,
        }
    }

    #[test_case(1_000_000, 997_500, 2_500 ; "round value")]
    #[test_case(10_001, 9_976, 25 ; "fee rounds down")]
    #[test_case(399, 399, 0 ; "fee below one unit")]
    fn pre_v2_fee_split(value: u128, amount: u128, fee: u128) {
        assert_eq!(amount_fee_from_value(value, 25), (amount, fee));
    }

    #[test]
    fn stops_at_first_missing_commitment() {
        let utxo = utxo_with_leaves(4);
        let transactions = vec![
            transaction(0, 2, None, 150),
            transaction(2, 2, None, 150),
            transaction(4, 1, None, 150),
            transaction(1, 1, None, 150),
        ];
        assert_eq!(linkable_prefix(&utxo, &transactions, V2_START, 25), 2);
    }

    #[test]
    fn backfills_standard_outputs_only_for_prefix() {
        let mut utxo = utxo_with_leaves(3);
        let transactions = vec![transaction(0, 2, None, 150), transaction(2, 2, None, 150)];
        let prefix = linkable_prefix(&utxo, &transactions, V2_START, 25);
        assert_eq!(prefix, 1);

        link_railgun_transactions(&mut utxo, &transactions[..prefix], V2_START, 25).unwrap();
        let expected = Some(transactions[0].railgun_txid());
        assert_eq!(utxo.get_commitment(0, 0).unwrap().railgun_txid(), expected);
        assert_eq!(utxo.get_commitment(0, 1).unwrap().railgun_txid(), expected);
        assert_eq!(utxo.get_commitment(0, 2).unwrap().railgun_txid(), None);
    }

    #[test]
    fn post_v2_unshield_must_exist() {
        let mut utxo = utxo_with_leaves(2);
        let transactions = vec![transaction(0, 2, Some(unshield(1_000)), 150)];
        assert_eq!(linkable_prefix(&utxo, &transactions, V2_START, 25), 0);

        utxo.record_unshield_events(vec![UnshieldStoredEvent {
            txid: MerkleHash::from_u64(7),
            token: TokenData::erc20([4; 20]),
            to_address: [9; 20],
            amount: 998,
            fee: 2,
            block_number: 150,
            event_log_index: Some(3),
            railgun_txid: None,
            timestamp: None,
        }])
        .unwrap();
        assert_eq!(linkable_prefix(&utxo, &transactions, V2_START, 25), 1);

        link_railgun_transactions(&mut utxo, &transactions, V2_START, 25).unwrap();
        let stored = utxo.get_all_unshield_events_for_txid(&MerkleHash::from_u64(7));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].railgun_txid, Some(transactions[0].railgun_txid()));
        assert_eq!(stored[0].event_log_index, Some(3));
    }

    #[test]
    fn pre_v2_unshield_is_synthesised() {
        let mut utxo = utxo_with_leaves(1);
        let transactions = vec![transaction(0, 1, Some(unshield(1_000_000)), 50)];
        assert_eq!(linkable_prefix(&utxo, &transactions, V2_START, 25), 1);

        link_railgun_transactions(&mut utxo, &transactions, V2_START, 25).unwrap();
        // linking twice leaves one identical record
        link_railgun_transactions(&mut utxo, &transactions, V2_START, 25).unwrap();

        let stored = utxo.get_all_unshield_events_for_txid(&MerkleHash::from_u64(7));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].amount, 997_500);
        assert_eq!(stored[0].fee, 2_500);
        assert_eq!(stored[0].event_log_index, None);
        assert_eq!(stored[0].block_number, 50);
        assert_eq!(stored[0].railgun_txid, Some(transactions[0].railgun_txid()));
    }

    #[test]
    fn conflicting_pre_v2_unshields_stop_the_prefix() {
        let mut utxo = utxo_with_leaves(3);
        // same on-chain transaction and token, different values
        let transactions = vec![
            transaction(0, 1, Some(unshield(1_000)), 50),
            transaction(1, 1, Some(unshield(2_000)), 50),
            transaction(2, 1, None, 50),
        ];
        assert_eq!(linkable_prefix(&utxo, &transactions, V2_START, 25), 1);

        link_railgun_transactions(&mut utxo, &transactions[..1], V2_START, 25).unwrap();
        // the stored event now blocks the second transaction on every later pass
        assert_eq!(linkable_prefix(&utxo, &transactions[1..], V2_START, 25), 0);
        assert!(link_railgun_transactions(&mut utxo, &transactions[1..2], V2_START, 25).is_err());

        let stored = utxo.get_all_unshield_events_for_txid(&MerkleHash::from_u64(7));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].amount + stored[0].fee, 1_000);
    }

    #[test]
    fn repeated_pre_v2_unshield_in_one_page_is_linkable() {
        let utxo = utxo_with_leaves(2);
        let first = transaction(0, 1, Some(unshield(1_000)), 50);
        let transactions = vec![first.clone(), first];
        assert_eq!(linkable_prefix(&utxo, &transactions, V2_START, 25), 2);
    }

    #[test]
    fn zero_value_pre_v2_unshield_does_not_stop_the_prefix() {
        let mut utxo = utxo_with_leaves(1);
        let transactions = vec![transaction(0, 1, Some(unshield(0)), 50)];
        assert_eq!(linkable_prefix(&utxo, &transactions, V2_START, 25), 1);
        link_railgun_transactions(&mut utxo, &transactions, V2_START, 25).unwrap();
        assert!(utxo
            .get_all_unshield_events_for_txid(&MerkleHash::from_u64(7))
            .is_empty());
    }
}
