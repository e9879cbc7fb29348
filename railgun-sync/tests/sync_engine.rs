use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use railgun_sync::error::SyncError;
use railgun_sync::hash::MerkleHash;
use railgun_sync::merkletree::utxo::UtxoMerkletree;
use railgun_sync::primitives::{
    RailgunTransaction, RailgunTransactionWithHash, ScanKind, ScanProgress, SyncEvent, TxidVersion,
    UnshieldPreimage,
};
use railgun_sync::store::{EngineStore, FileStore, MemoryStore};
use railgun_sync::sync::{RailgunEngine, CURRENT_UTXO_HISTORY_VERSION};
use railgun_sync::{Chain, EngineRole, MerkletreeScanStatus, RailgunConfig, SyncPhase};
use railgun_testutils::*;

const V2: TxidVersion = TxidVersion::V2PoseidonMerkle;

fn utxo_progress(events: Vec<ScanProgress>) -> Vec<ScanProgress> {
    events
        .into_iter()
        .filter(|event| event.kind() == ScanKind::Utxo)
        .collect()
}

/// Engine whose UTXO tree already holds `commitments` transact commitments in tree 0.
async fn scanned_engine(
    config: RailgunConfig,
    commitments: u64,
    mut state: MockState,
) -> (Arc<TestEngine>, Arc<MockInterface>) {
    state
        .quick_sync_events
        .commitment_events
        .push(commitment_event(0, 0, commitments, 110));
    state.latest_block = state.latest_block.max(115);
    let (engine, _progress, interface) =
        test_engine(config, state, Arc::new(MemoryStore::new())).await;
    let status = engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();
    assert_eq!(status, Some(MerkletreeScanStatus::Complete));
    (engine, interface)
}

fn railgun_txid_of(config: &RailgunConfig, transaction: &RailgunTransaction) -> MerkleHash {
    RailgunTransactionWithHash::new(transaction.clone(), config.tree_capacity()).railgun_txid()
}

async fn latest_txid_index(engine: &TestEngine) -> Option<u64> {
    engine
        .get_latest_railgun_txid_data(TEST_CHAIN, V2)
        .await
        .unwrap()
        .0
}

mod utxo_scan {
    use super::*;

    #[tokio::test]
    async fn cold_scan_quick_syncs_then_slow_syncs_to_head() {
        let mut state = MockState::default();
        state.quick_sync_events.commitment_events =
            vec![commitment_event(0, 0, 3, 110), commitment_event(0, 3, 2, 120)];
        state.latest_block = 125;
        let store = Arc::new(MemoryStore::new());
        let (engine, mut progress, interface) =
            test_engine(test_config(4), state, Arc::clone(&store)).await;

        let status = engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();
        assert_eq!(status, Some(MerkletreeScanStatus::Complete));

        {
            let state = interface.state();
            assert_eq!(state.quick_sync_calls, vec![DEPLOYMENT_BLOCK]);
            assert_eq!(state.slow_sync_calls, vec![(120, 125)]);
            assert_eq!(state.reindex_count, 2);
            assert_eq!(state.cleared_balances, 1);
        }
        assert_eq!(store.get_last_synced_block(TEST_CHAIN, V2).unwrap(), Some(125));
        assert_eq!(
            store.get_utxo_history_version(TEST_CHAIN).unwrap(),
            Some(CURRENT_UTXO_HISTORY_VERSION)
        );
        assert_eq!(
            engine.get_sync_phase(TEST_CHAIN, V2).await.unwrap(),
            SyncPhase::Complete
        );

        let commitment = engine
            .get_commitment(TEST_CHAIN, V2, 0, 4)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commitment.hash, commitment_hash(0, 4));
        let proof = engine
            .get_merkle_proof(TEST_CHAIN, V2, 0, 3)
            .await
            .unwrap()
            .unwrap();
        assert!(proof.verify());
        assert_eq!(engine.get_first_invalid_tree(TEST_CHAIN, V2).await.unwrap(), None);

        let events = utxo_progress(drain_progress(&mut progress));
        assert!((events[0].progress() - 0.03).abs() < 1e-9);
        assert!(events
            .windows(2)
            .all(|pair| pair[0].progress() <= pair[1].progress()));
        let last = events.last().unwrap();
        assert_eq!(last.status(), MerkletreeScanStatus::Complete);
        assert_eq!(last.progress(), 1.0);
        assert_eq!(last.chain(), TEST_CHAIN);
    }

    #[tokio::test]
    async fn commitments_spill_into_the_next_tree() {
        let mut state = MockState::default();
        state.quick_sync_events.commitment_events =
            vec![commitment_event(0, 0, 4, 110), commitment_event(1, 0, 2, 111)];
        state.latest_block = 111;
        let (engine, _progress, _interface) =
            test_engine(test_config(2), state, Arc::new(MemoryStore::new())).await;

        engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();

        assert_eq!(engine.get_latest_tree(TEST_CHAIN, V2).await.unwrap(), 1);
        assert!(engine
            .get_commitment(TEST_CHAIN, V2, 1, 1)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stale_history_version_wipes_stored_trees() {
        let store = Arc::new(MemoryStore::new());
        let mut stored = UtxoMerkletree::new(TEST_CHAIN, V2, 4);
        stored
            .queue_leaves(0, 0, commitment_event(0, 0, 2, 104).commitments)
            .unwrap();
        stored.apply_queue(&MockInterface::default()).await;
        store.write_utxo_changes(&stored.take_changes()).unwrap();
        store.set_utxo_history_version(TEST_CHAIN, 1).unwrap();
        store.set_last_synced_block(TEST_CHAIN, V2, 5000).unwrap();

        let state = MockState {
            latest_block: 109,
            ..Default::default()
        };
        let (engine, _progress, interface) =
            test_engine(test_config(4), state, Arc::clone(&store)).await;
        engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();

        assert!(engine
            .get_commitment(TEST_CHAIN, V2, 0, 0)
            .await
            .unwrap()
            .is_none());
        assert_eq!(interface.state().slow_sync_calls[0], (100, 109));
        assert_eq!(interface.state().cleared_balances, 1);
        assert_eq!(
            store.get_utxo_history_version(TEST_CHAIN).unwrap(),
            Some(CURRENT_UTXO_HISTORY_VERSION)
        );
    }

    #[tokio::test]
    async fn current_history_version_keeps_stored_trees() {
        let store = Arc::new(MemoryStore::new());
        let mut stored = UtxoMerkletree::new(TEST_CHAIN, V2, 4);
        stored
            .queue_leaves(0, 0, commitment_event(0, 0, 2, 104).commitments)
            .unwrap();
        stored.apply_queue(&MockInterface::default()).await;
        store.write_utxo_changes(&stored.take_changes()).unwrap();
        store
            .set_utxo_history_version(TEST_CHAIN, CURRENT_UTXO_HISTORY_VERSION)
            .unwrap();
        store.set_last_synced_block(TEST_CHAIN, V2, 5000).unwrap();

        let state = MockState {
            latest_block: 109,
            ..Default::default()
        };
        let (engine, _progress, interface) =
            test_engine(test_config(4), state, Arc::clone(&store)).await;
        engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();

        assert!(engine
            .get_commitment(TEST_CHAIN, V2, 0, 1)
            .await
            .unwrap()
            .is_some());
        let state = interface.state();
        assert_eq!(state.quick_sync_calls, vec![104]);
        assert!(state.slow_sync_calls.is_empty());
        assert_eq!(state.cleared_balances, 0);
    }

    #[tokio::test]
    async fn file_store_engine_reloads_synced_trees() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = TransactionChain::new(0, 0);
        let mut state = MockState {
            railgun_transactions: vec![chain.next(2, 110)],
            latest_block: 115,
            ..Default::default()
        };
        state
            .quick_sync_events
            .commitment_events
            .push(commitment_event(0, 0, 3, 110));
        let (synced_root, synced_txids) = {
            let store = Arc::new(FileStore::new(dir.path()).unwrap());
            let (engine, _progress) =
                RailgunEngine::new(test_config(4), Arc::new(MockInterface::new(state)), store);
            engine.load_network(test_network()).await.unwrap();
            engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();
            engine
                .sync_railgun_transactions(TEST_CHAIN, "test")
                .await
                .unwrap();
            let proof = engine
                .get_merkle_proof(TEST_CHAIN, V2, 0, 2)
                .await
                .unwrap()
                .unwrap();
            let txids = engine
                .get_latest_railgun_txid_data(TEST_CHAIN, V2)
                .await
                .unwrap();
            (proof.root(), txids)
        };

        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let (engine, _progress) =
            RailgunEngine::new(test_config(4), Arc::new(MockInterface::default()), store);
        engine.load_network(test_network()).await.unwrap();

        let proof = engine
            .get_merkle_proof(TEST_CHAIN, V2, 0, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(proof.root(), synced_root);
        assert_eq!(
            engine
                .get_latest_railgun_txid_data(TEST_CHAIN, V2)
                .await
                .unwrap(),
            synced_txids
        );
        assert_eq!(synced_txids.0, Some(0));
    }

    #[tokio::test]
    async fn concurrent_scan_of_same_network_is_dropped() {
        let gate = Arc::new(Notify::new());
        let state = MockState {
            quick_sync_gate: Some(Arc::clone(&gate)),
            latest_block: 105,
            ..Default::default()
        };
        let (engine, _progress, interface) =
            test_engine(test_config(4), state, Arc::new(MemoryStore::new())).await;

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.scan_event_history(TEST_CHAIN, V2).await }
        });
        with_timeout(5, async {
            while interface.state().quick_sync_calls.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await;

        let second = engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();
        assert_eq!(second, None);

        gate.notify_one();
        let first = with_timeout(5, first).await.unwrap().unwrap();
        assert_eq!(first, Some(MerkletreeScanStatus::Complete));
        assert_eq!(interface.state().quick_sync_calls.len(), 1);
    }

    #[tokio::test]
    async fn quick_sync_is_retried_once() {
        let mut state = MockState::default();
        state.quick_sync_failures = 1;
        state.quick_sync_events.commitment_events = vec![commitment_event(0, 0, 2, 110)];
        state.latest_block = 112;
        let (engine, _progress, interface) =
            test_engine(test_config(4), state, Arc::new(MemoryStore::new())).await;

        engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();

        assert_eq!(interface.state().quick_sync_calls, vec![100, 100]);
        assert!(engine
            .get_commitment(TEST_CHAIN, V2, 0, 1)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn failing_quick_sync_degrades_to_slow_sync() {
        let state = MockState {
            quick_sync_failures: 2,
            slow_sync_events: vec![(
                105,
                SyncEvent::Commitments(vec![commitment_event(0, 0, 2, 105)]),
            )],
            latest_block: 112,
            ..Default::default()
        };
        let (engine, _progress, interface) =
            test_engine(test_config(4), state, Arc::new(MemoryStore::new())).await;

        let status = engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();

        assert_eq!(status, Some(MerkletreeScanStatus::Complete));
        {
            let state = interface.state();
            assert_eq!(state.quick_sync_calls.len(), 2);
            assert_eq!(state.slow_sync_calls, vec![(100, 109), (110, 112)]);
        }
        assert!(engine
            .get_commitment(TEST_CHAIN, V2, 0, 1)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn invalid_tree_withholds_the_slow_sync_cursor() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_utxo_history_version(TEST_CHAIN, CURRENT_UTXO_HISTORY_VERSION)
            .unwrap();
        store.set_last_synced_block(TEST_CHAIN, V2, 125).unwrap();
        let mut state = MockState::default();
        state.quick_sync_events.commitment_events = vec![commitment_event(0, 0, 2, 110)];
        state.rejected_trees.insert(0);
        state.latest_block = 130;
        let (engine, _progress, interface) =
            test_engine(test_config(4), state, Arc::clone(&store)).await;

        engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();

        assert_eq!(
            engine.get_first_invalid_tree(TEST_CHAIN, V2).await.unwrap(),
            Some(0)
        );
        assert!(engine
            .get_commitment(TEST_CHAIN, V2, 0, 0)
            .await
            .unwrap()
            .is_none());
        assert_eq!(interface.state().slow_sync_calls[0], (100, 109));
        assert_eq!(store.get_last_synced_block(TEST_CHAIN, V2).unwrap(), Some(125));

        interface.state().rejected_trees.clear();
        engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();

        assert_eq!(engine.get_first_invalid_tree(TEST_CHAIN, V2).await.unwrap(), None);
        assert_eq!(interface.state().slow_sync_calls.last(), Some(&(125, 130)));
        assert_eq!(store.get_last_synced_block(TEST_CHAIN, V2).unwrap(), Some(130));
    }

    #[tokio::test]
    async fn failing_slow_sync_reports_incomplete() {
        let state = MockState {
            slow_sync_fails: true,
            latest_block: 120,
            ..Default::default()
        };
        let (engine, mut progress, interface) =
            test_engine(test_config(4), state, Arc::new(MemoryStore::new())).await;

        let status = engine.scan_event_history(TEST_CHAIN, V2).await.unwrap();

        assert_eq!(status, Some(MerkletreeScanStatus::Incomplete));
        assert_eq!(
            engine.get_sync_phase(TEST_CHAIN, V2).await.unwrap(),
            SyncPhase::Incomplete
        );
        assert_eq!(interface.state().reindex_count, 1);
        let events = utxo_progress(drain_progress(&mut progress));
        let last = events.last().unwrap();
        assert_eq!(last.status(), MerkletreeScanStatus::Incomplete);
        assert!((last.progress() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn live_events_fill_side_tables() {
        let (engine, _interface) = scanned_engine(test_config(4), 1, MockState::default()).await;
        let spend_txid = MerkleHash::from_u64(0xcafe);

        engine
            .on_live_event(
                TEST_CHAIN,
                V2,
                SyncEvent::Nullifiers(vec![nullifier(7, spend_txid, 116)]),
            )
            .await
            .unwrap();
        engine
            .on_live_event(
                TEST_CHAIN,
                V2,
                SyncEvent::Unshields(vec![unshield_event(spend_txid, 4_000, 116)]),
            )
            .await
            .unwrap();

        assert_eq!(
            engine
                .get_nullifier_txid(TEST_CHAIN, V2, &MerkleHash::from_u64(7))
                .await
                .unwrap(),
            Some(spend_txid)
        );
        assert_eq!(
            engine
                .get_completed_txid_from_nullifiers(TEST_CHAIN, V2, &[MerkleHash::from_u64(7)])
                .await
                .unwrap(),
            Some(spend_txid)
        );
        let unshields = engine
            .get_all_unshields_for_txid(TEST_CHAIN, V2, &spend_txid)
            .await
            .unwrap();
        assert_eq!(unshields.len(), 1);
        assert_eq!(unshields[0].amount, 4_000);
    }

    #[tokio::test]
    async fn full_rescan_clears_balances_and_rebuilds() {
        let (engine, interface) = scanned_engine(test_config(4), 3, MockState::default()).await;

        engine.full_rescan_utxo(TEST_CHAIN).await.unwrap();

        assert_eq!(interface.state().cleared_balances, 2);
        assert!(engine
            .get_commitment(TEST_CHAIN, V2, 0, 2)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn unknown_network_is_an_error() {
        let (engine, _progress, _interface) = test_engine(
            test_config(4),
            MockState::default(),
            Arc::new(MemoryStore::new()),
        )
        .await;

        let result = engine.scan_event_history(Chain::evm(137), V2).await;

        assert!(matches!(result, Err(SyncError::NetworkNotLoaded(chain, _)) if chain.id == 137));
    }

    #[tokio::test]
    async fn disabled_scans_do_nothing() {
        let mut config = test_config(4);
        config.skip_merkletree_scans = true;
        let (engine, _progress, interface) =
            test_engine(config, MockState::default(), Arc::new(MemoryStore::new())).await;

        assert_eq!(engine.scan_event_history(TEST_CHAIN, V2).await.unwrap(), None);
        assert!(interface.state().quick_sync_calls.is_empty());
    }
}

mod txid_sync {
    use super::*;

    #[tokio::test]
    async fn links_only_transactions_whose_outputs_are_stored() {
        let config = test_config(4);
        let mut chain = TransactionChain::new(0, 0);
        let transactions = vec![chain.next(2, 110), chain.next(1, 110), chain.next(2, 112)];
        let state = MockState {
            railgun_transactions: transactions.clone(),
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(config.clone(), 3, state).await;

        let status = engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();

        assert_eq!(status, Some(MerkletreeScanStatus::Complete));
        assert_eq!(latest_txid_index(&engine).await, Some(1));
        let linked = engine
            .get_commitment(TEST_CHAIN, V2, 0, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            linked.railgun_txid(),
            Some(railgun_txid_of(&config, &transactions[0]))
        );

        engine
            .on_live_event(
                TEST_CHAIN,
                V2,
                SyncEvent::Commitments(vec![commitment_event(0, 3, 2, 112)]),
            )
            .await
            .unwrap();
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();

        assert_eq!(latest_txid_index(&engine).await, Some(2));
        assert_eq!(
            interface.state().txid_fetches,
            vec![None, Some("00000001".to_string())]
        );
        let linked = engine
            .get_commitment(TEST_CHAIN, V2, 0, 4)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            linked.railgun_txid(),
            Some(railgun_txid_of(&config, &transactions[2]))
        );
        assert_eq!(
            engine
                .get_global_utxo_position_for_railgun_transaction(TEST_CHAIN, V2, 0, 2)
                .await
                .unwrap(),
            Some(3)
        );
        assert!(engine
            .railgun_txid_occurred_before_block(TEST_CHAIN, V2, 0, 2, 113)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn historical_roots_follow_each_leaf() {
        let mut chain = TransactionChain::new(0, 0);
        let state = MockState {
            railgun_transactions: vec![chain.next(1, 110), chain.next(1, 110)],
            ..Default::default()
        };
        let (engine, _interface) = scanned_engine(test_config(4), 2, state).await;
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();

        let (latest, root) = engine
            .get_latest_railgun_txid_data(TEST_CHAIN, V2)
            .await
            .unwrap();
        assert_eq!(latest, Some(1));
        let first_root = engine
            .get_historical_txid_root(TEST_CHAIN, V2, 0, 0)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first_root, root);
        assert!(engine
            .validate_historical_txid_root(TEST_CHAIN, V2, 0, 1, &root)
            .await
            .unwrap());
        assert!(!engine
            .validate_historical_txid_root(TEST_CHAIN, V2, 0, 1, &first_root)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn broken_verification_chain_truncates_the_tail() {
        let mut chain = TransactionChain::new(0, 0);
        let first = vec![chain.next(2, 110), chain.next(1, 110)];
        let state = MockState {
            railgun_transactions: first,
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(test_config(4), 5, state).await;
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();
        assert_eq!(latest_txid_index(&engine).await, Some(1));

        let mut forked = chain.next(2, 111);
        forked.verification_hash = Some(MerkleHash::from_u64(7));
        interface.state().railgun_transactions.push(forked);
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();

        assert_eq!(latest_txid_index(&engine).await, None);
    }

    fn pre_v2_unshield(value: u128) -> UnshieldPreimage {
        UnshieldPreimage {
            to_address: [0x22; 20],
            token: test_token(),
            value,
        }
    }

    #[tokio::test]
    async fn conflicting_pre_v2_unshield_stops_the_page_without_truncating() {
        let mut chain = TransactionChain::new(0, 0);
        let state = MockState {
            railgun_transactions: vec![chain.next(2, 110), chain.next(1, 110)],
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(test_config(4), 5, state).await;
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();
        assert_eq!(latest_txid_index(&engine).await, Some(1));

        // same txid and token, different values
        let first = chain.next_with_unshield(1, Some(pre_v2_unshield(1_000)), 150);
        let second = chain.next_with_unshield(1, Some(pre_v2_unshield(2_000)), 150);
        assert_eq!(first.txid, second.txid);
        interface
            .state()
            .railgun_transactions
            .extend([first.clone(), second]);

        let status = engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();
        assert_eq!(status, Some(MerkletreeScanStatus::Complete));
        assert_eq!(latest_txid_index(&engine).await, Some(2));
        let (_, root) = engine
            .get_latest_railgun_txid_data(TEST_CHAIN, V2)
            .await
            .unwrap();

        let status = engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();
        assert_eq!(status, Some(MerkletreeScanStatus::Complete));
        assert_eq!(
            engine
                .get_latest_railgun_txid_data(TEST_CHAIN, V2)
                .await
                .unwrap(),
            (Some(2), root)
        );

        let unshields = engine
            .get_all_unshields_for_txid(TEST_CHAIN, V2, &first.txid)
            .await
            .unwrap();
        assert_eq!(unshields.len(), 1);
        assert_eq!(unshields[0].amount + unshields[0].fee, 1_000);
        assert_eq!(
            unshields[0].railgun_txid,
            Some(railgun_txid_of(&test_config(4), &first))
        );
    }

    #[tokio::test]
    async fn stored_unshield_conflict_leaves_the_tail_in_place() {
        let mut chain = TransactionChain::new(0, 0);
        let state = MockState {
            railgun_transactions: vec![chain.next(2, 110)],
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(test_config(4), 4, state).await;
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();
        let before = engine
            .get_latest_railgun_txid_data(TEST_CHAIN, V2)
            .await
            .unwrap();
        assert_eq!(before.0, Some(0));

        let unshielding = chain.next_with_unshield(1, Some(pre_v2_unshield(2_000)), 150);
        engine
            .on_live_event(
                TEST_CHAIN,
                V2,
                SyncEvent::Unshields(vec![unshield_event(unshielding.txid, 500, 150)]),
            )
            .await
            .unwrap();
        interface
            .state()
            .railgun_transactions
            .extend([unshielding.clone(), chain.next(1, 150)]);

        for _ in 0..2 {
            engine
                .sync_railgun_transactions(TEST_CHAIN, "test")
                .await
                .unwrap();
            assert_eq!(
                engine
                    .get_latest_railgun_txid_data(TEST_CHAIN, V2)
                    .await
                    .unwrap(),
                before
            );
        }
        let unshields = engine
            .get_all_unshields_for_txid(TEST_CHAIN, V2, &unshielding.txid)
            .await
            .unwrap();
        assert_eq!(unshields.len(), 1);
        assert_eq!(unshields[0].amount, 500);
    }

    #[tokio::test]
    async fn full_page_is_followed_by_another_fetch() {
        let mut config = test_config(4);
        config.txid_sync_page_size = 2;
        let mut chain = TransactionChain::new(0, 0);
        let state = MockState {
            railgun_transactions: vec![chain.next(1, 110), chain.next(1, 110), chain.next(1, 110)],
            txid_page_size: 2,
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(config, 3, state).await;

        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();

        assert_eq!(latest_txid_index(&engine).await, Some(2));
        assert_eq!(
            interface.state().txid_fetches,
            vec![None, Some("00000001".to_string())]
        );
    }

    #[tokio::test]
    async fn wallet_stops_at_validated_index() {
        let mut chain = TransactionChain::new(0, 0);
        let state = MockState {
            railgun_transactions: vec![chain.next(1, 110), chain.next(1, 110)],
            latest_validated_txid_index: Some(1),
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(test_config(4), 3, state).await;
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();
        assert_eq!(latest_txid_index(&engine).await, Some(1));

        interface
            .state()
            .railgun_transactions
            .push(chain.next(1, 111));
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();

        assert_eq!(latest_txid_index(&engine).await, Some(1));
        assert_eq!(interface.state().validated_txid_index_calls, 2);
    }

    #[tokio::test]
    async fn poi_node_ignores_validated_index() {
        let mut config = test_config(4);
        config.role = EngineRole::PoiNode;
        let mut chain = TransactionChain::new(0, 0);
        let state = MockState {
            railgun_transactions: vec![chain.next(1, 110), chain.next(1, 110), chain.next(1, 111)],
            latest_validated_txid_index: Some(0),
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(config, 3, state).await;

        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();

        assert_eq!(latest_txid_index(&engine).await, Some(2));
        assert_eq!(interface.state().validated_txid_index_calls, 0);
    }

    #[tokio::test]
    async fn reset_after_index_resyncs_the_tail() {
        let mut chain = TransactionChain::new(0, 0);
        let state = MockState {
            railgun_transactions: (0..4).map(|_| chain.next(1, 110)).collect(),
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(test_config(4), 4, state).await;
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();
        assert_eq!(latest_txid_index(&engine).await, Some(3));

        engine.reset_txids_after_index(TEST_CHAIN, 0).await.unwrap();

        assert_eq!(latest_txid_index(&engine).await, Some(3));
        assert_eq!(
            interface.state().txid_fetches.last(),
            Some(&Some("00000000".to_string()))
        );
    }

    #[tokio::test]
    async fn full_txid_rescan_starts_from_the_first_transaction() {
        let mut chain = TransactionChain::new(0, 0);
        let state = MockState {
            railgun_transactions: vec![chain.next(1, 110), chain.next(1, 110)],
            ..Default::default()
        };
        let (engine, interface) = scanned_engine(test_config(4), 2, state).await;
        engine
            .sync_railgun_transactions(TEST_CHAIN, "test")
            .await
            .unwrap();

        engine.full_rescan_txids(TEST_CHAIN).await.unwrap();

        assert_eq!(latest_txid_index(&engine).await, Some(1));
        assert_eq!(interface.state().txid_fetches, vec![None, None]);
    }
}

mod scheduling {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn poller_fetches_immediately_then_every_interval() {
        let (engine, _progress, interface) = test_engine(
            test_config(4),
            MockState::default(),
            Arc::new(MemoryStore::new()),
        )
        .await;

        engine.start_txid_poller(TEST_CHAIN).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(interface.state().txid_fetches.len(), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(interface.state().txid_fetches.len(), 2);

        engine.unload_network(TEST_CHAIN).await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(interface.state().txid_fetches.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_sync_runs_each_attempt_and_drops_overlapping_triggers() {
        let (engine, _progress, interface) = test_engine(
            test_config(4),
            MockState::default(),
            Arc::new(MemoryStore::new()),
        )
        .await;

        engine.trigger_delayed_txid_sync(TEST_CHAIN);
        tokio::task::yield_now().await;
        engine.trigger_delayed_txid_sync(TEST_CHAIN);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(interface.state().txid_fetches.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(interface.state().txid_fetches.len(), 1);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(interface.state().txid_fetches.len(), 3);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(interface.state().txid_fetches.len(), 3);

        engine.trigger_delayed_txid_sync(TEST_CHAIN);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(interface.state().txid_fetches.len(), 6);
    }
}
