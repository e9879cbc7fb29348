//! Mock collaborators and event fixtures for exercising the sync engine without a chain.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use railgun_config::{Chain, NetworkConfig, RailgunConfig};
use railgun_sync::hash::{verification_hash, MerkleHash};
use railgun_sync::primitives::{
    Commitment, CommitmentEvent, CommitmentKind, CommitmentPreimage, Nullifier,
    QuickSyncEvents, RailgunTransaction, ScanProgress, SyncEvent, TokenData, TxidVersion,
    UnshieldPreimage, UnshieldStoredEvent,
};
use railgun_sync::store::MemoryStore;
use railgun_sync::sync::RailgunEngine;
use railgun_sync::traits::{
    QuickSync, SlowSync, SyncInterface, ValidateMerkleroot, ValidatedTxids, WalletReindex,
};

pub const TEST_CHAIN: Chain = Chain {
    chain_type: railgun_config::ChainType::Evm,
    id: 1,
};
pub const DEPLOYMENT_BLOCK: u64 = 100;
pub const ENGINE_V2_START_BLOCK: u64 = 200;

/// Everything the mock serves and everything it was asked for.
#[derive(Debug, Default)]
pub struct MockState {
    pub quick_sync_events: QuickSyncEvents,
    /// Calls to fail before quick sync starts answering.
    pub quick_sync_failures: u32,
    /// When set, quick sync waits for a notification before answering.
    pub quick_sync_gate: Option<Arc<Notify>>,
    /// `from_block` of every quick sync call, failed ones included.
    pub quick_sync_calls: Vec<u64>,
    /// Events served by slow sync, tagged with their block.
    pub slow_sync_events: Vec<(u64, SyncEvent)>,
    pub slow_sync_calls: Vec<(u64, u64)>,
    pub slow_sync_fails: bool,
    pub latest_block: u64,
    /// Txid indexer contents, in indexer order.
    pub railgun_transactions: Vec<RailgunTransaction>,
    pub txid_page_size: usize,
    pub txid_fetches: Vec<Option<String>>,
    pub latest_validated_txid_index: Option<u64>,
    pub validated_txid_index_calls: u32,
    /// Every root submitted for these trees is rejected.
    pub rejected_trees: HashSet<u32>,
    pub validated_roots: Vec<(u32, MerkleHash)>,
    pub reindex_count: u32,
    pub cleared_balances: u32,
}

/// Stands in for the indexers, the chain node, the merkleroot validator and the wallets.
#[derive(Debug, Default)]
pub struct MockInterface {
    state: Mutex<MockState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockError(pub String);

impl MockInterface {
    pub fn new(state: MockState) -> Self {
        MockInterface {
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl SyncInterface for MockInterface {
    type Error = MockError;
}

#[async_trait]
impl QuickSync for MockInterface {
    async fn quick_sync_events(
        &self,
        _chain: Chain,
        _txid_version: TxidVersion,
        from_block: u64,
    ) -> Result<QuickSyncEvents, MockError> {
        let gate = {
            let mut state = self.state();
            state.quick_sync_calls.push(from_block);
            state.quick_sync_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state();
        if state.quick_sync_failures > 0 {
            state.quick_sync_failures -= 1;
            return Err(MockError("indexer timeout".to_string()));
        }
        let events = &state.quick_sync_events;
        Ok(QuickSyncEvents {
            commitment_events: events
                .commitment_events
                .iter()
                .filter(|e| e.block_number >= from_block)
                .cloned()
                .collect(),
            nullifier_events: events
                .nullifier_events
                .iter()
                .filter(|n| n.block_number >= from_block)
                .cloned()
                .collect(),
            unshield_events: events
                .unshield_events
                .iter()
                .filter(|u| u.block_number >= from_block)
                .cloned()
                .collect(),
            railgun_transaction_events: events.railgun_transaction_events.clone(),
        })
    }

    async fn quick_sync_railgun_transactions(
        &self,
        _chain: Chain,
        _txid_version: TxidVersion,
        after_graph_id: Option<String>,
    ) -> Result<Vec<RailgunTransaction>, MockError> {
        let mut state = self.state();
        state.txid_fetches.push(after_graph_id.clone());
        let start = match &after_graph_id {
            Some(graph_id) => state
                .railgun_transactions
                .iter()
                .position(|t| &t.graph_id == graph_id)
                .map_or(0, |position| position + 1),
            None => 0,
        };
        let page_size = if state.txid_page_size == 0 {
            usize::MAX
        } else {
            state.txid_page_size
        };
        Ok(state
            .railgun_transactions
            .iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SlowSync for MockInterface {
    async fn latest_block(&self, _chain: Chain) -> Result<u64, MockError> {
        Ok(self.state().latest_block)
    }

    async fn historical_events(
        &self,
        _chain: Chain,
        _txid_version: TxidVersion,
        from_block: u64,
        to_block: u64,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Result<(), MockError> {
        let to_send: Vec<(u64, SyncEvent)> = {
            let mut state = self.state();
            state.slow_sync_calls.push((from_block, to_block));
            if state.slow_sync_fails {
                return Err(MockError("provider unavailable".to_string()));
            }
            let mut in_range: Vec<(u64, SyncEvent)> = state
                .slow_sync_events
                .iter()
                .filter(|(block, _)| (from_block..=to_block).contains(block))
                .cloned()
                .collect();
            in_range.sort_by_key(|(block, _)| *block);
            in_range
        };

        let send = |event: SyncEvent| {
            events
                .send(event)
                .map_err(|_| MockError("event receiver dropped".to_string()))
        };
        for (block, event) in to_send {
            send(event)?;
            send(SyncEvent::BlockSynced(block))?;
        }
        send(SyncEvent::BlockSynced(to_block))
    }
}

#[async_trait]
impl ValidateMerkleroot for MockInterface {
    async fn validate_merkleroot(
        &self,
        _chain: Chain,
        _txid_version: TxidVersion,
        tree: u32,
        root: MerkleHash,
    ) -> Result<bool, MockError> {
        let mut state = self.state();
        state.validated_roots.push((tree, root));
        Ok(!state.rejected_trees.contains(&tree))
    }
}

#[async_trait]
impl ValidatedTxids for MockInterface {
    async fn latest_validated_txid_index(
        &self,
        _chain: Chain,
        _txid_version: TxidVersion,
    ) -> Result<Option<u64>, MockError> {
        let mut state = self.state();
        state.validated_txid_index_calls += 1;
        Ok(state.latest_validated_txid_index)
    }
}

#[async_trait]
impl WalletReindex for MockInterface {
    async fn reindex_wallets(
        &self,
        _chain: Chain,
        _txid_version: TxidVersion,
    ) -> Result<(), MockError> {
        self.state().reindex_count += 1;
        Ok(())
    }

    async fn clear_wallet_balances(&self, _chain: Chain) -> Result<(), MockError> {
        self.state().cleared_balances += 1;
        Ok(())
    }
}

pub type TestEngine = RailgunEngine<MockInterface, MemoryStore>;

/// Engine over a [`MockInterface`] and a [`MemoryStore`], with [`TEST_CHAIN`] loaded.
pub async fn test_engine(
    config: RailgunConfig,
    state: MockState,
    store: Arc<MemoryStore>,
) -> (
    Arc<TestEngine>,
    mpsc::UnboundedReceiver<ScanProgress>,
    Arc<MockInterface>,
) {
    railgun_sync::init_logging();
    let interface = Arc::new(MockInterface::new(state));
    let (engine, progress) = RailgunEngine::new(config, Arc::clone(&interface), store);
    engine
        .load_network(test_network())
        .await
        .expect("test network loads");
    (engine, progress, interface)
}

pub fn test_network() -> NetworkConfig {
    NetworkConfig::new(TEST_CHAIN, DEPLOYMENT_BLOCK, ENGINE_V2_START_BLOCK)
}

/// Config with small trees so tests can cross tree boundaries.
pub fn test_config(tree_depth: u8) -> RailgunConfig {
    let mut config = RailgunConfig::create_default(None);
    config.tree_depth = tree_depth;
    config.slow_sync_batch_size = 10;
    config
}

/// Every progress event sent so far.
pub fn drain_progress(receiver: &mut mpsc::UnboundedReceiver<ScanProgress>) -> Vec<ScanProgress> {
    let mut progress = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        progress.push(event);
    }
    progress
}

/// Awaits `future`, panicking if it takes longer than `seconds`.
pub async fn with_timeout<F: Future>(seconds: u64, future: F) -> F::Output {
    tokio::select! {
        output = future => output,
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
            panic!("timed out after {} seconds", seconds)
        }
    }
}

pub fn commitment_hash(tree: u32, index: u64) -> MerkleHash {
    MerkleHash::from_u64(tree as u64 * 1_000_000 + index + 1)
}

pub fn transact_commitment(tree: u32, index: u64, block_number: u64) -> Commitment {
    Commitment {
        hash: commitment_hash(tree, index),
        txid: MerkleHash::from_u64(block_number),
        block_number: Some(block_number),
        timestamp: Some(1_700_000_000 + block_number),
        utxo_tree: tree,
        utxo_index: index,
        kind: CommitmentKind::Transact {
            ciphertext: vec![0xab; 32],
            railgun_txid: None,
        },
    }
}

pub fn shield_commitment(tree: u32, index: u64, block_number: u64) -> Commitment {
    Commitment {
        hash: commitment_hash(tree, index),
        txid: MerkleHash::from_u64(block_number),
        block_number: Some(block_number),
        timestamp: None,
        utxo_tree: tree,
        utxo_index: index,
        kind: CommitmentKind::Shield {
            preimage: CommitmentPreimage {
                npk: MerkleHash::from_u64(index),
                token: test_token(),
                value: 1_000,
            },
            encrypted_bundle: vec![1; 64],
            shield_key: vec![2; 32],
        },
    }
}

/// `count` transact commitments from `start` in one event.
pub fn commitment_event(tree: u32, start: u64, count: u64, block_number: u64) -> CommitmentEvent {
    CommitmentEvent {
        tree_number: tree,
        start_position: start,
        commitments: (start..start + count)
            .map(|index| transact_commitment(tree, index, block_number))
            .collect(),
        block_number,
    }
}

pub fn nullifier(value: u64, txid: MerkleHash, block_number: u64) -> Nullifier {
    Nullifier {
        txid,
        nullifier: MerkleHash::from_u64(value),
        tree_number: 0,
        block_number,
    }
}

pub fn test_token() -> TokenData {
    TokenData::erc20([0x11; 20])
}

pub fn unshield_event(txid: MerkleHash, amount: u128, block_number: u64) -> UnshieldStoredEvent {
    UnshieldStoredEvent {
        txid,
        token: test_token(),
        to_address: [0x22; 20],
        amount,
        fee: amount / 400,
        block_number,
        event_log_index: Some(0),
        railgun_txid: None,
        timestamp: None,
    }
}

/// Builds V2 railgun transactions whose verification hashes form one chain and whose outputs
/// occupy consecutive UTXO positions.
#[derive(Debug, Clone)]
pub struct TransactionChain {
    previous_hash: Option<MerkleHash>,
    next_graph_id: u64,
    utxo_tree: u32,
    next_position: u64,
}

impl TransactionChain {
    pub fn new(utxo_tree: u32, start_position: u64) -> Self {
        TransactionChain {
            previous_hash: None,
            next_graph_id: 0,
            utxo_tree,
            next_position: start_position,
        }
    }

    /// Next transaction, with `outputs` standard commitments mined at `block_number`.
    pub fn next(&mut self, outputs: u64, block_number: u64) -> RailgunTransaction {
        self.next_with_unshield(outputs, None, block_number)
    }

    pub fn next_with_unshield(
        &mut self,
        outputs: u64,
        unshield: Option<UnshieldPreimage>,
        block_number: u64,
    ) -> RailgunTransaction {
        let graph_id = self.next_graph_id;
        let first_nullifier = MerkleHash::from_u64(0xdead_0000 + graph_id);
        let verification = verification_hash(self.previous_hash, &first_nullifier);
        let mut commitments: Vec<MerkleHash> = (0..outputs)
            .map(|i| commitment_hash(self.utxo_tree, self.next_position + i))
            .collect();
        if unshield.is_some() {
            commitments.push(MerkleHash::from_u64(0xbeef_0000 + graph_id));
        }
        let transaction = RailgunTransaction {
            version: TxidVersion::V2PoseidonMerkle,
            graph_id: format!("{:08}", graph_id),
            nullifiers: vec![first_nullifier],
            commitments,
            bound_params_hash: MerkleHash::from_u64(graph_id),
            unshield,
            txid: MerkleHash::from_u64(block_number),
            utxo_tree_in: self.utxo_tree,
            utxo_tree_out: self.utxo_tree,
            utxo_batch_start_position_out: self.next_position,
            block_number,
            timestamp: 1_700_000_000 + block_number,
            verification_hash: Some(verification),
        };
        self.previous_hash = Some(verification);
        self.next_graph_id += 1;
        self.next_position += outputs;
        transaction
    }
}
