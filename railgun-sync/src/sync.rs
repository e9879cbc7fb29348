//! Entrypoint for the sync engine
//!
//! [`RailgunEngine`] owns the UTXO and txid trees of every loaded network and keeps them in step
//! with the chain: a quick sync from the bulk indexer, then a slow sync over the chain's logs,
//! then a wallet re-index. Txid sync runs on its own schedule, see [`RailgunEngine::sync_railgun_transactions`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use railgun_config::{Chain, NetworkConfig, RailgunConfig};
use railgun_status::scan_status::MerkletreeScanStatus;
use railgun_status::sync_phase::SyncPhase;

use crate::error::SyncError;
use crate::hash::MerkleHash;
use crate::merkletree::proof::MerkleProof;
use crate::merkletree::txid::TxidMerkletree;
use crate::merkletree::utxo::UtxoMerkletree;
use crate::primitives::{
    Commitment, CommitmentEvent, RailgunTransaction, RailgunTransactionWithHash, ScanKind,
    ScanProgress, SyncEvent, Txid, TxidVersion, UnshieldStoredEvent,
};
use crate::store::{EngineStore, StoreError, StoreKey};
use crate::traits::{QuickSync, SlowSync, ValidateMerkleroot, ValidatedTxids, WalletReindex};

mod txid;

/// UTXO trees stored under an older version are wiped on the next scan.
pub const CURRENT_UTXO_HISTORY_VERSION: u64 = 2;
/// Txid trees stored under an older version are wiped on the next txid sync.
pub const CURRENT_TXID_HISTORY_VERSION: u64 = 1;

const SCAN_START_PROGRESS: f64 = 0.03;
const POST_QUICK_SYNC_PROGRESS: f64 = 0.5;
// quick sync milestones, as fractions of POST_QUICK_SYNC_PROGRESS
const QUICK_SYNC_FETCH: f64 = 0.1;
const QUICK_SYNC_FETCHED: f64 = 0.2;
const QUICK_SYNC_SIDE_TABLES: f64 = 0.24;
const QUICK_SYNC_APPLY: f64 = 0.3;
const QUICK_SYNC_REINDEX: f64 = 0.4;
const SLOW_SYNC_SPAN: f64 = 0.45;

/// Overall UTXO scan progress after `scanned` of `total` slow sync blocks.
pub(crate) fn slow_sync_progress(scanned: u64, total: u64) -> f64 {
    let ratio = if total == 0 {
        1.0
    } else {
        (scanned as f64 / total as f64).min(1.0)
    };
    POST_QUICK_SYNC_PROGRESS + SLOW_SYNC_SPAN * ratio
}

/// Trees and scan flags of one (chain, txid version).
pub(crate) struct NetworkContext {
    network: NetworkConfig,
    txid_version: TxidVersion,
    utxo: RwLock<UtxoMerkletree>,
    txid: RwLock<TxidMerkletree>,
    // held from taking tree changes until they are written
    persist_lock: Mutex<()>,
    phase: Mutex<SyncPhase>,
    utxo_scanning: AtomicBool,
    txid_scanning: AtomicBool,
    delayed_txid_sync_pending: AtomicBool,
    utxo_progress: Mutex<f64>,
    txid_progress: Mutex<f64>,
}

impl NetworkContext {
    fn new(
        network: NetworkConfig,
        txid_version: TxidVersion,
        utxo: UtxoMerkletree,
        txid: TxidMerkletree,
    ) -> Self {
        NetworkContext {
            network,
            txid_version,
            utxo: RwLock::new(utxo),
            txid: RwLock::new(txid),
            persist_lock: Mutex::new(()),
            phase: Mutex::new(SyncPhase::Idle),
            utxo_scanning: AtomicBool::new(false),
            txid_scanning: AtomicBool::new(false),
            delayed_txid_sync_pending: AtomicBool::new(false),
            utxo_progress: Mutex::new(0.0),
            txid_progress: Mutex::new(0.0),
        }
    }

    fn chain(&self) -> Chain {
        self.network.chain
    }
}

/// Sync engine for any number of networks.
///
/// `I` reaches the indexers, chain node, merkleroot validator and wallets. `S` persists trees
/// and cursors. Progress events are delivered on the receiver returned by [`RailgunEngine::new`].
pub struct RailgunEngine<I, S> {
    config: RailgunConfig,
    interface: Arc<I>,
    store: Arc<S>,
    networks: RwLock<BTreeMap<(Chain, TxidVersion), Arc<NetworkContext>>>,
    pollers: Mutex<HashMap<Chain, JoinHandle<()>>>,
    progress_sender: mpsc::UnboundedSender<ScanProgress>,
}

impl<I, S> RailgunEngine<I, S>
where
    I: QuickSync + SlowSync + ValidateMerkleroot + ValidatedTxids + WalletReindex + Send + Sync + 'static,
    S: EngineStore + 'static,
{
    /// Creates an engine with no networks loaded.
    pub fn new(
        config: RailgunConfig,
        interface: Arc<I>,
        store: Arc<S>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ScanProgress>) {
        let (progress_sender, progress_receiver) = mpsc::unbounded_channel();
        let engine = Arc::new(RailgunEngine {
            config,
            interface,
            store,
            networks: RwLock::new(BTreeMap::new()),
            pollers: Mutex::new(HashMap::new()),
            progress_sender,
        });
        (engine, progress_receiver)
    }

    /// Engine configuration.
    pub fn config(&self) -> &RailgunConfig {
        &self.config
    }

    /// Loads the stored trees of `network` for every txid version it supports, or empty trees
    /// on first use. Loading an already loaded network is a no-op.
    pub async fn load_network(&self, network: NetworkConfig) -> Result<(), SyncError> {
        let chain = network.chain;
        let depth = self.config.tree_depth;

        let mut loaded = Vec::new();
        for txid_version in TxidVersion::ALL {
            if txid_version == TxidVersion::V3PoseidonMerkle && !network.supports_v3 {
                continue;
            }
            if self
                .networks
                .read()
                .await
                .contains_key(&(chain, txid_version))
            {
                tracing::debug!("[{}] network {} already loaded", txid_version, chain);
                continue;
            }

            let (stored_utxo, stored_txid) = self
                .with_store(move |store| {
                    Ok((
                        store.load_utxo_merkletree(chain, txid_version)?,
                        store.load_txid_merkletree(chain, txid_version)?,
                    ))
                })
                .await?;
            let utxo = match stored_utxo {
                Some(utxo) if utxo.merkletree().depth() == depth => utxo,
                Some(_) => {
                    tracing::warn!(
                        "[{}] stored utxo merkletree for {} has a different depth, starting empty",
                        txid_version,
                        chain
                    );
                    UtxoMerkletree::new(chain, txid_version, depth)
                }
                None => UtxoMerkletree::new(chain, txid_version, depth),
            };
            let txid = match stored_txid {
                Some(txid) if txid.merkletree().depth() == depth => txid,
                _ => TxidMerkletree::new(chain, txid_version, depth, self.config.tree_capacity()),
            };
            loaded.push((txid_version, utxo, txid));
        }

        let mut networks = self.networks.write().await;
        for (txid_version, utxo, txid) in loaded {
            // a concurrent load of the same network keeps the trees it inserted first
            networks.entry((chain, txid_version)).or_insert_with(|| {
                Arc::new(NetworkContext::new(network.clone(), txid_version, utxo, txid))
            });
        }

        tracing::info!("loaded network {}", chain);
        Ok(())
    }

    /// Stops the txid poller of `chain` and drops its trees from memory.
    pub async fn unload_network(&self, chain: Chain) {
        if let Some(poller) = self.pollers.lock().await.remove(&chain) {
            poller.abort();
        }
        self.networks
            .write()
            .await
            .retain(|(loaded_chain, _), _| *loaded_chain != chain);
        tracing::info!("unloaded network {}", chain);
    }

    pub(crate) async fn network(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<Arc<NetworkContext>, SyncError> {
        self.networks
            .read()
            .await
            .get(&(chain, txid_version))
            .cloned()
            .ok_or(SyncError::NetworkNotLoaded(chain, txid_version))
    }

    async fn networks_for_chain(&self, chain: Chain) -> Vec<Arc<NetworkContext>> {
        self.networks
            .read()
            .await
            .iter()
            .filter(|((loaded_chain, _), _)| *loaded_chain == chain)
            .map(|(_, context)| Arc::clone(context))
            .collect()
    }

    /// Scans every loaded txid version of `chain`, then starts the txid poller.
    pub async fn scan_history(self: &Arc<Self>, chain: Chain) -> Result<(), SyncError> {
        let contexts = self.networks_for_chain(chain).await;
        if contexts.is_empty() {
            return Err(SyncError::NetworkNotLoaded(
                chain,
                TxidVersion::V2PoseidonMerkle,
            ));
        }
        for context in contexts {
            self.scan_event_history(chain, context.txid_version).await?;
        }
        self.start_txid_poller(chain).await;
        Ok(())
    }

    /// Runs quick sync, slow sync and a wallet re-index for one (chain, txid version).
    ///
    /// Returns `None` when scans are disabled or a scan for the same key is already in flight.
    /// Failures after the network lookup are reported as [`MerkletreeScanStatus::Incomplete`].
    pub async fn scan_event_history(
        self: &Arc<Self>,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<Option<MerkletreeScanStatus>, SyncError> {
        if self.config.skip_merkletree_scans {
            tracing::info!("skipping merkletree scan: scans are disabled");
            return Ok(None);
        }
        let context = self.network(chain, txid_version).await?;

        if context.utxo_scanning.swap(true, Ordering::SeqCst) {
            tracing::info!(
                "[{}] already scanning {}. stopping additional re-scan",
                txid_version,
                chain
            );
            return Ok(None);
        }
        let status = self.perform_scan(&context).await;
        context.utxo_scanning.store(false, Ordering::SeqCst);

        Ok(Some(status))
    }

    async fn perform_scan(self: &Arc<Self>, context: &Arc<NetworkContext>) -> MerkletreeScanStatus {
        let chain = context.chain();
        let txid_version = context.txid_version;

        self.reset_progress(context, ScanKind::Utxo).await;
        self.emit_progress(context, ScanKind::Utxo, SCAN_START_PROGRESS, MerkletreeScanStatus::Updated)
            .await;

        let status = match self.scan_utxo_history(context).await {
            Ok(()) => {
                if txid_version == TxidVersion::V2PoseidonMerkle {
                    self.trigger_delayed_txid_sync(chain);
                }
                self.set_phase(context, SyncPhase::WalletReindex).await;
                match self.interface.reindex_wallets(chain, txid_version).await {
                    Ok(()) => {
                        self.emit_progress(context, ScanKind::Utxo, 1.0, MerkletreeScanStatus::Updated)
                            .await;
                        MerkletreeScanStatus::Complete
                    }
                    Err(e) => {
                        tracing::error!(
                            "[{}] wallet reindex failed for {}: {:?}",
                            txid_version,
                            chain,
                            e
                        );
                        MerkletreeScanStatus::Incomplete
                    }
                }
            }
            Err(e) => {
                tracing::error!("[{}] scan incomplete for {}: {}", txid_version, chain, e);
                if let Err(e) = self.interface.reindex_wallets(chain, txid_version).await {
                    tracing::warn!(
                        "[{}] best effort wallet reindex failed for {}: {:?}",
                        txid_version,
                        chain,
                        e
                    );
                }
                MerkletreeScanStatus::Incomplete
            }
        };

        let final_phase = if status.is_complete() {
            SyncPhase::Complete
        } else {
            SyncPhase::Incomplete
        };
        self.set_phase(context, final_phase).await;
        self.emit_progress(context, ScanKind::Utxo, 1.0, status).await;
        status
    }

    async fn scan_utxo_history(&self, context: &NetworkContext) -> Result<(), SyncError> {
        self.check_utxo_history_version(context.chain()).await?;

        self.set_phase(context, SyncPhase::QuickSyncing).await;
        self.quick_sync(context).await;
        self.emit_progress(
            context,
            ScanKind::Utxo,
            POST_QUICK_SYNC_PROGRESS,
            MerkletreeScanStatus::Updated,
        )
        .await;

        self.set_phase(context, SyncPhase::SlowSyncing).await;
        self.slow_sync(context).await
    }

    /// Wipes every tree of `chain`, its cursors and wallet balances if the stored UTXO history
    /// version is missing or older than [`CURRENT_UTXO_HISTORY_VERSION`].
    async fn check_utxo_history_version(&self, chain: Chain) -> Result<(), SyncError> {
        let stored = self
            .with_store(move |store| store.get_utxo_history_version(chain))
            .await?;
        if stored.is_some_and(|version| version >= CURRENT_UTXO_HISTORY_VERSION) {
            return Ok(());
        }
        tracing::info!(
            "utxo history version {:?} for {} is stale: clearing merkletrees and wallet balances",
            stored,
            chain
        );

        for context in self.networks_for_chain(chain).await {
            context.utxo.write().await.clear();
            context.txid.write().await.clear();
            self.persist_trees(&context).await?;
            let txid_version = context.txid_version;
            self.with_store(move |store| {
                store.delete(&StoreKey::LastSyncedBlock(chain, txid_version))
            })
            .await?;
        }
        self.interface
            .clear_wallet_balances(chain)
            .await
            .map_err(|e| SyncError::WalletError(format!("{:?}", e)))?;

        self.with_store(move |store| {
            store.set_utxo_history_version(chain, CURRENT_UTXO_HISTORY_VERSION)?;
            store.set_txid_history_version(chain, CURRENT_TXID_HISTORY_VERSION)
        })
        .await
    }

    /// Block of the latest commitment in a valid tree, or the deployment block.
    async fn start_scanning_block(&self, context: &NetworkContext) -> u64 {
        context
            .utxo
            .read()
            .await
            .most_recent_valid_commitment_block()
            .unwrap_or(context.network.deployment_block)
    }

    /// Quick sync with retries. Never fails: once retries are exhausted the error is logged
    /// and slow sync carries on from wherever quick sync left the trees.
    async fn quick_sync(&self, context: &NetworkContext) {
        let mut attempt = 0;
        loop {
            match self.perform_quick_sync(context).await {
                Ok(()) => return,
                Err(e) if attempt < self.config.quick_sync_retries => {
                    tracing::warn!(
                        "[{}] quick sync failed for {}, retrying: {}",
                        context.txid_version,
                        context.chain(),
                        e
                    );
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "[{}] quick sync failed for {}, continuing with slow sync: {}",
                        context.txid_version,
                        context.chain(),
                        e
                    );
                    return;
                }
            }
        }
    }

    async fn perform_quick_sync(&self, context: &NetworkContext) -> Result<(), SyncError> {
        let chain = context.chain();
        let txid_version = context.txid_version;
        let end = POST_QUICK_SYNC_PROGRESS;

        let start_block = self.start_scanning_block(context).await;
        tracing::info!(
            "[{}] quick sync {} from block {}",
            txid_version,
            chain,
            start_block
        );
        self.emit_progress(context, ScanKind::Utxo, end * QUICK_SYNC_FETCH, MerkletreeScanStatus::Updated)
            .await;

        let events = self
            .interface
            .quick_sync_events(chain, txid_version, start_block)
            .await
            .map_err(|e| SyncError::QuickSyncError(format!("{:?}", e)))?;

        if let Some(transactions) = events.railgun_transaction_events {
            tracing::debug!(
                "[{}] quick sync railgun transactions: {}",
                txid_version,
                transactions.len()
            );
            self.queue_unchained_transactions(context, transactions)
                .await;
        }
        self.emit_progress(context, ScanKind::Utxo, end * QUICK_SYNC_FETCHED, MerkletreeScanStatus::Updated)
            .await;

        // side tables first, so no reader sees commitments without their nullifiers
        self.record_unshields(context, events.unshield_events).await;
        context
            .utxo
            .write()
            .await
            .record_nullifiers(&events.nullifier_events);
        self.emit_progress(
            context,
            ScanKind::Utxo,
            end * QUICK_SYNC_SIDE_TABLES,
            MerkletreeScanStatus::Updated,
        )
        .await;

        tracing::debug!(
            "[{}] quick sync commitment events: {}",
            txid_version,
            events.commitment_events.len()
        );
        let has_commitments = !events.commitment_events.is_empty();
        queue_commitment_events(&mut *context.utxo.write().await, events.commitment_events);

        if has_commitments {
            self.emit_progress(context, ScanKind::Utxo, end * QUICK_SYNC_APPLY, MerkletreeScanStatus::Updated)
                .await;
            let validated = context
                .utxo
                .write()
                .await
                .apply_queue(&*self.interface)
                .await;
            tracing::debug!("[{}] quick sync validated {} leaves", txid_version, validated);
        }
        self.persist_trees(context).await?;

        if has_commitments {
            self.emit_progress(
                context,
                ScanKind::Utxo,
                end * QUICK_SYNC_REINDEX,
                MerkletreeScanStatus::Updated,
            )
            .await;
            self.set_phase(context, SyncPhase::WalletReindex).await;
            self.interface
                .reindex_wallets(chain, txid_version)
                .await
                .map_err(|e| SyncError::WalletError(format!("{:?}", e)))?;
            self.set_phase(context, SyncPhase::QuickSyncing).await;
        }
        Ok(())
    }

    /// First block of the slow sync. Any invalid tree forces the walk back resume point,
    /// otherwise the stored cursor is used when it is further along.
    async fn slow_sync_start_block(&self, context: &NetworkContext) -> Result<u64, SyncError> {
        let resume_block = self.start_scanning_block(context).await;
        if context.utxo.read().await.first_invalid_tree().is_some() {
            return Ok(resume_block);
        }
        let (chain, txid_version) = (context.chain(), context.txid_version);
        let last_synced = self
            .with_store(move |store| store.get_last_synced_block(chain, txid_version))
            .await?;
        tracing::debug!(
            "[{}] last synced block for {}: {:?}",
            context.txid_version,
            context.chain(),
            last_synced
        );
        Ok(last_synced.map_or(resume_block, |block| block.max(resume_block)))
    }

    async fn slow_sync(&self, context: &NetworkContext) -> Result<(), SyncError> {
        let chain = context.chain();
        let start_block = self.slow_sync_start_block(context).await?;
        let latest_block = self
            .interface
            .latest_block(chain)
            .await
            .map_err(|e| SyncError::SlowSyncError(format!("{:?}", e)))?;
        if start_block > latest_block {
            tracing::debug!(
                "[{}] slow sync {}: start block {} is past head {}",
                context.txid_version,
                chain,
                start_block,
                latest_block
            );
            return Ok(());
        }

        let total_blocks = latest_block - start_block;
        tracing::info!(
            "[{}] slow sync {}: {} blocks from {}",
            context.txid_version,
            chain,
            total_blocks,
            start_block
        );

        let batch_size = self.config.slow_sync_batch_size.max(1);
        let mut from_block = start_block;
        while from_block <= latest_block {
            let to_block = latest_block.min(from_block.saturating_add(batch_size - 1));
            self.slow_sync_batch(context, start_block, from_block, to_block, total_blocks)
                .await?;
            from_block = to_block + 1;
        }
        Ok(())
    }

    async fn slow_sync_batch(
        &self,
        context: &NetworkContext,
        start_block: u64,
        from_block: u64,
        to_block: u64,
        total_blocks: u64,
    ) -> Result<(), SyncError> {
        let (event_sender, mut event_receiver) = mpsc::unbounded_channel();
        let source = self.interface.historical_events(
            context.chain(),
            context.txid_version,
            from_block,
            to_block,
            event_sender,
        );
        let consumer = async {
            while let Some(event) = event_receiver.recv().await {
                if let Some(synced_block) = self.handle_event(context, event).await {
                    let progress =
                        slow_sync_progress(synced_block.saturating_sub(start_block), total_blocks);
                    self.emit_progress(context, ScanKind::Utxo, progress, MerkletreeScanStatus::Updated)
                        .await;
                    self.checkpoint(context, synced_block).await?;
                }
            }
            Ok::<(), SyncError>(())
        };

        let (source_result, consumer_result) = tokio::join!(source, consumer);
        source_result.map_err(|e| SyncError::SlowSyncError(format!("{:?}", e)))?;
        consumer_result?;
        self.checkpoint(context, to_block).await
    }

    /// Applies one event to the trees. Returns the block number of a [`SyncEvent::BlockSynced`].
    async fn handle_event(&self, context: &NetworkContext, event: SyncEvent) -> Option<u64> {
        match event {
            SyncEvent::Commitments(commitment_events) => {
                let mut utxo = context.utxo.write().await;
                queue_commitment_events(&mut utxo, commitment_events);
                let validated = utxo.apply_queue(&*self.interface).await;
                tracing::debug!(
                    "[{}] validated {} leaves for {}",
                    context.txid_version,
                    validated,
                    context.chain()
                );
            }
            SyncEvent::Nullifiers(nullifiers) => {
                context.utxo.write().await.record_nullifiers(&nullifiers);
            }
            SyncEvent::Unshields(unshields) => self.record_unshields(context, unshields).await,
            SyncEvent::RailgunTransactions(transactions) => {
                self.queue_unchained_transactions(context, transactions)
                    .await
            }
            SyncEvent::BlockSynced(block) => return Some(block),
        }
        None
    }

    /// Stores unshields one at a time so a rejected event does not drop the rest.
    async fn record_unshields(&self, context: &NetworkContext, unshields: Vec<UnshieldStoredEvent>) {
        let mut utxo = context.utxo.write().await;
        for unshield in unshields {
            let txid = unshield.txid;
            if let Err(e) = utxo.record_unshield_events(vec![unshield]) {
                tracing::warn!(
                    "[{}] rejected unshield event {}: {}",
                    context.txid_version,
                    txid,
                    e
                );
            }
        }
    }

    /// Txid tree updates carried by UTXO events. Only V3 emits these; V3 transactions are not
    /// hash chained and need no linking.
    async fn queue_unchained_transactions(
        &self,
        context: &NetworkContext,
        transactions: Vec<RailgunTransaction>,
    ) {
        if context.txid_version != TxidVersion::V3PoseidonMerkle {
            tracing::debug!(
                "[{}] ignoring {} railgun transactions from utxo events",
                context.txid_version,
                transactions.len()
            );
            return;
        }
        let mut txid = context.txid.write().await;
        let outcome = match txid.queue_railgun_transactions(
            transactions,
            None,
            self.config.txid_truncation_depth,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    "[{}] could not queue railgun transactions: {}",
                    context.txid_version,
                    e
                );
                txid.clear_write_queue();
                return;
            }
        };
        let applied = txid.apply_queue();
        tracing::debug!(
            "[{}] {:?}: applied {} railgun transactions",
            context.txid_version,
            outcome,
            applied
        );
    }

    /// Runs `f` against the store on the blocking pool.
    pub(crate) async fn with_store<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(StoreError::from)?;
        Ok(result?)
    }

    /// Writes what changed in both trees since the last persist. The tree locks are released
    /// before any store IO.
    pub(crate) async fn persist_trees(&self, context: &NetworkContext) -> Result<(), SyncError> {
        let _persisting = context.persist_lock.lock().await;
        let utxo_changes = context.utxo.write().await.take_changes();
        let txid_changes = context.txid.write().await.take_changes();
        let written = self
            .with_store(move |store| {
                store.write_utxo_changes(&utxo_changes)?;
                store.write_txid_changes(&txid_changes)
            })
            .await;
        if let Err(e) = &written {
            tracing::warn!(
                "[{}] persisting trees of {} failed, rewriting them in full next time: {}",
                context.txid_version,
                context.chain(),
                e
            );
            context.utxo.write().await.mark_all_changed();
            context.txid.write().await.mark_all_changed();
        }
        written
    }

    /// Persists the trees, and the slow sync cursor unless a tree is invalid.
    async fn checkpoint(&self, context: &NetworkContext, synced_block: u64) -> Result<(), SyncError> {
        self.persist_trees(context).await?;
        if let Some(tree) = context.utxo.read().await.first_invalid_tree() {
            tracing::debug!(
                "[{}] tree {} invalid: not saving last synced block {}",
                context.txid_version,
                tree,
                synced_block
            );
            return Ok(());
        }
        let (chain, txid_version) = (context.chain(), context.txid_version);
        self.with_store(move |store| store.set_last_synced_block(chain, txid_version, synced_block))
            .await
    }

    /// Applies an event pushed by a live chain listener. New commitments schedule a delayed
    /// txid sync.
    pub async fn on_live_event(
        self: &Arc<Self>,
        chain: Chain,
        txid_version: TxidVersion,
        event: SyncEvent,
    ) -> Result<(), SyncError> {
        let context = self.network(chain, txid_version).await?;
        let triggers_txid_sync = txid_version == TxidVersion::V2PoseidonMerkle
            && matches!(&event, SyncEvent::Commitments(events) if !events.is_empty());

        self.handle_event(&context, event).await;
        self.persist_trees(&context).await?;

        if triggers_txid_sync && !self.config.skip_merkletree_scans {
            self.trigger_delayed_txid_sync(chain);
        }
        Ok(())
    }

    /// Clears the UTXO trees and wallet balances of `chain` and scans again from the
    /// deployment block. V2 txids are mapped onto UTXO commitments, so they are reset too.
    pub async fn full_rescan_utxo(self: &Arc<Self>, chain: Chain) -> Result<(), SyncError> {
        let contexts = self.networks_for_chain(chain).await;
        if contexts.is_empty() {
            return Err(SyncError::NetworkNotLoaded(
                chain,
                TxidVersion::V2PoseidonMerkle,
            ));
        }
        if contexts
            .iter()
            .any(|context| context.utxo_scanning.load(Ordering::SeqCst))
        {
            tracing::error!("full rescan of {} requested while scanning", chain);
            return Err(SyncError::AlreadyScanning(chain));
        }

        for context in contexts {
            let txid_version = context.txid_version;
            if context.utxo_scanning.swap(true, Ordering::SeqCst) {
                return Err(SyncError::AlreadyScanning(chain));
            }
            self.reset_progress(&context, ScanKind::Utxo).await;
            self.emit_progress(&context, ScanKind::Utxo, 0.01, MerkletreeScanStatus::Updated)
                .await;

            let cleared = self.clear_utxo_history(&context).await;
            context.utxo_scanning.store(false, Ordering::SeqCst);
            cleared?;

            if txid_version != TxidVersion::V2PoseidonMerkle {
                context.txid.write().await.clear();
                self.persist_trees(&context).await?;
            }

            self.scan_event_history(chain, txid_version).await?;

            if txid_version == TxidVersion::V2PoseidonMerkle {
                self.full_rescan_txids(chain).await?;
            }
        }
        Ok(())
    }

    async fn clear_utxo_history(&self, context: &NetworkContext) -> Result<(), SyncError> {
        let chain = context.chain();
        context.utxo.write().await.clear();
        self.persist_trees(context).await?;
        let txid_version = context.txid_version;
        self.with_store(move |store| {
            store.delete(&StoreKey::LastSyncedBlock(chain, txid_version))
        })
        .await?;
        self.interface
            .clear_wallet_balances(chain)
            .await
            .map_err(|e| SyncError::WalletError(format!("{:?}", e)))?;
        Ok(())
    }

    /// Phase of the last or current scan of (chain, txid version).
    pub async fn get_sync_phase(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<SyncPhase, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let phase = *context.phase.lock().await;
        Ok(phase)
    }

    async fn set_phase(&self, context: &NetworkContext, phase: SyncPhase) {
        *context.phase.lock().await = phase;
    }

    async fn reset_progress(&self, context: &NetworkContext, kind: ScanKind) {
        let mut last = match kind {
            ScanKind::Utxo => context.utxo_progress.lock().await,
            ScanKind::Txid => context.txid_progress.lock().await,
        };
        *last = 0.0;
    }

    /// Sends a progress event. Progress never decreases within one scan.
    pub(crate) async fn emit_progress(
        &self,
        context: &NetworkContext,
        kind: ScanKind,
        progress: f64,
        status: MerkletreeScanStatus,
    ) {
        let mut last = match kind {
            ScanKind::Utxo => context.utxo_progress.lock().await,
            ScanKind::Txid => context.txid_progress.lock().await,
        };
        let progress = match status {
            MerkletreeScanStatus::Incomplete => *last,
            _ => progress.clamp(*last, 1.0),
        };
        *last = progress;

        let event = ScanProgress::from_parts(
            context.chain(),
            context.txid_version,
            kind,
            progress,
            status,
        );
        // a dropped receiver only means nobody is listening
        let _ = self.progress_sender.send(event);
    }

    /// Applied commitment at `(tree, position)`.
    pub async fn get_commitment(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        position: u64,
    ) -> Result<Option<Commitment>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let utxo = context.utxo.read().await;
        Ok(utxo.get_commitment(tree, position).cloned())
    }

    /// Current root of a UTXO tree.
    pub async fn get_root(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
    ) -> Result<MerkleHash, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let root = context.utxo.read().await.root(tree);
        Ok(root)
    }

    /// Highest UTXO tree holding a commitment.
    pub async fn get_latest_tree(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<u32, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let latest = context.utxo.read().await.latest_tree();
        Ok(latest)
    }

    /// Lowest UTXO tree with a rejected root.
    pub async fn get_first_invalid_tree(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<Option<u32>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let invalid = context.utxo.read().await.first_invalid_tree();
        Ok(invalid)
    }

    /// Transaction that spent `nullifier`, if it has been seen.
    pub async fn get_nullifier_txid(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        nullifier: &MerkleHash,
    ) -> Result<Option<Txid>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let txid = context.utxo.read().await.get_nullifier_txid(nullifier);
        Ok(txid)
    }

    /// Txid that spent all of `nullifiers`, if they were spent together.
    pub async fn get_completed_txid_from_nullifiers(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        nullifiers: &[MerkleHash],
    ) -> Result<Option<Txid>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let txid = context
            .utxo
            .read()
            .await
            .get_completed_txid_from_nullifiers(nullifiers);
        Ok(txid)
    }

    /// Every unshield stored for `txid`.
    pub async fn get_all_unshields_for_txid(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        txid: &Txid,
    ) -> Result<Vec<UnshieldStoredEvent>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let utxo = context.utxo.read().await;
        Ok(utxo
            .get_all_unshield_events_for_txid(txid)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Inclusion proof of the commitment at `(tree, position)` against the current root.
    pub async fn get_merkle_proof(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        position: u64,
    ) -> Result<Option<MerkleProof>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let proof = context
            .utxo
            .read()
            .await
            .merkletree()
            .merkle_proof(tree, position);
        Ok(proof)
    }

    /// Proof for a zero value input, at the configured depth.
    pub fn dummy_merkle_proof(&self, leaf: MerkleHash) -> MerkleProof {
        MerkleProof::dummy(leaf, self.config.tree_depth)
    }

    /// Root of a txid tree as it was right after leaf `index` was applied.
    pub async fn get_historical_txid_root(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        index: u64,
    ) -> Result<Option<MerkleHash>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let root = context.txid.read().await.historical_root(tree, index);
        Ok(root)
    }

    /// Whether `root` is the txid tree root recorded when `index` was the latest leaf.
    pub async fn validate_historical_txid_root(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        index: u64,
        root: &MerkleHash,
    ) -> Result<bool, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let is_valid = context
            .txid
            .read()
            .await
            .validate_historical_root(tree, index, root);
        Ok(is_valid)
    }

    /// Global position of `(tree, index)` in the txid tree.
    pub async fn get_global_txid_position(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        index: u64,
    ) -> Result<u64, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let position = context.txid.read().await.global_position(tree, index);
        Ok(position)
    }

    /// Global index and root of the latest txid, as reported to POI validators.
    pub async fn get_latest_railgun_txid_data(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<(Option<u64>, MerkleHash), SyncError> {
        let context = self.network(chain, txid_version).await?;
        let data = context.txid.read().await.latest_railgun_txid_data();
        Ok(data)
    }

    /// Applied railgun transaction at `(tree, index)`.
    pub async fn get_railgun_transaction(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        index: u64,
    ) -> Result<Option<RailgunTransactionWithHash>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let transaction = context.txid.read().await.get_transaction(tree, index).cloned();
        Ok(transaction)
    }

    /// Whether the transaction at `(tree, index)` was mined before `block_number`.
    pub async fn railgun_txid_occurred_before_block(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        index: u64,
        block_number: u64,
    ) -> Result<bool, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let occurred = context
            .txid
            .read()
            .await
            .occurred_before_block(tree, index, block_number);
        Ok(occurred)
    }

    /// Global UTXO position of the first output of the railgun transaction at `(tree, index)`.
    pub async fn get_global_utxo_position_for_railgun_transaction(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        index: u64,
    ) -> Result<Option<u64>, SyncError> {
        let context = self.network(chain, txid_version).await?;
        let position = context
            .txid
            .read()
            .await
            .global_utxo_position_for_transaction(tree, index);
        Ok(position)
    }
}

fn queue_commitment_events(utxo: &mut UtxoMerkletree, events: Vec<CommitmentEvent>) {
    for event in events {
        let tree = event.tree_number;
        let start_position = event.start_position;
        if let Err(e) = utxo.queue_leaves(tree, start_position, event.commitments) {
            tracing::warn!(
                "[{}] dropped commitment event at {}:{}: {}",
                utxo.txid_version(),
                tree,
                start_position,
                e
            );
        }
    }
}
