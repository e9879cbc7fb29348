//! Txid sync: fetches railgun transactions from the txid indexer, links them to the UTXO tree
//! and appends them to the V2 txid tree.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use railgun_config::Chain;
use railgun_status::scan_status::MerkletreeScanStatus;

use crate::error::SyncError;
use crate::link::{link_railgun_transactions, linkable_prefix};
use crate::merkletree::txid::QueueOutcome;
use crate::primitives::{RailgunTransactionWithHash, ScanKind, TxidVersion};
use crate::store::EngineStore;
use crate::traits::{QuickSync, SlowSync, ValidateMerkleroot, ValidatedTxids, WalletReindex};

use super::{NetworkContext, RailgunEngine, CURRENT_TXID_HISTORY_VERSION};

const TXID_SCAN_START: f64 = 0.03;
const TXID_SCAN_FETCH: f64 = 0.15;
const TXID_SCAN_QUEUE_START: f64 = 0.4;
const TXID_SCAN_QUEUE_END: f64 = 0.99;

/// What one page of the txid indexer led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxidPage {
    /// The local tree already reaches the validated index
    Skipped,
    /// A full page was queued; more transactions are waiting
    Full,
    Done,
}

impl<I, S> RailgunEngine<I, S>
where
    I: QuickSync + SlowSync + ValidateMerkleroot + ValidatedTxids + WalletReindex + Send + Sync + 'static,
    S: EngineStore + 'static,
{
    /// Syncs the V2 txid tree of `chain` with the txid indexer.
    ///
    /// Returns `None` when scans are disabled or a txid sync for the chain is already running.
    /// `trigger` is only logged.
    pub async fn sync_railgun_transactions(
        &self,
        chain: Chain,
        trigger: &str,
    ) -> Result<Option<MerkletreeScanStatus>, SyncError> {
        if self.config.skip_merkletree_scans {
            return Ok(None);
        }
        let context = self.network(chain, TxidVersion::V2PoseidonMerkle).await?;

        if context.txid_scanning.swap(true, Ordering::SeqCst) {
            tracing::debug!("[txid] already syncing {}. stopping additional re-sync", chain);
            return Ok(None);
        }
        tracing::info!("sync railgun txids for {}: triggered by {}", chain, trigger);
        let status = self.perform_txid_sync(&context).await;
        context.txid_scanning.store(false, Ordering::SeqCst);

        Ok(Some(status))
    }

    async fn perform_txid_sync(&self, context: &NetworkContext) -> MerkletreeScanStatus {
        self.reset_progress(context, ScanKind::Txid).await;

        let result = async {
            self.check_txid_history_version(context).await?;
            loop {
                match self.sync_txid_page(context).await? {
                    TxidPage::Full => {
                        tracing::info!("[txid] full page synced for {}. re-syncing", context.chain())
                    }
                    TxidPage::Skipped | TxidPage::Done => return Ok::<(), SyncError>(()),
                }
            }
        }
        .await;

        match result {
            Ok(()) => {
                self.emit_progress(context, ScanKind::Txid, 1.0, MerkletreeScanStatus::Complete)
                    .await;
                MerkletreeScanStatus::Complete
            }
            Err(e) => {
                tracing::error!("[txid] sync incomplete for {}: {}", context.chain(), e);
                self.emit_progress(context, ScanKind::Txid, 0.0, MerkletreeScanStatus::Incomplete)
                    .await;
                MerkletreeScanStatus::Incomplete
            }
        }
    }

    /// Wipes the txid tree of `context` if its stored history version is stale.
    async fn check_txid_history_version(&self, context: &NetworkContext) -> Result<(), SyncError> {
        let chain = context.chain();
        let stored = self
            .with_store(move |store| store.get_txid_history_version(chain))
            .await?;
        if stored.is_some_and(|version| version >= CURRENT_TXID_HISTORY_VERSION) {
            return Ok(());
        }
        tracing::info!(
            "txid history version {:?} for {} is stale: clearing txid merkletree",
            stored,
            chain
        );
        context.txid.write().await.clear();
        self.persist_trees(context).await?;
        self.with_store(move |store| {
            store.set_txid_history_version(chain, CURRENT_TXID_HISTORY_VERSION)
        })
        .await
    }

    async fn sync_txid_page(&self, context: &NetworkContext) -> Result<TxidPage, SyncError> {
        let chain = context.chain();
        let txid_version = context.txid_version;

        self.emit_progress(context, ScanKind::Txid, TXID_SCAN_START, MerkletreeScanStatus::Updated)
            .await;
        self.emit_progress(context, ScanKind::Txid, TXID_SCAN_FETCH, MerkletreeScanStatus::Updated)
            .await;

        let after_graph_id = context
            .txid
            .read()
            .await
            .latest_transaction()
            .map(|latest| latest.transaction().graph_id.clone());
        let transactions = self
            .interface
            .quick_sync_railgun_transactions(chain, txid_version, after_graph_id)
            .await
            .map_err(|e| SyncError::TxidSyncError(format!("{:?}", e)))?;
        let fetched = transactions.len();
        self.emit_progress(
            context,
            ScanKind::Txid,
            TXID_SCAN_QUEUE_START,
            MerkletreeScanStatus::Updated,
        )
        .await;

        // POI nodes produce the validated history, so they never wait on it
        let latest_validated_index = if self.config.role.is_poi_node() {
            None
        } else {
            self.interface
                .latest_validated_txid_index(chain, txid_version)
                .await
                .map_err(|e| SyncError::TxidSyncError(format!("{:?}", e)))?
        };
        tracing::debug!(
            "syncing railgun transactions to validated index: {:?}",
            latest_validated_index
        );
        if let Some(validated) = latest_validated_index {
            if context.txid.read().await.is_synced_to_validated_index(validated) {
                tracing::info!(
                    "[txid] skipping queue of railgun txids: already synced to validated index {}",
                    validated
                );
                return Ok(TxidPage::Skipped);
            }
        }

        let (prefix, queued) = {
            let mut utxo = context.utxo.write().await;
            let mut txid = context.txid.write().await;
            let engine_v2_start_block = context.network.engine_v2_start_block;
            let fee_bps = self.config.pre_v2_unshield_fee_bps;

            let capacity = txid.utxo_tree_capacity();
            let with_hash: Vec<RailgunTransactionWithHash> = transactions
                .iter()
                .cloned()
                .map(|transaction| RailgunTransactionWithHash::new(transaction, capacity))
                .collect();
            let prefix = linkable_prefix(&utxo, &with_hash, engine_v2_start_block, fee_bps);
            if prefix < fetched {
                tracing::info!(
                    "[txid] stopping queue of railgun txids after {} of {}: utxo tree is behind",
                    prefix,
                    fetched
                );
            }

            let outcome = txid.queue_railgun_transactions(
                transactions[..prefix].to_vec(),
                latest_validated_index,
                self.config.txid_truncation_depth,
            );
            let queued = match outcome {
                Ok(QueueOutcome::Queued(queued)) => {
                    let linked = link_railgun_transactions(
                        &mut utxo,
                        &with_hash[..queued],
                        engine_v2_start_block,
                        fee_bps,
                    );
                    if let Err(e) = linked {
                        // nothing queued may outlive a failed page
                        txid.clear_write_queue();
                        return Err(e.into());
                    }
                    let applied = txid.apply_queue();
                    tracing::debug!("[txid] applied {} railgun transactions", applied);
                    queued
                }
                Ok(QueueOutcome::Skipped) => 0,
                Ok(QueueOutcome::ChainBreak { truncated }) => {
                    tracing::warn!(
                        "[txid] verification hash break for {}: truncated {} leaves, waiting for reorg to resolve",
                        chain,
                        truncated
                    );
                    0
                }
                Err(e) => {
                    txid.clear_write_queue();
                    return Err(e.into());
                }
            };
            (prefix, queued)
        };
        self.persist_trees(context).await?;

        if fetched > 0 {
            let progress = TXID_SCAN_QUEUE_START
                + (TXID_SCAN_QUEUE_END - TXID_SCAN_QUEUE_START) * prefix as f64 / fetched as f64;
            self.emit_progress(context, ScanKind::Txid, progress, MerkletreeScanStatus::Updated)
                .await;
        }
        let fully_queued = queued == fetched;

        if fetched > 0 {
            if let Err(e) = self.interface.reindex_wallets(chain, txid_version).await {
                tracing::warn!("[txid] wallet reindex failed for {}: {:?}", chain, e);
            }
        }

        if fully_queued && fetched == self.config.txid_sync_page_size {
            Ok(TxidPage::Full)
        } else {
            Ok(TxidPage::Done)
        }
    }

    /// Schedules txid syncs after new commitments, with the role dependent delays of
    /// [`railgun_config::RailgunConfig::txid_sync_delay`]. A trigger while one is pending is
    /// dropped.
    pub fn trigger_delayed_txid_sync(self: &Arc<Self>, chain: Chain) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(context) = engine
                .network(chain, TxidVersion::V2PoseidonMerkle)
                .await
            else {
                return;
            };
            if context
                .delayed_txid_sync_pending
                .swap(true, Ordering::SeqCst)
            {
                tracing::debug!("[txid] delayed sync already pending for {}", chain);
                return;
            }
            for attempt in 0..engine.config.delayed_txid_sync_attempts {
                tokio::time::sleep(engine.config.txid_sync_delay(attempt)).await;
                if let Err(e) = engine
                    .sync_railgun_transactions(chain, "delayed sync after new utxo")
                    .await
                {
                    tracing::warn!("[txid] delayed sync failed for {}: {}", chain, e);
                    break;
                }
            }
            context
                .delayed_txid_sync_pending
                .store(false, Ordering::SeqCst);
        });
    }

    /// Starts polling the txid indexer for `chain`, once per
    /// [`railgun_config::RailgunConfig::txid_poll_interval`]. The first poll runs immediately.
    pub async fn start_txid_poller(self: &Arc<Self>, chain: Chain) {
        let mut pollers = self.pollers.lock().await;
        if pollers.contains_key(&chain) {
            return;
        }
        let engine = Arc::downgrade(self);
        let period = self.config.txid_poll_interval();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if let Err(e) = engine.sync_railgun_transactions(chain, "poller").await {
                    tracing::warn!("[txid] poll failed for {}: {}", chain, e);
                }
            }
        });
        pollers.insert(chain, handle);
        tracing::info!("started txid poller for {} every {:?}", chain, period);
    }

    /// Clears the V2 txid tree of `chain` and syncs it again from the first transaction.
    pub async fn full_rescan_txids(&self, chain: Chain) -> Result<(), SyncError> {
        let context = self.network(chain, TxidVersion::V2PoseidonMerkle).await?;
        if context.txid_scanning.swap(true, Ordering::SeqCst) {
            tracing::error!("full reset of txids for {} requested while syncing", chain);
            return Err(SyncError::AlreadyScanning(chain));
        }
        let cleared = async {
            context.txid.write().await.clear();
            self.persist_trees(&context).await
        }
        .await;
        context.txid_scanning.store(false, Ordering::SeqCst);
        cleared?;

        self.sync_railgun_transactions(chain, "full txid reset")
            .await?;
        Ok(())
    }

    /// Removes every txid after `global_index`, for manual reorg recovery, then syncs again.
    pub async fn reset_txids_after_index(
        &self,
        chain: Chain,
        global_index: u64,
    ) -> Result<(), SyncError> {
        let context = self.network(chain, TxidVersion::V2PoseidonMerkle).await?;
        if context.txid_scanning.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyScanning(chain));
        }
        let cleared = async {
            context
                .txid
                .write()
                .await
                .clear_leaves_after_index(global_index);
            self.persist_trees(&context).await
        }
        .await;
        context.txid_scanning.store(false, Ordering::SeqCst);
        cleared?;

        self.sync_railgun_transactions(chain, "reset after txid index")
            .await?;
        Ok(())
    }
}
