//! Traits for interfacing the sync engine with indexers, chain nodes, validators and wallets

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::mpsc;

use railgun_config::Chain;

use crate::hash::MerkleHash;
use crate::primitives::{QuickSyncEvents, RailgunTransaction, SyncEvent, TxidVersion};

/// Shared error type of every collaborator an engine is built with
pub trait SyncInterface {
    /// Errors associated with reaching the collaborator
    type Error: Debug + Send;
}

/// Bulk indexer
#[async_trait]
pub trait QuickSync: SyncInterface {
    /// Returns every commitment, nullifier and unshield event from `from_block` on.
    /// V3 indexers also return railgun transactions.
    async fn quick_sync_events(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        from_block: u64,
    ) -> Result<QuickSyncEvents, Self::Error>;

    /// Returns up to one page of railgun transactions following the one with `after_graph_id`,
    /// or from the start when `None`.
    async fn quick_sync_railgun_transactions(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        after_graph_id: Option<String>,
    ) -> Result<Vec<RailgunTransaction>, Self::Error>;
}

/// Direct chain log enumeration
#[async_trait]
pub trait SlowSync: SyncInterface {
    /// Current chain head.
    async fn latest_block(&self, chain: Chain) -> Result<u64, Self::Error>;

    /// Sends every event in `from_block..=to_block` through `events`, with
    /// [`SyncEvent::BlockSynced`] as blocks complete. Returns when the range is exhausted.
    async fn historical_events(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        from_block: u64,
        to_block: u64,
        events: mpsc::UnboundedSender<SyncEvent>,
    ) -> Result<(), Self::Error>;
}

/// Authoritative merkleroot check, on chain or by consensus
#[async_trait]
pub trait ValidateMerkleroot: SyncInterface {
    /// Whether `root` is a known root of UTXO tree `tree`.
    async fn validate_merkleroot(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
        tree: u32,
        root: MerkleHash,
    ) -> Result<bool, Self::Error>;
}

/// Txid history confirmed by POI nodes
#[async_trait]
pub trait ValidatedTxids: SyncInterface {
    /// Latest global txid index validated by POI consensus, if any.
    async fn latest_validated_txid_index(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<Option<u64>, Self::Error>;
}

/// Wallet balance indexing
#[async_trait]
pub trait WalletReindex: SyncInterface {
    /// Rescans every loaded wallet against the current trees.
    async fn reindex_wallets(
        &self,
        chain: Chain,
        txid_version: TxidVersion,
    ) -> Result<(), Self::Error>;

    /// Drops every wallet balance derived from this chain's trees.
    async fn clear_wallet_balances(&self, chain: Chain) -> Result<(), Self::Error>;
}
