//! Top level error module for the crate

use railgun_config::Chain;

use crate::merkletree::error::MerkletreeError;
use crate::primitives::TxidVersion;
use crate::store::StoreError;

/// Top level error enum encapsulating any error that may occur during sync
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Errors associated with the merkletrees and their side tables
    #[error("Merkletree error. {0}")]
    MerkletreeError(#[from] MerkletreeError),
    /// Errors associated with persistence
    #[error("Store error. {0}")]
    StoreError(#[from] StoreError),
    /// The bulk indexer failed
    #[error("Quick sync failed. {0}")]
    QuickSyncError(String),
    /// Direct log enumeration failed
    #[error("Slow sync failed. {0}")]
    SlowSyncError(String),
    /// The txid indexer or validated txid source failed
    #[error("Txid sync failed. {0}")]
    TxidSyncError(String),
    /// The wallet re-index collaborator failed
    #[error("Wallet reindex failed. {0}")]
    WalletError(String),
    /// No network was loaded for this chain and version
    #[error("Network {0} not loaded for {1}")]
    NetworkNotLoaded(Chain, TxidVersion),
    /// Admin operation requested while a scan holds the reentrancy flag
    #[error("Cannot rescan {0}. Already scanning.")]
    AlreadyScanning(Chain),
}
