#![warn(missing_docs)]
//! Railgun merkletree sync engine
//!
//! Rebuilds the UTXO commitment tree and the railgun txid tree of a network from indexer and
//! chain log feeds, validating every new root and recovering from reorgs.
//!
//! Entrypoint: [`crate::sync::RailgunEngine::scan_event_history`]

pub mod error;
pub mod hash;
pub(crate) mod link;
pub mod merkletree;
#[allow(missing_docs)]
pub mod primitives;
pub mod store;
pub mod sync;
pub mod traits;

pub use railgun_config::{Chain, ChainType, EngineRole, NetworkConfig, RailgunConfig};
pub use railgun_status::{
    scan_status::MerkletreeScanStatus, sync_phase::SyncPhase, tree_validity::TreeValidity,
};

static LOG_INIT: std::sync::Once = std::sync::Once::new();

/// Installs a `tracing` fmt subscriber. Calling this more than once is a no-op.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().try_init();
    });
}
