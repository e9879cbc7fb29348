#![forbid(unsafe_code)]
use std::{
    io::{self, Error, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};

use log::LevelFilter;
use log4rs::{
    append::rolling_file::{
        policy::compound::{
            roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
        },
        RollingFileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

pub const DEFAULT_LOGFILE_NAME: &str = "railgun-engine.debug.log";
pub const DEFAULT_TREE_DEPTH: u8 = 16;
pub const DEFAULT_SLOW_SYNC_BATCH_SIZE: u64 = 500;
/// Leaves dropped from the txid tree tail on a verification hash break. Heuristic, not a proven reorg bound.
pub const TXID_TRUNCATION_DEPTH: u64 = 10;
/// Page size of the txid indexer. A full page means more transactions are waiting.
pub const TXID_SYNC_PAGE_SIZE: usize = 5000;
pub const PRE_V2_UNSHIELD_FEE_BPS: u128 = 25;

/// Chain family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChainType {
    Evm,
}

impl ChainType {
    pub fn as_u8(&self) -> u8 {
        match self {
            ChainType::Evm => 0,
        }
    }
}

impl std::fmt::Display for ChainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A network the engine can sync, e.g. `Chain::evm(1)` for Ethereum mainnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chain {
    pub chain_type: ChainType,
    pub id: u64,
}

impl Chain {
    pub fn evm(id: u64) -> Self {
        Chain {
            chain_type: ChainType::Evm,
            id,
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain_type, self.id)
    }
}

/// Wallets consume validated txid history. POI nodes produce it and so poll faster,
/// ignore the externally validated index and keep historical roots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineRole {
    #[default]
    Wallet,
    PoiNode,
}

impl EngineRole {
    pub fn is_poi_node(&self) -> bool {
        matches!(self, EngineRole::PoiNode)
    }
}

/// Per-network parameters handed to the engine when a network is loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    pub chain: Chain,
    /// First block to scan when nothing has been synced yet.
    pub deployment_block: u64,
    /// Unshield events are only emitted on chain from this block on.
    pub engine_v2_start_block: u64,
    /// Whether the V3 accumulator is deployed on this network.
    pub supports_v3: bool,
}

impl NetworkConfig {
    pub fn new(chain: Chain, deployment_block: u64, engine_v2_start_block: u64) -> Self {
        NetworkConfig {
            chain,
            deployment_block,
            engine_v2_start_block,
            supports_v3: false,
        }
    }
}

/// Configuration shared by every network the engine syncs.
#[derive(Clone, Debug)]
pub struct RailgunConfig {
    /// The directory for stores and logfiles. Defaults to `<data dir>/railgun`.
    pub data_dir: Option<PathBuf>,
    /// The filename of the logfile. This will be created in the `data_dir`.
    pub logfile_name: PathBuf,
    pub role: EngineRole,
    pub tree_depth: u8,
    pub slow_sync_batch_size: u64,
    pub quick_sync_retries: u32,
    pub txid_truncation_depth: u64,
    pub delayed_txid_sync_attempts: u32,
    pub txid_sync_page_size: usize,
    pub skip_merkletree_scans: bool,
    pub pre_v2_unshield_fee_bps: u128,
}

impl RailgunConfig {
    pub fn create_default(data_dir: Option<PathBuf>) -> RailgunConfig {
        RailgunConfig {
            data_dir,
            logfile_name: DEFAULT_LOGFILE_NAME.into(),
            role: EngineRole::Wallet,
            tree_depth: DEFAULT_TREE_DEPTH,
            slow_sync_batch_size: DEFAULT_SLOW_SYNC_BATCH_SIZE,
            quick_sync_retries: 1,
            txid_truncation_depth: TXID_TRUNCATION_DEPTH,
            delayed_txid_sync_attempts: 3,
            txid_sync_page_size: TXID_SYNC_PAGE_SIZE,
            skip_merkletree_scans: false,
            pre_v2_unshield_fee_bps: PRE_V2_UNSHIELD_FEE_BPS,
        }
    }

    /// Leaves per tree.
    pub fn tree_capacity(&self) -> u64 {
        1u64 << self.tree_depth
    }

    /// Delay before the `attempt`th (zero based) txid sync after new commitments arrive.
    pub fn txid_sync_delay(&self, attempt: u32) -> Duration {
        match (self.role, attempt) {
            (EngineRole::PoiNode, _) => Duration::from_secs(3),
            (EngineRole::Wallet, 0) => Duration::from_secs(10),
            (EngineRole::Wallet, _) => Duration::from_secs(5),
        }
    }

    pub fn txid_poll_interval(&self) -> Duration {
        match self.role {
            EngineRole::PoiNode => Duration::from_secs(60),
            EngineRole::Wallet => Duration::from_secs(2 * 60),
        }
    }

    /// Returns the data directory, creating it if needed.
    pub fn get_data_dir(&self) -> io::Result<Box<Path>> {
        let data_location = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => {
                let mut dir = dirs::data_dir().ok_or_else(|| {
                    Error::new(ErrorKind::NotFound, "Couldn't determine app data directory")
                })?;
                dir.push("railgun");
                dir
            }
        };
        std::fs::create_dir_all(&data_location).map_err(|e| {
            log::error!("Couldn't create railgun data directory! {}", e);
            e
        })?;

        Ok(data_location.into_boxed_path())
    }

    pub fn get_log_path(&self) -> io::Result<Box<Path>> {
        let mut log_path = self.get_data_dir()?.into_path_buf();
        log_path.push(&self.logfile_name);

        Ok(log_path.into_boxed_path())
    }

    /// Build the Logging config
    pub fn get_log_config(&self) -> io::Result<Config> {
        let window_size = 3; // log0, log1, log2
        let fixed_window_roller = FixedWindowRoller::builder()
            .build("railgun-engine-log{}", window_size)
            .map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))?;
        let size_limit = 5 * 1024 * 1024; // 5MB as max log file size to roll
        let size_trigger = SizeTrigger::new(size_limit);
        let compound_policy =
            CompoundPolicy::new(Box::new(size_trigger), Box::new(fixed_window_roller));

        Config::builder()
            .appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(LevelFilter::Info)))
                    .build(
                        "logfile",
                        Box::new(
                            RollingFileAppender::builder()
                                .encoder(Box::new(PatternEncoder::new("{d} {l}::{m}{n}")))
                                .build(self.get_log_path()?, Box::new(compound_policy))?,
                        ),
                    ),
            )
            .build(
                Root::builder()
                    .appender("logfile")
                    .build(LevelFilter::Debug),
            )
            .map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))
    }
}

impl Default for RailgunConfig {
    fn default() -> Self {
        Self::create_default(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(EngineRole::PoiNode, 0, 3)]
    #[test_case(EngineRole::PoiNode, 2, 3)]
    #[test_case(EngineRole::Wallet, 0, 10)]
    #[test_case(EngineRole::Wallet, 1, 5)]
    #[test_case(EngineRole::Wallet, 2, 5)]
    fn delayed_txid_sync_timing(role: EngineRole, attempt: u32, expected_secs: u64) {
        let mut config = RailgunConfig::default();
        config.role = role;
        assert_eq!(
            config.txid_sync_delay(attempt),
            Duration::from_secs(expected_secs)
        );
    }

    #[test]
    fn poi_nodes_poll_faster() {
        let mut config = RailgunConfig::default();
        let wallet_interval = config.txid_poll_interval();
        config.role = EngineRole::PoiNode;
        assert!(config.txid_poll_interval() < wallet_interval);
    }

    #[test]
    fn capacity_follows_depth() {
        let mut config = RailgunConfig::default();
        assert_eq!(config.tree_capacity(), 65_536);
        config.tree_depth = 2;
        assert_eq!(config.tree_capacity(), 4);
    }

    #[test]
    fn log_path_lands_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = RailgunConfig::create_default(Some(dir.path().to_path_buf()));
        let log_path = config.get_log_path().unwrap();
        assert!(log_path.starts_with(dir.path()));
        assert!(config.get_log_config().is_ok());
    }

    #[test]
    fn chain_display() {
        assert_eq!(Chain::evm(137).to_string(), "0:137");
        assert_eq!(ChainType::Evm.to_string(), "0");
    }
}
