/// Phase of the per (chain, version) sync state machine.
///
/// `Idle -> QuickSyncing -> SlowSyncing -> WalletReindex -> {Complete | Incomplete}`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    #[default]
    Idle,
    QuickSyncing,
    SlowSyncing,
    WalletReindex,
    Complete,
    Incomplete,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::QuickSyncing => "quick sync",
            Self::SlowSyncing => "slow sync",
            Self::WalletReindex => "wallet reindex",
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
        };
        write!(f, "{name}")
    }
}
