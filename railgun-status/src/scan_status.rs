/// Status attached to every scan progress event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MerkletreeScanStatus {
    /// Scan in flight, progress value is meaningful.
    Updated,
    /// Scan finished and every batch was committed.
    Complete,
    /// Scan stopped on an error. Whatever was committed before the error is kept.
    Incomplete,
}

impl MerkletreeScanStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for MerkletreeScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use MerkletreeScanStatus::*;
        match self {
            Updated => write!(f, "Scan in progress."),
            Complete => write!(f, "Scan complete."),
            Incomplete => write!(f, "Scan incomplete."),
        }
    }
}

impl From<MerkletreeScanStatus> for String {
    fn from(value: MerkletreeScanStatus) -> Self {
        format!("{value}")
    }
}
