/// Root validity of one tree of an accumulator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TreeValidity {
    #[default]
    Valid,
    /// The root computed after applying the batch starting at this position was rejected.
    InvalidFrom(u64),
}

impl TreeValidity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
    /// A valid batch starting at or before the invalid position clears the marker.
    pub fn cleared_by_batch_at(&self, batch_start: u64) -> bool {
        match self {
            Self::InvalidFrom(position) => batch_start <= *position,
            Self::Valid => true,
        }
    }
}

impl std::fmt::Display for TreeValidity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid => write!(f, "Valid merkleroot."),
            Self::InvalidFrom(position) => {
                write!(f, "Invalid merkleroot from position {}.", position)
            }
        }
    }
}
