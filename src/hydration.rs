pub mod coordinator;
pub mod pull;

/// Which tier satisfied a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Retrieval {
    /// Value was already resident in memory when requested.
    Memory,

    /// Value was not in memory but was reloaded from the disk tier.
    Disk,

    /// Value was in neither tier and had to be fetched from the source of record.
    Network,
}

impl Retrieval {
    /// False only for values that have never been cached before, which is when callers may
    /// want a first-appearance transition.
    pub fn is_in_cache(self) -> bool {
        !matches!(self, Retrieval::Network)
    }
}
