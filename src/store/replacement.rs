use crate::config::RemovalStrategyKind;
use crate::key::CacheKey;
use crate::store::Candidate;
use std::fmt;
use std::sync::Arc;

pub type VictimSelector = dyn Fn(&[Candidate<'_>]) -> Option<CacheKey> + Send + Sync;

/// Chooses which resident entry a tier gives up when it is over capacity.
///
/// The same strategy type drives both tiers: the memory tier counts entries, the disk tier
/// counts bytes, and both hand their metadata to [`RemovalStrategy::choose_victim`] until they
/// fit again.
#[derive(Clone, Default)]
pub enum RemovalStrategy {
    /// Oldest `last_used_at` first. Every read is a use.
    #[default]
    LeastRecentlyUsed,
    /// Oldest `created_at` first, regardless of reads.
    FirstInFirstOut,
    /// Biggest payload first; ties go to the earliest insertion.
    LargestFirst,
    /// Fewest reads first; ties go to the least recently used.
    LeastFrequentlyUsed,
    Custom(Arc<VictimSelector>),
}

impl RemovalStrategy {
    pub fn custom<F>(selector: F) -> Self
    where
        F: Fn(&[Candidate<'_>]) -> Option<CacheKey> + Send + Sync + 'static,
    {
        RemovalStrategy::Custom(Arc::new(selector))
    }

    /// Picks a resident key to evict, or `None` when there is nothing to evict.
    ///
    /// A custom selector that declines or names a key outside `candidates` falls back to
    /// least-recently-used, so a non-empty tier always yields a victim.
    pub fn choose_victim(&self, candidates: &[Candidate<'_>]) -> Option<CacheKey> {
        let victim = match self {
            RemovalStrategy::LeastRecentlyUsed => least_recently_used(candidates),
            RemovalStrategy::FirstInFirstOut => candidates
                .iter()
                .min_by_key(|c| (c.metadata.created_at, c.metadata.inserted_seq)),
            RemovalStrategy::LargestFirst => candidates.iter().min_by_key(|c| {
                (
                    std::cmp::Reverse(c.metadata.size),
                    c.metadata.inserted_seq,
                )
            }),
            RemovalStrategy::LeastFrequentlyUsed => candidates.iter().min_by_key(|c| {
                (
                    c.metadata.use_count,
                    c.metadata.last_used_at,
                    c.metadata.last_used_seq,
                )
            }),
            RemovalStrategy::Custom(selector) => {
                if let Some(key) = selector(candidates) {
                    if candidates.iter().any(|c| *c.key == key) {
                        return Some(key);
                    }
                    tracing::warn!(key = %key, "custom removal strategy chose a non-resident key");
                }
                least_recently_used(candidates)
            }
        };

        victim.map(|c| c.key.clone())
    }
}

fn least_recently_used<'a, 'b>(candidates: &'a [Candidate<'b>]) -> Option<&'a Candidate<'b>> {
    candidates
        .iter()
        .min_by_key(|c| (c.metadata.last_used_at, c.metadata.last_used_seq))
}

impl From<RemovalStrategyKind> for RemovalStrategy {
    fn from(kind: RemovalStrategyKind) -> Self {
        match kind {
            RemovalStrategyKind::LeastRecentlyUsed => RemovalStrategy::LeastRecentlyUsed,
            RemovalStrategyKind::FirstInFirstOut => RemovalStrategy::FirstInFirstOut,
            RemovalStrategyKind::LargestFirst => RemovalStrategy::LargestFirst,
            RemovalStrategyKind::LeastFrequentlyUsed => RemovalStrategy::LeastFrequentlyUsed,
        }
    }
}

impl fmt::Debug for RemovalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalStrategy::LeastRecentlyUsed => f.write_str("LeastRecentlyUsed"),
            RemovalStrategy::FirstInFirstOut => f.write_str("FirstInFirstOut"),
            RemovalStrategy::LargestFirst => f.write_str("LargestFirst"),
            RemovalStrategy::LeastFrequentlyUsed => f.write_str("LeastFrequentlyUsed"),
            RemovalStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
