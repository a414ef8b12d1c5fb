pub mod discrete_files;
pub mod memory;
pub mod persistence;
pub mod replacement;

use crate::error::Result;
use crate::key::CacheKey;
use serde::{Deserialize, Serialize};

/// Key-level operations both tiers answer the same way, whatever they keep per key.
pub trait CacheStoreStrategy {
    /// True if `key` is stored and not expired. Does not record a use.
    fn contains(&self, key: &CacheKey) -> bool;

    /// Drops `key`. Returns true if it was stored.
    fn delete(&mut self, key: &CacheKey) -> bool;

    /// Drops everything.
    fn flush(&mut self) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Usage bookkeeping shared by the memory and disk tiers.
///
/// Times are clock milliseconds. The sequence numbers come from a per-tier counter and break
/// ties between entries stamped within the same millisecond, which keeps victim selection
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub size: u64,
    pub created_at: u64,
    pub last_used_at: u64,
    pub use_count: u64,
    pub inserted_seq: u64,
    pub last_used_seq: u64,
}

impl EntryMetadata {
    pub fn new(size: u64, created_at: u64, now: u64, seq: u64) -> Self {
        EntryMetadata {
            size,
            created_at,
            last_used_at: now,
            use_count: 0,
            inserted_seq: seq,
            last_used_seq: seq,
        }
    }

    pub fn touch(&mut self, now: u64, seq: u64) {
        self.last_used_at = now;
        self.last_used_seq = seq;
        self.use_count += 1;
    }

    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// An entry stays valid while its age is at most `valid_time`.
    pub fn is_expired(&self, now: u64, valid_time: Option<u64>) -> bool {
        valid_time.is_some_and(|valid| self.age(now) > valid)
    }
}

/// A resident entry as offered to a [`RemovalStrategy`](replacement::RemovalStrategy).
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub key: &'a CacheKey,
    pub metadata: &'a EntryMetadata,
}
