use crate::clock::Clock;
use crate::error::Result;
use crate::key::CacheKey;
use crate::store::replacement::RemovalStrategy;
use crate::store::{CacheStoreStrategy, Candidate, EntryMetadata};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// A decoded value resident in the memory tier.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    key: CacheKey,
    value: V,
    /// Only kept when evictions are written through to disk.
    raw: Option<Bytes>,
    metadata: EntryMetadata,
}

impl<V> CacheEntry<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }

    pub fn raw_size_bytes(&self) -> u64 {
        self.metadata.size
    }

    pub fn created_time(&self) -> u64 {
        self.metadata.created_at
    }

    pub fn last_used_time(&self) -> u64 {
        self.metadata.last_used_at
    }

    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }
}

/// The in-memory tier: at most `max_capacity` decoded values, trimmed by a [`RemovalStrategy`].
///
/// Every successful [`get`](MemoryStore::get) is a use, which is what keeps least-recently-used
/// eviction honest. Use [`peek`](MemoryStore::peek) to inspect without affecting usage order.
pub struct MemoryStore<V> {
    data: HashMap<CacheKey, CacheEntry<V>>,
    max_capacity: usize,
    strategy: RemovalStrategy,
    clock: Arc<dyn Clock>,
    valid_time: Option<u64>,
    next_seq: u64,
}

impl<V> MemoryStore<V> {
    pub fn new(max_capacity: usize, strategy: RemovalStrategy, clock: Arc<dyn Clock>) -> Self {
        MemoryStore {
            data: HashMap::new(),
            max_capacity,
            strategy,
            clock,
            valid_time: None,
            next_seq: 0,
        }
    }

    /// Entries older than `valid_time` milliseconds are dropped on read. `None` never expires.
    pub fn with_valid_time(mut self, valid_time: Option<u64>) -> Self {
        self.valid_time = valid_time;
        self
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Removes `key` if it has outlived the valid time. Returns true when it did.
    fn expire(&mut self, key: &CacheKey, now: u64) -> bool {
        let expired = self
            .data
            .get(key)
            .is_some_and(|entry| entry.metadata.is_expired(now, self.valid_time));
        if expired {
            tracing::debug!(key = %key, "memory entry expired");
            self.data.remove(key);
        }
        expired
    }

    /// Looks up `key` and records the read.
    pub fn get(&mut self, key: &CacheKey) -> Option<&CacheEntry<V>> {
        let now = self.clock.now_millis();
        if self.expire(key, now) || !self.data.contains_key(key) {
            return None;
        }

        let seq = self.next_seq();
        let entry = self.data.get_mut(key)?;
        entry.metadata.touch(now, seq);
        Some(entry)
    }

    /// Looks up `key` without recording a read. Expired entries are reported absent.
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry<V>> {
        let now = self.clock.now_millis();
        self.data
            .get(key)
            .filter(|entry| !entry.metadata.is_expired(now, self.valid_time))
    }

    /// Records a read without returning the value. Returns false if `key` is not resident.
    pub fn touch(&mut self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or overwrites `key`, created now, and returns whatever had to be evicted.
    pub fn put(&mut self, key: CacheKey, value: V, size: u64) -> Vec<CacheEntry<V>> {
        let now = self.clock.now_millis();
        self.put_entry(key, value, size, now, None)
    }

    /// Inserts or overwrites `key` with an explicit creation time, so values reloaded from a
    /// lower tier keep their original age. Eviction happens in the same call: the store is never
    /// observably over capacity.
    pub fn put_entry(
        &mut self,
        key: CacheKey,
        value: V,
        size: u64,
        created_at: u64,
        raw: Option<Bytes>,
    ) -> Vec<CacheEntry<V>> {
        let now = self.clock.now_millis();
        let seq = self.next_seq();
        let metadata = EntryMetadata::new(size, created_at, now, seq);
        self.data.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                raw,
                metadata,
            },
        );

        self.evict_to_capacity()
    }

    fn evict_to_capacity(&mut self) -> Vec<CacheEntry<V>> {
        let mut evicted = Vec::new();
        while self.data.len() > self.max_capacity {
            let candidates: Vec<Candidate<'_>> = self
                .data
                .values()
                .map(|entry| Candidate {
                    key: &entry.key,
                    metadata: &entry.metadata,
                })
                .collect();
            let Some(victim) = self.strategy.choose_victim(&candidates) else {
                break;
            };
            match self.data.remove(&victim) {
                Some(entry) => {
                    tracing::trace!(key = %victim, "evicted from memory");
                    evicted.push(entry);
                }
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.data.remove(key)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now_millis();
        let valid_time = self.valid_time;
        let before = self.data.len();
        self.data
            .retain(|_, entry| !entry.metadata.is_expired(now, valid_time));
        before - self.data.len()
    }

}

impl<V> CacheStoreStrategy for MemoryStore<V> {
    fn contains(&self, key: &CacheKey) -> bool {
        self.peek(key).is_some()
    }

    fn delete(&mut self, key: &CacheKey) -> bool {
        self.remove(key).is_some()
    }

    fn flush(&mut self) -> Result<()> {
        self.data.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}
