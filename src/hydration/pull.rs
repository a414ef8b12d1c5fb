use crate::clock::Clock;
use crate::compression::{CompressionTransform, Downscaler, FileSystem};
use crate::error::{CacheError, Result};
use crate::hydration::Retrieval;
use crate::key::CacheKey;
use crate::source_of_record::{Decoder, SourceOfRecord};
use crate::store::discrete_files::DiscreteFileStore;
use crate::store::memory::{CacheEntry, MemoryStore};
use crate::store::CacheStoreStrategy;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use uuid::Uuid;

const STAGING_DIRECTORY: &str = "staging";

/// Both tiers, each behind its own lock. Never hold both locks at once.
pub struct Tiers<V> {
    pub memory: Mutex<MemoryStore<V>>,
    pub disk: Mutex<DiscreteFileStore>,
}

/// Pulls a missing value into the cache: disk first, then the source of record, writing the
/// result back through both tiers before returning it.
///
/// Disk I/O and decoding run on the blocking pool; only the network fetch is awaited directly.
pub struct PullHydrator<V> {
    pub(crate) tiers: Arc<Tiers<V>>,
    pub(crate) source: Arc<dyn SourceOfRecord>,
    pub(crate) decoder: Arc<dyn Decoder<V>>,
    pub(crate) compression: Option<CompressionTransform>,
    pub(crate) downscaler: Arc<dyn Downscaler>,
    pub(crate) file_system: Arc<dyn FileSystem>,
    /// Where payloads are staged for the compression transform. Nothing else writes here.
    pub(crate) staging_directory: PathBuf,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) timeout: Duration,
    pub(crate) write_through_on_evict: bool,
}

impl<V> PullHydrator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub async fn hydrate(&self, key: &CacheKey) -> Result<(V, Retrieval)> {
        if let Some(value) = self.try_disk(key).await? {
            tracing::debug!(key = %key, "disk hit");
            return Ok((value, Retrieval::Disk));
        }

        let value = self.try_source(key).await?;
        tracing::debug!(key = %key, "fetched from source of record");
        Ok((value, Retrieval::Network))
    }

    async fn try_disk(&self, key: &CacheKey) -> Result<Option<V>> {
        let tiers = self.tiers.clone();
        let disk_key = key.clone();
        let loaded = tokio::task::spawn_blocking(move || tiers.disk.lock().load(&disk_key))
            .await
            .map_err(disk_join_error)??;

        let Some((data, metadata)) = loaded else {
            return Ok(None);
        };

        let value = match self.decode(key, &data).await {
            Ok(value) => value,
            Err(err) => {
                // Undecodable bytes on disk would fail every future lookup too.
                self.remove_from_disk(key).await;
                return Err(err);
            }
        };
        self.admit(key, value.clone(), data, metadata.created_at)
            .await;
        Ok(Some(value))
    }

    async fn try_source(&self, key: &CacheKey) -> Result<V> {
        let timeout = self.timeout;
        // A transport that panics must still end in a failure for its requesters.
        let source = self.source.clone();
        let fetch_key = key.clone();
        let mut fetch = tokio::spawn(async move { source.retrieve(&fetch_key, timeout).await });
        let data = match tokio::time::timeout(timeout, &mut fetch).await {
            Ok(joined) => joined.map_err(source_join_error)??,
            Err(_) => {
                fetch.abort();
                return Err(CacheError::NetworkTimeout(timeout));
            }
        };

        let data = self.compress(key, data).await?;
        let value = self.decode(key, &data).await?;
        let created_at = self.clock.now_millis();

        let tiers = self.tiers.clone();
        let disk_key = key.clone();
        let disk_data = data.clone();
        let saved = tokio::task::spawn_blocking(move || {
            tiers
                .disk
                .lock()
                .save_entry(&disk_key, &disk_data, created_at)
        })
        .await
        .map_err(disk_join_error)
        .and_then(|saved| saved);
        if let Err(err) = saved {
            tracing::warn!(key = %key, error = %err, "failed to save to disk");
        }

        self.admit(key, value.clone(), data, created_at).await;
        Ok(value)
    }

    /// Stages the payload so the compression transform can size it, then applies the factor it
    /// returns. Staging failures leave the payload as it is.
    async fn compress(&self, key: &CacheKey, data: Bytes) -> Result<Bytes> {
        let Some(transform) = self.compression.clone() else {
            return Ok(data);
        };
        let staging_path = self
            .staging_directory
            .join(format!("{}.part", Uuid::new_v4().hyphenated()));
        let file_system = self.file_system.clone();
        let downscaler = self.downscaler.clone();
        let key = key.clone();

        tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let factor = match fs::write(&staging_path, &data) {
                Ok(()) => {
                    let factor = transform(&staging_path, file_system.as_ref());
                    let _ = fs::remove_file(&staging_path);
                    factor
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "failed to stage payload, not compressing");
                    1
                }
            };
            if factor <= 1 {
                return Ok(data);
            }
            let original = data.len();
            let shrunk = downscaler.downscale(&key, data, factor)?;
            tracing::debug!(key = %key, factor, original, shrunk = shrunk.len(), "compressed payload");
            Ok(shrunk)
        })
        .await
        .map_err(decode_join_error)?
    }

    async fn decode(&self, key: &CacheKey, data: &Bytes) -> Result<V> {
        let decoder = self.decoder.clone();
        let key = key.clone();
        let data = data.clone();
        tokio::task::spawn_blocking(move || decoder.decode(&key, &data))
            .await
            .map_err(decode_join_error)?
    }

    /// Makes `value` resident in memory and, if configured, writes evicted entries that the
    /// disk tier no longer holds back to disk.
    async fn admit(&self, key: &CacheKey, value: V, data: Bytes, created_at: u64) {
        let raw = self.write_through_on_evict.then(|| data.clone());
        let size = data.len() as u64;
        let evicted =
            self.tiers
                .memory
                .lock()
                .put_entry(key.clone(), value, size, created_at, raw);

        if self.write_through_on_evict && !evicted.is_empty() {
            let tiers = self.tiers.clone();
            let result = tokio::task::spawn_blocking(move || write_through(&tiers, evicted)).await;
            if let Err(err) = result {
                tracing::warn!(error = %err, "write-through worker failed");
            }
        }
    }

    async fn remove_from_disk(&self, key: &CacheKey) {
        let tiers = self.tiers.clone();
        let key = key.clone();
        let _ = tokio::task::spawn_blocking(move || tiers.disk.lock().delete(&key)).await;
    }
}

/// Creates the staging directory under `disk_directory` and clears whatever an interrupted
/// process left in it.
pub fn open_staging_directory(disk_directory: &Path) -> Result<PathBuf> {
    let staging = disk_directory.join(STAGING_DIRECTORY);
    fs::create_dir_all(&staging)?;
    for entry in fs::read_dir(&staging)?.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove stale staged payload");
            }
        }
    }
    Ok(staging)
}

fn write_through<V>(tiers: &Tiers<V>, evicted: Vec<CacheEntry<V>>) {
    let mut disk = tiers.disk.lock();
    for entry in evicted {
        if disk.contains(entry.key()) {
            continue;
        }
        let Some(raw) = entry.raw() else {
            continue;
        };
        match disk.save_entry(entry.key(), raw, entry.created_time()) {
            Ok(_) => tracing::trace!(key = %entry.key(), "wrote evicted entry through to disk"),
            Err(err) => {
                tracing::warn!(key = %entry.key(), error = %err, "write-through to disk failed")
            }
        }
    }
}

fn source_join_error(err: JoinError) -> CacheError {
    CacheError::Network(format!("transport task failed: {err}"))
}

fn disk_join_error(err: JoinError) -> CacheError {
    CacheError::DiskIo(format!("disk worker failed: {err}"))
}

fn decode_join_error(err: JoinError) -> CacheError {
    CacheError::Decode(format!("decode worker failed: {err}"))
}
