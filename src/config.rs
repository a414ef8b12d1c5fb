use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Victim selection policy, in the serializable form used by configuration files.
///
/// A closure-based policy can only be set programmatically, see
/// [`RemovalStrategy::custom`](crate::store::replacement::RemovalStrategy::custom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStrategyKind {
    #[default]
    LeastRecentlyUsed,
    FirstInFirstOut,
    LargestFirst,
    LeastFrequentlyUsed,
}

/// Configuration recognized by [`ResourceCache`](crate::ResourceCache).
///
/// ```rust
/// # use resource_cache::CacheConfig;
/// let config = CacheConfig::new()
///     .memory_capacity(128)
///     .http_timeout_millis(10_000)
///     .open_waiting_queue(true)
///     .valid_time_millis(-1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of decoded values resident in memory. Default: 128.
    pub memory_capacity_count: usize,
    /// Maximum cumulative payload bytes held on disk. Default: 64 MiB.
    pub disk_capacity_bytes: u64,
    /// Upper bound for a single network fetch. Default: 10 s.
    pub http_timeout_millis: u64,
    /// Maximum entry age; `-1` never expires. Default: -1.
    pub valid_time_millis: i64,
    /// Queue fetches beyond `max_concurrent_fetches` instead of starting them. Default: false.
    pub open_waiting_queue: bool,
    /// In-flight fetch limit while the waiting queue is open. Default: 8.
    pub max_concurrent_fetches: usize,
    pub removal_strategy: RemovalStrategyKind,
    /// Save memory evictions to disk when the disk tier no longer holds them. Default: false.
    pub write_through_on_evict: bool,
    /// Directory for payload files. Defaults to `resource_cache` under the system temp dir.
    pub disk_directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            memory_capacity_count: 128,
            disk_capacity_bytes: 64 * 1024 * 1024,
            http_timeout_millis: 10_000,
            valid_time_millis: -1,
            open_waiting_queue: false,
            max_concurrent_fetches: 8,
            removal_strategy: RemovalStrategyKind::default(),
            write_through_on_evict: false,
            disk_directory: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)
            .map_err(|e| CacheError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.valid_time_millis < -1 {
            return Err(CacheError::Configuration(format!(
                "valid_time_millis must be -1 or non-negative, got {}",
                self.valid_time_millis
            )));
        }
        if self.open_waiting_queue && self.max_concurrent_fetches == 0 {
            return Err(CacheError::Configuration(
                "max_concurrent_fetches must be at least 1 when the waiting queue is open".into(),
            ));
        }
        Ok(())
    }

    pub fn memory_capacity(mut self, count: usize) -> Self {
        self.memory_capacity_count = count;
        self
    }

    pub fn disk_capacity(mut self, bytes: u64) -> Self {
        self.disk_capacity_bytes = bytes;
        self
    }

    pub fn http_timeout_millis(mut self, millis: u64) -> Self {
        self.http_timeout_millis = millis;
        self
    }

    pub fn valid_time_millis(mut self, millis: i64) -> Self {
        self.valid_time_millis = millis;
        self
    }

    pub fn open_waiting_queue(mut self, open: bool) -> Self {
        self.open_waiting_queue = open;
        self
    }

    pub fn max_concurrent_fetches(mut self, n: usize) -> Self {
        self.max_concurrent_fetches = n;
        self
    }

    pub fn removal_strategy(mut self, kind: RemovalStrategyKind) -> Self {
        self.removal_strategy = kind;
        self
    }

    pub fn write_through_on_evict(mut self, enabled: bool) -> Self {
        self.write_through_on_evict = enabled;
        self
    }

    pub fn disk_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_directory = Some(dir.into());
        self
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_millis)
    }

    /// `None` when entries never expire.
    pub fn valid_time(&self) -> Option<u64> {
        u64::try_from(self.valid_time_millis).ok()
    }

    /// `None` when fetch concurrency is unbounded.
    pub fn concurrency_limit(&self) -> Option<usize> {
        self.open_waiting_queue.then_some(self.max_concurrent_fetches)
    }

    pub fn resolved_disk_directory(&self) -> PathBuf {
        self.disk_directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("resource_cache"))
    }
}
