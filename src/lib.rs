//! A keyed two-tier resource cache with asynchronous, deduplicated population.
//!
//! Values live in a count-bounded memory tier in front of a byte-bounded disk tier. A lookup
//! answers synchronously with whether the value is resident, then delivers the outcome to a
//! [`CacheListener`] on a single dispatch context once the value has been loaded from disk or
//! fetched from the source of record. Concurrent lookups for one key share a single fetch, and an
//! optional waiting queue caps how many fetches run at once.
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use resource_cache::{CacheConfig, CacheKey, CacheListener, FailedReason, RawBytes, ResourceCache, Retrieval};
//!
//! struct Printer;
//!
//! impl CacheListener<Bytes, u32> for Printer {
//!     fn on_get_success(&self, key: &CacheKey, value: &Bytes, slot: u32, retrieval: Retrieval) {
//!         println!("slot {slot}: {key} ({} bytes, cached: {})", value.len(), retrieval.is_in_cache());
//!     }
//!
//!     fn on_get_failed(&self, _key: &CacheKey, slot: u32, reason: &FailedReason) {
//!         println!("slot {slot}: {reason}");
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> resource_cache::Result<()> {
//! let config = CacheConfig::new()
//!     .memory_capacity(128)
//!     .http_timeout_millis(10_000)
//!     .open_waiting_queue(true)
//!     .valid_time_millis(-1);
//! let (cache, queue) = ResourceCache::builder(RawBytes)
//!     .config(config)
//!     .listener(Printer)
//!     .build()?;
//! queue.spawn_thread("cache-callbacks")?;
//!
//! if !cache.get("https://example.com/a.png", 0) {
//!     // show a placeholder; Printer hears about the result later
//! }
//! cache.save_all("images")?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod compression;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hydration;
pub mod key;
pub mod managed_cache;
pub mod source_of_record;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compression::{size_step, CompressionTransform, Downscaler, FileSystem, LocalFileSystem, StrideDownscaler};
pub use config::{CacheConfig, RemovalStrategyKind};
pub use dispatch::{DispatchQueue, Dispatcher};
pub use error::{CacheError, FailedReason, Result};
pub use hydration::coordinator::RequestId;
pub use hydration::Retrieval;
pub use key::CacheKey;
pub use managed_cache::{CacheListener, Lookup, NoopListener, ResourceCache, ResourceCacheBuilder};
pub use source_of_record::{Decoder, HttpSourceOfRecord, RawBytes, SourceOfRecord};
pub use store::discrete_files::IndexFormat;
pub use store::persistence::{DirectoryMedium, MemoryMedium, PersistenceMedium};
pub use store::replacement::RemovalStrategy;
pub use store::CacheStoreStrategy;
