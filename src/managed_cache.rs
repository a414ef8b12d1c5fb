use crate::clock::{Clock, SystemClock};
use crate::compression::{CompressionTransform, Downscaler, FileSystem, LocalFileSystem, StrideDownscaler};
use crate::config::CacheConfig;
use crate::dispatch::{self, DispatchQueue, Dispatcher};
use crate::error::{CacheError, FailedReason, Result};
use crate::hydration::coordinator::{Admission, FetchCoordinator, RequestId};
use crate::hydration::pull::{self, PullHydrator, Tiers};
use crate::hydration::Retrieval;
use crate::key::CacheKey;
use crate::source_of_record::{Decoder, HttpSourceOfRecord, SourceOfRecord};
use crate::store::discrete_files::{DiscreteFileStore, IndexFormat};
use crate::store::memory::MemoryStore;
use crate::store::persistence::{DirectoryMedium, PersistenceMedium};
use crate::store::replacement::RemovalStrategy;
use crate::store::CacheStoreStrategy;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Receives the outcome of every request, always on the dispatch context.
///
/// `C` is whatever the caller wants handed back with the result, typically the thing that
/// displays the resource.
pub trait CacheListener<V, C>: Send + Sync {
    /// Runs before the terminal callback of the same request.
    fn on_pre_get(&self, _key: &CacheKey, _consumer: &C) {}

    fn on_get_success(&self, key: &CacheKey, value: &V, consumer: C, retrieval: Retrieval);

    fn on_get_failed(&self, key: &CacheKey, consumer: C, reason: &FailedReason);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl<V, C> CacheListener<V, C> for NoopListener {
    fn on_get_success(&self, _key: &CacheKey, _value: &V, _consumer: C, _retrieval: Retrieval) {}

    fn on_get_failed(&self, _key: &CacheKey, _consumer: C, _reason: &FailedReason) {}
}

/// Synchronous half of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The value is in memory and can be used right away.
    Resident,
    /// The value will arrive through the listener. The id can be passed to
    /// [`ResourceCache::cancel`].
    Pending(RequestId),
}

impl Lookup {
    pub fn is_resident(self) -> bool {
        matches!(self, Lookup::Resident)
    }
}

/// Two-tier cache of decoded resources, populated in the background.
///
/// [`get`](ResourceCache::get) answers immediately with whether the value is resident and
/// reports the outcome through the [`CacheListener`] later: from memory, from disk, or from the
/// source of record, in that order of preference. Concurrent requests for the same key share one
/// fetch. Cloning is cheap and every clone drives the same cache.
pub struct ResourceCache<V, C = ()> {
    inner: Arc<Inner<V, C>>,
}

impl<V, C> Clone for ResourceCache<V, C> {
    fn clone(&self) -> Self {
        ResourceCache {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<V, C> {
    config: CacheConfig,
    tiers: Arc<Tiers<V>>,
    hydrator: PullHydrator<V>,
    coordinator: FetchCoordinator<C>,
    dispatcher: Dispatcher,
    listener: Arc<dyn CacheListener<V, C>>,
    runtime: Handle,
}

impl<V, C> ResourceCache<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clone + Send + 'static,
{
    pub fn builder(decoder: impl Decoder<V> + 'static) -> ResourceCacheBuilder<V, C> {
        ResourceCacheBuilder::new(decoder)
    }

    /// Returns true if `key` is resident in memory. Either way the outcome is also delivered to
    /// the listener.
    pub fn get(&self, key: impl Into<CacheKey>, consumer: C) -> bool {
        self.request(key, consumer).is_resident()
    }

    /// Like [`get`](Self::get), but hands back the request id of a pending lookup.
    pub fn request(&self, key: impl Into<CacheKey>, consumer: C) -> Lookup {
        let key = key.into();
        let inner = &self.inner;
        inner.notify_pre_get(&key, consumer.clone());

        if let Some(value) = inner.resident_value(&key) {
            tracing::trace!(key = %key, "memory hit");
            inner.notify_success(key, value, consumer, Retrieval::Memory);
            return Lookup::Resident;
        }

        let (id, admission) = inner.coordinator.request(&key, consumer);
        tracing::trace!(key = %key, ?admission, "memory miss");
        if admission == Admission::Started {
            inner.spawn_fetch(key);
        }
        Lookup::Pending(id)
    }

    /// Withdraws a pending request. Its listener callbacks will not fire; a fetch that is
    /// already running still completes and populates the tiers.
    pub fn cancel(&self, key: &CacheKey, id: RequestId) -> bool {
        self.inner.coordinator.cancel(key, id)
    }

    /// The resident value for `key`, counted as a use.
    pub fn get_resident(&self, key: &CacheKey) -> Option<V> {
        self.inner.resident_value(key)
    }

    /// True if `key` is resident in memory. Not counted as a use.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.tiers.memory.lock().peek(key).is_some()
    }

    /// Removes `key` from both tiers. Returns true if either tier held it.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let in_memory = self.inner.tiers.memory.lock().delete(key);
        let on_disk = self.inner.tiers.disk.lock().delete(key);
        tracing::debug!(key = %key, in_memory, on_disk, "invalidated");
        in_memory || on_disk
    }

    /// Empties both tiers. Fetches already running still complete.
    pub fn clear(&self) -> Result<()> {
        self.inner.tiers.memory.lock().flush()?;
        self.inner.tiers.disk.lock().flush()
    }

    /// Drops expired memory entries now instead of on their next read.
    pub fn purge_expired(&self) -> usize {
        self.inner.tiers.memory.lock().purge_expired()
    }

    /// Saves the disk index under `tag`.
    pub fn save_all(&self, tag: &str) -> Result<()> {
        self.inner.tiers.disk.lock().save_all(tag)
    }

    /// Restores a disk index saved under `tag` and returns the number of entries restored.
    pub fn load_all(&self, tag: &str) -> Result<usize> {
        self.inner.tiers.disk.lock().load_all(tag)
    }

    pub fn memory_len(&self) -> usize {
        self.inner.tiers.memory.lock().len()
    }

    /// Bytes currently held on disk.
    pub fn disk_usage(&self) -> u64 {
        self.inner.tiers.disk.lock().total_bytes()
    }

    pub fn disk_contains(&self, key: &CacheKey) -> bool {
        self.inner.tiers.disk.lock().contains(key)
    }

    pub fn disk_entry_size(&self, key: &CacheKey) -> Option<u64> {
        self.inner.tiers.disk.lock().entry_size(key)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.coordinator.in_flight()
    }

    /// Fetches held back by the waiting queue.
    pub fn waiting(&self) -> usize {
        self.inner.coordinator.waiting()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

impl<V, C> Inner<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clone + Send + 'static,
{
    fn resident_value(&self, key: &CacheKey) -> Option<V> {
        self.tiers
            .memory
            .lock()
            .get(key)
            .map(|entry| entry.value().clone())
    }

    fn spawn_fetch(self: &Arc<Self>, key: CacheKey) {
        let inner = self.clone();
        self.runtime.spawn(inner.fetch(key));
    }

    async fn fetch(self: Arc<Self>, key: CacheKey) {
        // Another fetch may have finished between the caller's miss and this task starting.
        let outcome = match self.resident_value(&key) {
            Some(value) => Ok((value, Retrieval::Memory)),
            None => self.hydrator.hydrate(&key).await,
        };

        let completion = self.coordinator.complete(&key);
        if let Some(task) = completion.task {
            let requesters = task.into_requesters();
            match outcome {
                Ok((value, retrieval)) => {
                    for (_, consumer) in requesters {
                        self.notify_success(key.clone(), value.clone(), consumer, retrieval);
                    }
                }
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, requesters = requesters.len(), "fetch failed");
                    let reason = FailedReason::new(key.clone(), error);
                    for (_, consumer) in requesters {
                        self.notify_failed(reason.clone(), consumer);
                    }
                }
            }
        }

        for promoted in completion.promoted {
            self.spawn_fetch(promoted);
        }
    }

    fn notify_pre_get(&self, key: &CacheKey, consumer: C) {
        let listener = self.listener.clone();
        let key = key.clone();
        self.dispatcher
            .post(move || listener.on_pre_get(&key, &consumer));
    }

    fn notify_success(&self, key: CacheKey, value: V, consumer: C, retrieval: Retrieval) {
        let listener = self.listener.clone();
        self.dispatcher
            .post(move || listener.on_get_success(&key, &value, consumer, retrieval));
    }

    fn notify_failed(&self, reason: FailedReason, consumer: C) {
        let listener = self.listener.clone();
        self.dispatcher
            .post(move || listener.on_get_failed(reason.key(), consumer, &reason));
    }
}

/// Assembles a [`ResourceCache`]. Everything except the decoder has a default.
pub struct ResourceCacheBuilder<V, C> {
    config: CacheConfig,
    decoder: Arc<dyn Decoder<V>>,
    listener: Arc<dyn CacheListener<V, C>>,
    source: Option<Arc<dyn SourceOfRecord>>,
    removal_strategy: Option<RemovalStrategy>,
    disk_removal_strategy: Option<RemovalStrategy>,
    compression: Option<CompressionTransform>,
    downscaler: Arc<dyn Downscaler>,
    file_system: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    medium: Option<Arc<dyn PersistenceMedium>>,
    index_format: IndexFormat,
    runtime: Option<Handle>,
}

impl<V, C> ResourceCacheBuilder<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clone + Send + 'static,
{
    pub fn new(decoder: impl Decoder<V> + 'static) -> Self {
        ResourceCacheBuilder {
            config: CacheConfig::default(),
            decoder: Arc::new(decoder),
            listener: Arc::new(NoopListener),
            source: None,
            removal_strategy: None,
            disk_removal_strategy: None,
            compression: None,
            downscaler: Arc::new(StrideDownscaler),
            file_system: Arc::new(LocalFileSystem),
            clock: Arc::new(SystemClock),
            medium: None,
            index_format: IndexFormat::default(),
            runtime: None,
        }
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn decoder(mut self, decoder: impl Decoder<V> + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    pub fn listener(mut self, listener: impl CacheListener<V, C> + 'static) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Defaults to [`HttpSourceOfRecord`], which treats keys as URLs.
    pub fn source(mut self, source: impl SourceOfRecord + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Overrides `config.removal_strategy` for both tiers, e.g. with a custom selector.
    pub fn removal_strategy(mut self, strategy: RemovalStrategy) -> Self {
        self.removal_strategy = Some(strategy);
        self
    }

    /// Uses a different strategy for the disk tier than for memory.
    pub fn disk_removal_strategy(mut self, strategy: RemovalStrategy) -> Self {
        self.disk_removal_strategy = Some(strategy);
        self
    }

    pub fn compression(mut self, transform: CompressionTransform) -> Self {
        self.compression = Some(transform);
        self
    }

    pub fn downscaler(mut self, downscaler: impl Downscaler + 'static) -> Self {
        self.downscaler = Arc::new(downscaler);
        self
    }

    pub fn file_system(mut self, file_system: impl FileSystem + 'static) -> Self {
        self.file_system = Arc::new(file_system);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Where `save_all`/`load_all` keep the disk index. Defaults to files in the disk directory.
    pub fn medium(mut self, medium: Arc<dyn PersistenceMedium>) -> Self {
        self.medium = Some(medium);
        self
    }

    pub fn index_format(mut self, format: IndexFormat) -> Self {
        self.index_format = format;
        self
    }

    /// Runtime that runs fetches. Defaults to the runtime `build` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the cache together with the queue its callbacks are delivered through. Whoever
    /// drains the queue is the dispatch context.
    pub fn build(self) -> Result<(ResourceCache<V, C>, DispatchQueue)> {
        let (dispatcher, queue) = dispatch::channel();
        let cache = self.build_with_dispatcher(dispatcher)?;
        Ok((cache, queue))
    }

    /// Builds the cache on an existing dispatch queue, so several caches can share one context.
    pub fn build_with_dispatcher(self, dispatcher: Dispatcher) -> Result<ResourceCache<V, C>> {
        let ResourceCacheBuilder {
            config,
            decoder,
            listener,
            source,
            removal_strategy,
            disk_removal_strategy,
            compression,
            downscaler,
            file_system,
            clock,
            medium,
            index_format,
            runtime,
        } = self;

        config.validate()?;
        let runtime = match runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|err| {
                CacheError::Configuration(format!("no tokio runtime to run fetches on: {err}"))
            })?,
        };

        let valid_time = config.valid_time();
        let directory = config.resolved_disk_directory();
        let memory_strategy = removal_strategy.unwrap_or_else(|| config.removal_strategy.into());
        let disk_strategy = disk_removal_strategy.unwrap_or_else(|| memory_strategy.clone());
        let medium = medium.unwrap_or_else(|| Arc::new(DirectoryMedium::new(directory.clone())));

        let disk = DiscreteFileStore::open(
            directory.clone(),
            config.disk_capacity_bytes,
            disk_strategy,
            clock.clone(),
            medium,
        )?
        .with_valid_time(valid_time)
        .with_index_format(index_format);
        let staging_directory = pull::open_staging_directory(&directory)?;
        let memory = MemoryStore::new(config.memory_capacity_count, memory_strategy, clock.clone())
            .with_valid_time(valid_time);

        let tiers = Arc::new(Tiers {
            memory: Mutex::new(memory),
            disk: Mutex::new(disk),
        });
        let hydrator = PullHydrator {
            tiers: tiers.clone(),
            source: source.unwrap_or_else(|| Arc::new(HttpSourceOfRecord::new())),
            decoder,
            compression,
            downscaler,
            file_system,
            staging_directory,
            clock,
            timeout: config.http_timeout(),
            write_through_on_evict: config.write_through_on_evict,
        };

        tracing::debug!(
            directory = %directory.display(),
            memory_capacity = config.memory_capacity_count,
            disk_capacity = config.disk_capacity_bytes,
            concurrency_limit = ?config.concurrency_limit(),
            "resource cache ready"
        );

        Ok(ResourceCache {
            inner: Arc::new(Inner {
                coordinator: FetchCoordinator::new(config.concurrency_limit()),
                config,
                tiers,
                hydrator,
                dispatcher,
                listener,
                runtime,
            }),
        })
    }
}
