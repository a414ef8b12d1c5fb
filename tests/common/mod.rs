#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use resource_cache::{
    CacheConfig, CacheError, CacheKey, CacheListener, DispatchQueue, FailedReason, RawBytes,
    ResourceCache, ResourceCacheBuilder, Retrieval, SourceOfRecord,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const PATIENCE: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport that answers from a script. Unscripted keys answer with their own name.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    responses: Arc<Mutex<HashMap<String, Result<Bytes, CacheError>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    panics: Arc<Mutex<HashSet<String>>>,
    gate: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every retrieval waits for a permit from [`release`](Self::release).
    pub fn gated() -> Self {
        ScriptedSource {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn respond(&self, key: &str, body: impl Into<Bytes>) {
        self.responses.lock().insert(key.to_owned(), Ok(body.into()));
    }

    pub fn fail(&self, key: &str, error: CacheError) {
        self.responses.lock().insert(key.to_owned(), Err(error));
    }

    /// The next retrieval of `key` panics instead of answering.
    pub fn panic_once(&self, key: &str) {
        self.panics.lock().insert(key.to_owned());
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn call_order(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|k| *k == key).count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceOfRecord for ScriptedSource {
    async fn retrieve(&self, key: &CacheKey, _timeout: Duration) -> resource_cache::Result<Bytes> {
        self.calls.lock().push(key.to_string());
        let panics = self.panics.lock().remove(key.as_str());
        if panics {
            panic!("transport blew up on {key}");
        }
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.responses
            .lock()
            .get(key.as_str())
            .cloned()
            .unwrap_or_else(|| Ok(Bytes::from(key.to_string())))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PreGet {
        key: String,
        consumer: u32,
    },
    Success {
        key: String,
        consumer: u32,
        value: Bytes,
        retrieval: Retrieval,
    },
    Failed {
        key: String,
        consumer: u32,
        error: CacheError,
    },
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::PreGet { .. })
    }

    pub fn consumer(&self) -> u32 {
        match self {
            Event::PreGet { consumer, .. }
            | Event::Success { consumer, .. }
            | Event::Failed { consumer, .. } => *consumer,
        }
    }
}

/// Listener that records every callback along with the thread it ran on.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    threads: Arc<Mutex<Vec<std::thread::ThreadId>>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn terminal(&self) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.is_terminal())
            .cloned()
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.events.lock().iter().filter(|e| e.is_terminal()).count()
    }

    pub fn threads(&self) -> Vec<std::thread::ThreadId> {
        self.threads.lock().clone()
    }

    fn record(&self, event: Event) {
        self.threads.lock().push(std::thread::current().id());
        self.events.lock().push(event);
    }
}

impl CacheListener<Bytes, u32> for Recorder {
    fn on_pre_get(&self, key: &CacheKey, consumer: &u32) {
        self.record(Event::PreGet {
            key: key.to_string(),
            consumer: *consumer,
        });
    }

    fn on_get_success(&self, key: &CacheKey, value: &Bytes, consumer: u32, retrieval: Retrieval) {
        self.record(Event::Success {
            key: key.to_string(),
            consumer,
            value: value.clone(),
            retrieval,
        });
    }

    fn on_get_failed(&self, key: &CacheKey, consumer: u32, reason: &FailedReason) {
        self.record(Event::Failed {
            key: key.to_string(),
            consumer,
            error: reason.error().clone(),
        });
    }
}

pub struct Harness {
    pub cache: ResourceCache<Bytes, u32>,
    pub queue: DispatchQueue,
    pub source: ScriptedSource,
    pub recorder: Recorder,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(config: CacheConfig, source: ScriptedSource) -> Self {
        Self::with(config, source, |builder| builder)
    }

    /// Builds a cache on a fresh temp directory, letting the test adjust the builder first.
    pub fn with(
        config: CacheConfig,
        source: ScriptedSource,
        customize: impl FnOnce(ResourceCacheBuilder<Bytes, u32>) -> ResourceCacheBuilder<Bytes, u32>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir, config, source, customize)
    }

    pub fn in_dir(
        dir: TempDir,
        config: CacheConfig,
        source: ScriptedSource,
        customize: impl FnOnce(ResourceCacheBuilder<Bytes, u32>) -> ResourceCacheBuilder<Bytes, u32>,
    ) -> Self {
        init_tracing();
        let recorder = Recorder::default();
        let builder = ResourceCache::builder(RawBytes)
            .config(config.disk_directory(dir.path()))
            .source(source.clone())
            .listener(recorder.clone());
        let (cache, queue) = customize(builder).build().unwrap();
        Harness {
            cache,
            queue,
            source,
            recorder,
            dir,
        }
    }

    /// Runs callbacks until `count` terminal callbacks have been delivered in total.
    pub async fn drain_terminal(&mut self, count: usize) {
        let recorder = self.recorder.clone();
        let queue = &mut self.queue;
        tokio::time::timeout(PATIENCE, async {
            while recorder.terminal_count() < count {
                if !queue.run_next().await {
                    break;
                }
            }
        })
        .await
        .expect("callbacks were not delivered in time");
        self.queue.run_pending();
    }
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(PATIENCE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(PATIENCE, future)
        .await
        .expect("timed out")
}
