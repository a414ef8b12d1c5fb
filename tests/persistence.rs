mod common;

use common::{Event, Harness, ScriptedSource};
use resource_cache::{CacheConfig, CacheError, CacheKey, IndexFormat, Retrieval};
use std::fs;

fn key(k: &str) -> CacheKey {
    CacheKey::from(k)
}

#[tokio::test(flavor = "multi_thread")]
async fn disk_index_survives_a_restart() {
    let mut first = Harness::new(CacheConfig::new(), ScriptedSource::new());
    first.cache.get("a", 1);
    first.cache.get("b", 2);
    first.drain_terminal(2).await;
    first.cache.save_all("images").unwrap();
    let Harness { dir, .. } = first;

    let mut second = Harness::in_dir(dir, CacheConfig::new(), ScriptedSource::new(), |b| b);
    assert!(!second.cache.disk_contains(&key("a")));
    assert_eq!(second.cache.load_all("images").unwrap(), 2);
    assert!(second.cache.disk_contains(&key("a")));
    assert_eq!(second.cache.disk_usage(), 2);

    assert!(!second.cache.get("a", 3));
    second.drain_terminal(1).await;
    assert!(matches!(
        &second.recorder.terminal()[0],
        Event::Success {
            retrieval: Retrieval::Disk,
            ..
        }
    ));
    assert_eq!(second.source.calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn bincode_index_round_trips_through_the_facade() {
    let mut first = Harness::with(CacheConfig::new(), ScriptedSource::new(), |b| {
        b.index_format(IndexFormat::Bincode)
    });
    first.cache.get("a", 1);
    first.drain_terminal(1).await;
    first.cache.save_all("bin").unwrap();
    let Harness { dir, .. } = first;

    let second = Harness::in_dir(dir, CacheConfig::new(), ScriptedSource::new(), |b| {
        b.index_format(IndexFormat::Bincode)
    });
    assert_eq!(second.cache.load_all("bin").unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_tag_restores_nothing() {
    let h = Harness::new(CacheConfig::new(), ScriptedSource::new());
    assert_eq!(h.cache.load_all("never-saved").unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupt_index_is_reported() {
    let h = Harness::new(CacheConfig::new(), ScriptedSource::new());
    fs::write(h.dir.path().join("broken.index"), b"{ not json").unwrap();
    assert!(matches!(
        h.cache.load_all("broken"),
        Err(CacheError::CorruptIndex(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_tag_is_a_disk_error() {
    let h = Harness::new(CacheConfig::new(), ScriptedSource::new());
    assert!(matches!(
        h.cache.save_all("../escape"),
        Err(CacheError::DiskIo(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn disk_capacity_is_never_exceeded() {
    let source = ScriptedSource::new();
    for k in ["a", "b", "c", "d"] {
        source.respond(k, vec![0u8; 400]);
    }
    let mut h = Harness::new(CacheConfig::new().disk_capacity(1_000), source);

    for (i, k) in ["a", "b", "c", "d"].into_iter().enumerate() {
        h.cache.get(k, i as u32);
        h.drain_terminal(i + 1).await;
        assert!(h.cache.disk_usage() <= 1_000);
    }
    assert!(!h.cache.disk_contains(&key("a")));
    assert!(!h.cache.disk_contains(&key("b")));
    assert!(h.cache.disk_contains(&key("c")));
    assert!(h.cache.disk_contains(&key("d")));
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_payload_is_served_but_not_stored() {
    let source = ScriptedSource::new();
    source.respond("huge", vec![1u8; 2_000]);
    let mut h = Harness::new(CacheConfig::new().disk_capacity(1_000), source);

    h.cache.get("huge", 1);
    h.drain_terminal(1).await;
    assert!(matches!(&h.recorder.terminal()[0], Event::Success { .. }));
    assert!(h.cache.contains(&key("huge")));
    assert!(!h.cache.disk_contains(&key("huge")));
    assert_eq!(h.cache.disk_usage(), 0);
}

async fn evict_from_disk_then_memory(write_through: bool) -> Harness {
    let source = ScriptedSource::new();
    source.respond("a", "aaaaaa");
    source.respond("b", "bbbbbb");
    let config = CacheConfig::new()
        .memory_capacity(1)
        .disk_capacity(10)
        .write_through_on_evict(write_through);
    let mut h = Harness::new(config, source);

    // Saving b pushes a off disk, then admitting b pushes a out of memory.
    h.cache.get("a", 1);
    h.drain_terminal(1).await;
    h.cache.get("b", 2);
    h.drain_terminal(2).await;
    h
}

#[tokio::test(flavor = "multi_thread")]
async fn evicted_entry_is_written_through_to_disk() {
    let h = evict_from_disk_then_memory(true).await;
    assert!(!h.cache.contains(&key("a")));
    assert!(h.cache.disk_contains(&key("a")));
    assert!(h.cache.disk_usage() <= 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn evicted_entry_is_dropped_without_write_through() {
    let h = evict_from_disk_then_memory(false).await;
    assert!(!h.cache.contains(&key("a")));
    assert!(!h.cache.disk_contains(&key("a")));
    assert!(h.cache.disk_contains(&key("b")));
}
