use crate::clock::Clock;
use crate::error::Result;
use crate::key::CacheKey;
use crate::store::persistence::PersistenceMedium;
use crate::store::replacement::RemovalStrategy;
use crate::store::{CacheStoreStrategy, Candidate, EntryMetadata};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const PAYLOAD_EXTENSION: &str = "bin";
const TEMP_EXTENSION: &str = "part";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    file: String,
    metadata: EntryMetadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    next_seq: u64,
    records: HashMap<CacheKey, Record>,
}

/// Encoding used when the index is saved to a [`PersistenceMedium`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexFormat {
    #[default]
    Json,
    Bincode,
}

impl IndexFormat {
    fn serialize<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        Ok(match self {
            IndexFormat::Json => serde_json::to_vec(value)?,
            IndexFormat::Bincode => bincode::serialize(value)?,
        })
    }

    fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        Ok(match self {
            IndexFormat::Json => serde_json::from_slice(bytes)?,
            IndexFormat::Bincode => bincode::deserialize(bytes)?,
        })
    }
}

/// The persistent tier: one payload file per key inside `cache_directory`, bounded by the total
/// number of payload bytes.
///
/// The key-to-file index lives in memory. It only survives a restart if it is saved with
/// [`save_all`](DiscreteFileStore::save_all) and read back with
/// [`load_all`](DiscreteFileStore::load_all) under the same tag; payload files left behind
/// without an index entry are removed by `load_all`.
pub struct DiscreteFileStore {
    cache_directory: PathBuf,
    index: HashMap<CacheKey, Record>,
    total_bytes: u64,
    max_bytes: u64,
    strategy: RemovalStrategy,
    clock: Arc<dyn Clock>,
    valid_time: Option<u64>,
    next_seq: u64,
    medium: Arc<dyn PersistenceMedium>,
    format: IndexFormat,
}

impl DiscreteFileStore {
    pub fn open(
        cache_directory: PathBuf,
        max_bytes: u64,
        strategy: RemovalStrategy,
        clock: Arc<dyn Clock>,
        medium: Arc<dyn PersistenceMedium>,
    ) -> Result<Self> {
        fs::create_dir_all(&cache_directory)?;

        Ok(DiscreteFileStore {
            cache_directory,
            index: HashMap::new(),
            total_bytes: 0,
            max_bytes,
            strategy,
            clock,
            valid_time: None,
            next_seq: 0,
            medium,
            format: IndexFormat::default(),
        })
    }

    pub fn with_valid_time(mut self, valid_time: Option<u64>) -> Self {
        self.valid_time = valid_time;
        self
    }

    pub fn with_index_format(mut self, format: IndexFormat) -> Self {
        self.format = format;
        self
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn payload_path(&self, record: &Record) -> PathBuf {
        self.cache_directory.join(&record.file)
    }

    /// Reads the payload for `key`, recording the use.
    ///
    /// Expired entries are deleted and reported absent, as are entries whose payload file has
    /// disappeared. Any other read failure drops the entry and is returned, so the next attempt
    /// starts from the source of record.
    pub fn load(&mut self, key: &CacheKey) -> Result<Option<(Bytes, EntryMetadata)>> {
        let now = self.clock.now_millis();
        let Some(record) = self.index.get(key) else {
            return Ok(None);
        };

        if record.metadata.is_expired(now, self.valid_time) {
            tracing::debug!(key = %key, "disk entry expired");
            self.discard(key);
            return Ok(None);
        }

        let path = self.payload_path(record);
        match fs::read(&path) {
            Ok(data) => {
                let seq = self.next_seq();
                let Some(record) = self.index.get_mut(key) else {
                    return Ok(None);
                };
                record.metadata.touch(now, seq);
                Ok(Some((Bytes::from(data), record.metadata.clone())))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(key = %key, path = %path.display(), "disk payload vanished");
                self.discard(key);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to read disk payload");
                self.discard(key);
                Err(e.into())
            }
        }
    }

    /// Saves `data` for `key`, created now. See [`save_entry`](Self::save_entry).
    pub fn save(&mut self, key: &CacheKey, data: &[u8]) -> Result<bool> {
        let now = self.clock.now_millis();
        self.save_entry(key, data, now)
    }

    /// Saves `data` for `key` with an explicit creation time.
    ///
    /// Room is made before the file is written, so the byte total never exceeds the capacity.
    /// Returns `Ok(false)` without storing anything when `data` alone is larger than the whole
    /// capacity.
    pub fn save_entry(&mut self, key: &CacheKey, data: &[u8], created_at: u64) -> Result<bool> {
        self.discard(key);

        let size = data.len() as u64;
        if size > self.max_bytes {
            tracing::debug!(key = %key, bytes = size, "payload exceeds disk capacity, not stored");
            return Ok(false);
        }
        self.make_room(size);

        let file = format!(
            "{}.{PAYLOAD_EXTENSION}",
            Uuid::new_v4().hyphenated()
        );
        let path = self.cache_directory.join(&file);
        write_atomically(&path, data)?;

        let now = self.clock.now_millis();
        let seq = self.next_seq();
        self.index.insert(
            key.clone(),
            Record {
                file,
                metadata: EntryMetadata::new(size, created_at, now, seq),
            },
        );
        self.total_bytes += size;
        tracing::trace!(key = %key, bytes = size, total = self.total_bytes, "saved to disk");
        Ok(true)
    }

    fn make_room(&mut self, incoming: u64) {
        while self.total_bytes + incoming > self.max_bytes {
            let candidates: Vec<Candidate<'_>> = self
                .index
                .iter()
                .map(|(key, record)| Candidate {
                    key,
                    metadata: &record.metadata,
                })
                .collect();
            let Some(victim) = self.strategy.choose_victim(&candidates) else {
                break;
            };
            tracing::trace!(key = %victim, "evicted from disk");
            if !self.discard(&victim) {
                break;
            }
        }
    }

    /// Drops the index entry and its payload file. File removal is best effort.
    fn discard(&mut self, key: &CacheKey) -> bool {
        let Some(record) = self.index.remove(key) else {
            return false;
        };
        self.total_bytes = self.total_bytes.saturating_sub(record.metadata.size);
        let path = self.payload_path(&record);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove disk payload");
            }
        }
        true
    }

    /// Saves the index under `tag` so a later process can [`load_all`](Self::load_all) it.
    pub fn save_all(&self, tag: &str) -> Result<()> {
        let snapshot = IndexRef {
            next_seq: self.next_seq,
            records: &self.index,
        };
        let bytes = self.format.serialize(&snapshot)?;
        self.medium.write(tag, &bytes)?;
        tracing::debug!(tag, entries = self.index.len(), "saved disk index");
        Ok(())
    }

    /// Restores the index saved under `tag` and returns how many entries were restored.
    ///
    /// Entries already known to this store win over restored ones. Restored entries whose
    /// payload is missing or expired are dropped, unreferenced payload files are deleted, and
    /// capacity is enforced again afterwards. A tag that was never saved restores nothing.
    pub fn load_all(&mut self, tag: &str) -> Result<usize> {
        let Some(bytes) = self.medium.read(tag)? else {
            return Ok(0);
        };
        let saved: Index = self.format.deserialize(&bytes)?;
        let now = self.clock.now_millis();

        let mut restored = 0;
        for (key, mut record) in saved.records {
            if self.index.contains_key(&key) {
                continue;
            }
            if !is_payload_file(&record.file) {
                tracing::warn!(key = %key, file = %record.file, "ignoring index entry with a foreign file name");
                continue;
            }
            let path = self.payload_path(&record);
            if record.metadata.is_expired(now, self.valid_time) {
                let _ = fs::remove_file(&path);
                continue;
            }
            let Ok(file_metadata) = fs::metadata(&path) else {
                continue;
            };
            record.metadata.size = file_metadata.len();
            self.total_bytes += record.metadata.size;
            self.index.insert(key, record);
            restored += 1;
        }
        self.next_seq = self.next_seq.max(saved.next_seq);

        self.prune_orphans()?;
        self.make_room(0);
        tracing::debug!(tag, restored, total = self.total_bytes, "loaded disk index");
        Ok(restored)
    }

    /// Deletes payload and temporary files that no index entry refers to.
    fn prune_orphans(&self) -> Result<usize> {
        let referenced: HashSet<&str> = self.index.values().map(|r| r.file.as_str()).collect();
        let mut removed = 0;
        for dir_entry in fs::read_dir(&self.cache_directory)?.flatten() {
            let path = dir_entry.path();
            let is_ours = path
                .extension()
                .is_some_and(|ext| ext == PAYLOAD_EXTENSION || ext == TEMP_EXTENSION);
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_ours && !referenced.contains(name) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "pruned orphaned disk payloads");
        }
        Ok(removed)
    }

    /// Stored payload size for `key`, if present.
    pub fn entry_size(&self, key: &CacheKey) -> Option<u64> {
        self.index.get(key).map(|record| record.metadata.size)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn directory(&self) -> &Path {
        &self.cache_directory
    }
}

impl CacheStoreStrategy for DiscreteFileStore {
    fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now_millis();
        self.index
            .get(key)
            .is_some_and(|record| !record.metadata.is_expired(now, self.valid_time))
    }

    fn delete(&mut self, key: &CacheKey) -> bool {
        self.discard(key)
    }

    /// Removes every payload and clears the index.
    fn flush(&mut self) -> Result<()> {
        let keys: Vec<CacheKey> = self.index.keys().cloned().collect();
        for key in keys {
            self.discard(&key);
        }
        self.prune_orphans()?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Payload files are always named `<uuid>.bin` and live directly in the cache directory.
fn is_payload_file(name: &str) -> bool {
    name.strip_suffix(PAYLOAD_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .is_some_and(|stem| Uuid::parse_str(stem).is_ok())
}

/// Borrowed form of [`Index`] so saving does not clone every record.
#[derive(Serialize)]
struct IndexRef<'a> {
    next_seq: u64,
    records: &'a HashMap<CacheKey, Record>,
}

fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let temp = path.with_extension(TEMP_EXTENSION);
    fs::write(&temp, data)?;
    fs::rename(&temp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CacheError;
    use crate::store::persistence::MemoryMedium;

    struct Fixture {
        dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        medium: Arc<MemoryMedium>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                dir: tempfile::tempdir().unwrap(),
                clock: Arc::new(ManualClock::new(10_000)),
                medium: Arc::new(MemoryMedium::new()),
            }
        }

        fn store(&self, max_bytes: u64) -> DiscreteFileStore {
            DiscreteFileStore::open(
                self.dir.path().join("disk"),
                max_bytes,
                RemovalStrategy::LeastRecentlyUsed,
                self.clock.clone(),
                self.medium.clone(),
            )
            .unwrap()
        }
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::from(k)
    }

    fn payload_files(store: &DiscreteFileStore) -> usize {
        fs::read_dir(store.directory())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == PAYLOAD_EXTENSION))
            .count()
    }

    #[test]
    fn save_then_load() {
        let fixture = Fixture::new();
        let mut store = fixture.store(1024);

        assert!(store.save(&key("a"), b"hello").unwrap());
        let (data, metadata) = store.load(&key("a")).unwrap().unwrap();
        assert_eq!(data.as_ref(), b"hello");
        assert_eq!(metadata.size, 5);
        assert_eq!(metadata.use_count, 1);
        assert_eq!(store.total_bytes(), 5);
        assert!(store.load(&key("b")).unwrap().is_none());
    }

    #[test]
    fn overwrite_replaces_payload_and_size() {
        let fixture = Fixture::new();
        let mut store = fixture.store(1024);
        store.save(&key("a"), b"hello").unwrap();
        store.save(&key("a"), b"hi").unwrap();

        assert_eq!(store.total_bytes(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(payload_files(&store), 1);
        assert_eq!(store.load(&key("a")).unwrap().unwrap().0.as_ref(), b"hi");
    }

    #[test]
    fn byte_capacity_evicts_least_recently_used() {
        let fixture = Fixture::new();
        let mut store = fixture.store(10);
        store.save(&key("a"), &[0; 4]).unwrap();
        store.save(&key("b"), &[0; 4]).unwrap();
        store.load(&key("a")).unwrap();

        store.save(&key("c"), &[0; 4]).unwrap();
        assert!(store.contains(&key("a")));
        assert!(!store.contains(&key("b")));
        assert!(store.contains(&key("c")));
        assert_eq!(store.total_bytes(), 8);
        assert_eq!(payload_files(&store), 2);
    }

    #[test]
    fn oversized_payload_is_not_stored() {
        let fixture = Fixture::new();
        let mut store = fixture.store(10);
        store.save(&key("a"), &[0; 4]).unwrap();

        assert!(!store.save(&key("big"), &[0; 11]).unwrap());
        assert!(!store.contains(&key("big")));
        assert!(store.contains(&key("a")));
        assert_eq!(store.total_bytes(), 4);
    }

    #[test]
    fn expired_entries_are_removed_on_load() {
        let fixture = Fixture::new();
        let mut store = fixture.store(1024).with_valid_time(Some(1_000));
        store.save(&key("a"), b"x").unwrap();

        fixture.clock.advance(999);
        assert!(store.load(&key("a")).unwrap().is_some());
        fixture.clock.advance(2);
        assert!(store.load(&key("a")).unwrap().is_none());
        assert_eq!(store.total_bytes(), 0);
        assert_eq!(payload_files(&store), 0);
    }

    #[test]
    fn vanished_payload_reads_as_absent() {
        let fixture = Fixture::new();
        let mut store = fixture.store(1024);
        store.save(&key("a"), b"x").unwrap();
        for entry in fs::read_dir(store.directory()).unwrap().flatten() {
            fs::remove_file(entry.path()).unwrap();
        }

        assert!(store.load(&key("a")).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn index_survives_restart_in_both_formats() {
        for format in [IndexFormat::Json, IndexFormat::Bincode] {
            let fixture = Fixture::new();
            {
                let mut store = fixture.store(1024).with_index_format(format);
                store.save(&key("a"), b"alpha").unwrap();
                store.save(&key("b"), b"beta").unwrap();
                store.save_all("image_cache").unwrap();
            }

            let mut store = fixture.store(1024).with_index_format(format);
            assert!(store.is_empty());
            assert_eq!(store.load_all("image_cache").unwrap(), 2);
            assert_eq!(store.total_bytes(), 9);
            assert_eq!(store.load(&key("b")).unwrap().unwrap().0.as_ref(), b"beta");
        }
    }

    #[test]
    fn load_all_prunes_orphans_and_missing_payloads() {
        let fixture = Fixture::new();
        {
            let mut store = fixture.store(1024);
            store.save(&key("a"), b"alpha").unwrap();
            store.save_all("t").unwrap();
            store.save(&key("unsaved"), b"orphan").unwrap();
            fs::write(store.directory().join("interrupted.part"), b"leftover").unwrap();
        }

        let mut store = fixture.store(1024);
        assert_eq!(store.load_all("t").unwrap(), 1);
        assert_eq!(payload_files(&store), 1);
        assert_eq!(fs::read_dir(store.directory()).unwrap().count(), 1);
    }

    #[test]
    fn load_all_ignores_entries_pointing_outside_the_directory() {
        let fixture = Fixture::new();
        let outside = fixture.dir.path().join("outside.bin");
        fs::write(&outside, b"keep me").unwrap();
        {
            let mut store = fixture.store(1024);
            store.save(&key("a"), b"alpha").unwrap();
            store.save_all("t").unwrap();
        }
        let saved = fixture.medium.read("t").unwrap().unwrap();
        let mut index: serde_json::Value = serde_json::from_slice(&saved).unwrap();
        index["records"]["a"]["file"] = "../outside.bin".into();
        fixture
            .medium
            .write("t", &serde_json::to_vec(&index).unwrap())
            .unwrap();

        let mut store = fixture.store(1024);
        assert_eq!(store.load_all("t").unwrap(), 0);
        assert!(!store.contains(&key("a")));
        store.flush().unwrap();
        assert_eq!(fs::read(&outside).unwrap(), b"keep me");
    }

    #[test]
    fn only_uuid_payload_names_are_accepted() {
        assert!(is_payload_file(&format!("{}.bin", Uuid::new_v4().hyphenated())));
        assert!(!is_payload_file("../outside.bin"));
        assert!(!is_payload_file("/etc/passwd"));
        assert!(!is_payload_file(&format!("{}.part", Uuid::new_v4().hyphenated())));
    }

    #[test]
    fn delete_removes_the_payload_file() {
        let fixture = Fixture::new();
        let mut store = fixture.store(1024);
        store.save(&key("a"), b"alpha").unwrap();

        assert!(store.delete(&key("a")));
        assert!(!store.delete(&key("a")));
        assert_eq!(payload_files(&store), 0);
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn load_all_enforces_smaller_capacity() {
        let fixture = Fixture::new();
        {
            let mut store = fixture.store(1024);
            store.save(&key("a"), &[0; 6]).unwrap();
            store.save(&key("b"), &[0; 6]).unwrap();
            store.save_all("t").unwrap();
        }

        let mut store = fixture.store(8);
        store.load_all("t").unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.total_bytes() <= 8);
    }

    #[test]
    fn missing_tag_restores_nothing_and_corrupt_index_errors() {
        let fixture = Fixture::new();
        let mut store = fixture.store(1024);
        assert_eq!(store.load_all("never-saved").unwrap(), 0);

        fixture.medium.write("broken", b"{not an index").unwrap();
        assert!(matches!(
            store.load_all("broken"),
            Err(CacheError::CorruptIndex(_))
        ));
    }

    #[test]
    fn flush_removes_everything() {
        let fixture = Fixture::new();
        let mut store = fixture.store(1024);
        store.save(&key("a"), b"alpha").unwrap();
        store.save(&key("b"), b"beta").unwrap();
        store.flush().unwrap();

        assert!(store.is_empty());
        assert_eq!(store.total_bytes(), 0);
        assert_eq!(payload_files(&store), 0);
    }
}
