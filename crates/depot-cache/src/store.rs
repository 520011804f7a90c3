//! Content-addressed cache entry store
//!
//! One authoritative map from fingerprint to cached value, bounded by a
//! configured total payload size. Recency is tracked with a store-local
//! logical clock bumped on every get and put; eviction removes the
//! least-recently-accessed entries first, breaking stamp ties by insertion
//! sequence number so the order is fully deterministic. Entries pinned by
//! an in-flight fetch are never evicted.
//!
//! Payloads live in a sharded blob directory (`ab/cd/<hex>`); the index
//! (stamps, sizes, sequence counters) persists as JSON. After a restart
//! values reload lazily from the blob files on first access, so resident
//! memory stays bounded independent of the on-disk cache size.
//!
//! The store is synchronous and single-writer. The server wraps it in one
//! mutex; eviction scans and inserts are not atomic across entries, so all
//! mutation must stay serialized.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use depot_wire::{Archive, CacheKey, CachedItemValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, trace, warn};

struct StoreEntry {
    /// `None` when the payload has been freed or not yet reloaded from the
    /// blob file.
    value: Option<CachedItemValue>,
    size: u64,
    access_stamp: u64,
    insert_seq: u64,
    pins: u32,
}

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    key: CacheKey,
    size: u64,
    access_stamp: u64,
    insert_seq: u64,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    clock: u64,
    next_insert_seq: u64,
    entries: Vec<IndexEntry>,
}

/// Server-side fingerprint → value table with LRU eviction.
pub struct CacheStore {
    config: StoreConfig,
    entries: HashMap<CacheKey, StoreEntry>,
    total_size: u64,
    clock: u64,
    next_insert_seq: u64,
}

impl CacheStore {
    /// Open a store, loading the persisted index if one exists. Values are
    /// not read back into memory until first accessed.
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        if let Some(parent) = config.index_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut store = Self {
            config,
            entries: HashMap::new(),
            total_size: 0,
            clock: 0,
            next_insert_seq: 0,
        };

        if store.config.index_path.exists() {
            let index: IndexFile =
                serde_json::from_str(&fs::read_to_string(&store.config.index_path)?)?;
            store.clock = index.clock;
            store.next_insert_seq = index.next_insert_seq;
            for entry in index.entries {
                store.total_size += entry.size;
                store.entries.insert(
                    entry.key,
                    StoreEntry {
                        value: None,
                        size: entry.size,
                        access_stamp: entry.access_stamp,
                        insert_seq: entry.insert_seq,
                        pins: 0,
                    },
                );
            }
            debug!(
                "loaded cache index: {} entries, {} bytes",
                store.entries.len(),
                store.total_size
            );
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity_bytes
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up a value, touching its recency. A miss returns `Ok(None)`.
    ///
    /// Freed payloads are reloaded from the blob directory transparently.
    pub fn get(&mut self, key: &CacheKey) -> Result<Option<CachedItemValue>> {
        if !self.entries.contains_key(key) {
            trace!("cache miss for {key}");
            return Ok(None);
        }

        let value = match &self.entries[key].value {
            Some(value) => value.clone(),
            None => {
                let value = self.load_blob(key)?;
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.value = Some(value.clone());
                }
                value
            }
        };

        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.access_stamp = clock;
        }
        trace!("cache hit for {key}");
        Ok(Some(value))
    }

    /// Insert or overwrite a value. Overwrite is idempotent: the observable
    /// state matches a single put, with the access stamp refreshed.
    ///
    /// If the insert pushes the resident size over capacity, the
    /// least-recently-accessed unpinned entries are evicted until the store
    /// fits again. A value larger than the whole capacity is refused, since
    /// accepting it would evict the value itself.
    pub fn put(&mut self, key: CacheKey, value: CachedItemValue) -> Result<()> {
        let size = value.total_size();
        if size > self.config.capacity_bytes {
            return Err(Error::ValueTooLarge {
                size,
                capacity: self.config.capacity_bytes,
            });
        }
        self.write_blob(&key, &value)?;

        if let Some(old) = self.entries.remove(&key) {
            self.total_size -= old.size;
        }
        self.clock += 1;
        let insert_seq = self.next_insert_seq;
        self.next_insert_seq += 1;
        self.entries.insert(
            key,
            StoreEntry {
                value: Some(value),
                size,
                access_stamp: self.clock,
                insert_seq,
                pins: 0,
            },
        );
        self.total_size += size;
        debug!("stored {key}: {size} bytes, {} total", self.total_size);

        self.evict_to_capacity();
        self.save_index()
    }

    /// Pin an entry so eviction skips it while a fetch is in flight.
    /// Returns false for unknown fingerprints.
    pub fn pin(&mut self, key: &CacheKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    /// Release one pin.
    pub fn unpin(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Materialize an entry's files under `dest`. The entry stays pinned
    /// for the duration, so concurrent puts cannot evict it mid-write.
    /// Returns false for unknown fingerprints.
    pub fn fetch(&mut self, key: &CacheKey, dest: &Path) -> Result<bool> {
        if !self.pin(key) {
            return Ok(false);
        }
        let result = self.fetch_pinned(key, dest);
        self.unpin(key);
        result.map(|()| true)
    }

    fn fetch_pinned(&mut self, key: &CacheKey, dest: &Path) -> Result<()> {
        let value = match self.get(key)? {
            Some(value) => value,
            // Entry raced away between pin and get; treated as I/O failure
            // because pin() just succeeded.
            None => return Err(Error::Io(std::io::Error::other("entry vanished"))),
        };
        for file in value.files() {
            let rel = sanitize_relative(&file.path)?;
            let target = dest.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &file.data)?;
        }
        debug!("fetched {key} into {}", dest.display());
        Ok(())
    }

    /// Drop an entry's in-memory payload, keeping only metadata resident.
    /// The payload remains recoverable from the blob directory.
    pub fn free(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = None;
        }
    }

    /// Explicitly delete an entry and its blob. Returns whether it existed.
    pub fn remove(&mut self, key: &CacheKey) -> Result<bool> {
        let Some(entry) = self.entries.remove(key) else {
            return Ok(false);
        };
        self.total_size -= entry.size;
        let path = self.blob_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        self.save_index()?;
        Ok(true)
    }

    /// `(entry_count, total_size, capacity)` for STATUS responses.
    pub fn status(&self) -> (u64, u64, u64) {
        (
            self.entries.len() as u64,
            self.total_size,
            self.config.capacity_bytes,
        )
    }

    /// Persist the index. Called after every mutation; also safe to call
    /// explicitly before shutdown.
    pub fn save_index(&self) -> Result<()> {
        let index = IndexFile {
            clock: self.clock,
            next_insert_seq: self.next_insert_seq,
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| IndexEntry {
                    key: *key,
                    size: entry.size,
                    access_stamp: entry.access_stamp,
                    insert_seq: entry.insert_seq,
                })
                .collect(),
        };
        fs::write(&self.config.index_path, serde_json::to_string_pretty(&index)?)?;
        Ok(())
    }

    fn evict_to_capacity(&mut self) {
        while self.total_size > self.config.capacity_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.pins == 0)
                .min_by_key(|(_, entry)| (entry.access_stamp, entry.insert_seq))
                .map(|(key, _)| *key);

            let Some(key) = victim else {
                warn!(
                    "cache over capacity ({} > {}) but every entry is pinned",
                    self.total_size, self.config.capacity_bytes
                );
                return;
            };

            if let Some(entry) = self.entries.remove(&key) {
                self.total_size -= entry.size;
                debug!(
                    "evicted {key}: {} bytes freed, {} resident",
                    entry.size, self.total_size
                );
            }
            let path = self.blob_path(&key);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("failed to remove evicted blob {}: {e}", path.display());
                }
            }
        }
    }

    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        // abcdef… -> ab/cd/abcdef…
        let hex = key.to_hex();
        self.config
            .data_dir
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(hex)
    }

    fn write_blob(&self, key: &CacheKey, value: &CachedItemValue) -> Result<()> {
        let path = self.blob_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, value.to_archive().encode())?;
        Ok(())
    }

    fn load_blob(&self, key: &CacheKey) -> Result<CachedItemValue> {
        let bytes = fs::read(self.blob_path(key))?;
        let archive = Archive::decode(&bytes)?;
        Ok(CachedItemValue::from_archive(&archive)?)
    }
}

/// Reject absolute paths and parent-directory components so a cached item
/// can never write outside the fetch destination.
fn sanitize_relative(path: &str) -> Result<&Path> {
    let rel = Path::new(path);
    let safe = rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe || rel.as_os_str().is_empty() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsafe item path `{path}`"),
        )));
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn store_with_capacity(dir: &TempDir, capacity: u64) -> CacheStore {
        CacheStore::open(StoreConfig::in_dir(dir.path()).with_capacity(capacity)).unwrap()
    }

    fn value_of(bytes: &'static [u8]) -> CachedItemValue {
        let mut value = CachedItemValue::new();
        value.add_file("artifact.bin", Bytes::from_static(bytes));
        value
    }

    #[test]
    fn test_get_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 1024);
        let key = CacheKey::for_bytes(b"k");

        assert!(store.get(&key).unwrap().is_none());

        let value = value_of(b"payload");
        store.put(key, value.clone()).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(value));
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 1024);
        let key = CacheKey::for_bytes(b"k");
        let value = value_of(b"payload");

        store.put(key, value.clone()).unwrap();
        let (count_1, size_1, _) = store.status();
        store.put(key, value.clone()).unwrap();
        let (count_2, size_2, _) = store.status();

        assert_eq!(count_1, count_2);
        assert_eq!(size_1, size_2);
        assert_eq!(store.get(&key).unwrap(), Some(value));
    }

    #[test]
    fn test_eviction_respects_capacity_and_recency() {
        let dir = TempDir::new().unwrap();
        // Each value is 8 bytes; room for three.
        let mut store = store_with_capacity(&dir, 24);
        let keys: Vec<CacheKey> = (0u8..4).map(|i| CacheKey::from_bytes([i; 16])).collect();

        store.put(keys[0], value_of(b"aaaaaaaa")).unwrap();
        store.put(keys[1], value_of(b"bbbbbbbb")).unwrap();
        store.put(keys[2], value_of(b"cccccccc")).unwrap();

        // Touch the oldest so it is no longer the eviction candidate.
        store.get(&keys[0]).unwrap();

        store.put(keys[3], value_of(b"dddddddd")).unwrap();

        assert!(store.total_size() <= 24);
        assert!(store.contains(&keys[0]), "recently read entry survives");
        assert!(!store.contains(&keys[1]), "least recently accessed evicted");
        assert!(store.contains(&keys[2]));
        assert!(store.contains(&keys[3]));
    }

    #[test]
    fn test_put_larger_than_capacity_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 4);
        let key = CacheKey::for_bytes(b"too-big");

        let result = store.put(key, value_of(b"eightby!"));
        assert!(matches!(
            result,
            Err(Error::ValueTooLarge {
                size: 8,
                capacity: 4
            })
        ));
        assert!(!store.contains(&key));
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn test_refused_put_keeps_resident_entries() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 8);
        let small = CacheKey::for_bytes(b"small");
        store.put(small, value_of(b"ok")).unwrap();

        let big = CacheKey::for_bytes(b"big");
        assert!(store.put(big, value_of(b"way too large")).is_err());
        assert!(store.contains(&small));
        assert!(store.get(&small).unwrap().is_some());
    }

    #[test]
    fn test_eviction_tie_break_is_insertion_order() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 16);
        let first = CacheKey::from_bytes([1; 16]);
        let second = CacheKey::from_bytes([2; 16]);

        store.put(first, value_of(b"aaaaaaaa")).unwrap();
        store.put(second, value_of(b"bbbbbbbb")).unwrap();
        // Force identical stamps, then overflow.
        if let Some(e) = store.entries.get_mut(&first) {
            e.access_stamp = 7;
        }
        if let Some(e) = store.entries.get_mut(&second) {
            e.access_stamp = 7;
        }
        store
            .put(CacheKey::from_bytes([3; 16]), value_of(b"cccccccc"))
            .unwrap();

        assert!(!store.contains(&first), "earlier insertion evicted first");
        assert!(store.contains(&second));
    }

    #[test]
    fn test_pinned_entries_survive_eviction() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 16);
        let pinned = CacheKey::from_bytes([1; 16]);
        let other = CacheKey::from_bytes([2; 16]);

        store.put(pinned, value_of(b"aaaaaaaa")).unwrap();
        assert!(store.pin(&pinned));
        store.put(other, value_of(b"bbbbbbbb")).unwrap();
        store
            .put(CacheKey::from_bytes([3; 16]), value_of(b"cccccccc"))
            .unwrap();

        assert!(store.contains(&pinned), "pinned entry never evicted");
        store.unpin(&pinned);
    }

    #[test]
    fn test_free_keeps_metadata_and_reloads_lazily() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 1024);
        let key = CacheKey::for_bytes(b"k");
        let value = value_of(b"payload");

        store.put(key, value.clone()).unwrap();
        store.free(&key);
        assert!(store.contains(&key));
        // Payload comes back from the blob directory.
        assert_eq!(store.get(&key).unwrap(), Some(value));
    }

    #[test]
    fn test_index_survives_restart() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::for_bytes(b"k");
        let value = value_of(b"payload");
        {
            let mut store = store_with_capacity(&dir, 1024);
            store.put(key, value.clone()).unwrap();
        }
        let mut reopened = store_with_capacity(&dir, 1024);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(&key).unwrap(), Some(value));
    }

    #[test]
    fn test_fetch_materializes_files() {
        let dir = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 1024);
        let key = CacheKey::for_bytes(b"k");

        let mut value = CachedItemValue::new();
        value.add_file("sub/dir/a.bin", Bytes::from_static(b"alpha"));
        value.add_file("b.bin", Bytes::from_static(b"beta"));
        store.put(key, value).unwrap();

        assert!(store.fetch(&key, dest.path()).unwrap());
        assert_eq!(fs::read(dest.path().join("sub/dir/a.bin")).unwrap(), b"alpha");
        assert_eq!(fs::read(dest.path().join("b.bin")).unwrap(), b"beta");

        // Unknown fingerprint: false, not an error.
        assert!(!store.fetch(&CacheKey::for_bytes(b"nope"), dest.path()).unwrap());
    }

    #[test]
    fn test_fetch_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 1024);
        let key = CacheKey::for_bytes(b"k");

        let mut value = CachedItemValue::new();
        value.add_file("../escape.bin", Bytes::from_static(b"nope"));
        store.put(key, value).unwrap();

        assert!(store.fetch(&key, dest.path()).is_err());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with_capacity(&dir, 1024);
        let key = CacheKey::for_bytes(b"k");

        store.put(key, value_of(b"payload")).unwrap();
        assert!(store.remove(&key).unwrap());
        assert!(!store.contains(&key));
        assert_eq!(store.total_size(), 0);
        assert!(!store.remove(&key).unwrap());
    }
}
