//! Metadata cache keyed by path
//!
//! Each entry remembers the checksum of the file bytes it was parsed from.
//! A lookup with a different checksum drops the entry and reports
//! `Invalidated` so the caller parses the file again.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::track::TrackMetadata;

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(TrackMetadata),
    Miss,
    /// An entry existed but the file changed since it was parsed
    Invalidated,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

struct CacheEntry {
    checksum: u64,
    metadata: TrackMetadata,
    /// Insertion order, used for eviction
    sequence: u64,
}

/// Bounded in-memory metadata cache
///
/// Safe to populate from several threads; the last insert for a path wins.
pub struct MetadataCache {
    capacity: usize,
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Look up `path`, validating the entry against the current checksum
    pub fn lookup(&self, path: &Path, checksum: u64) -> CacheLookup {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(path) {
                Some(entry) if entry.checksum == checksum => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return CacheLookup::Hit(entry.metadata.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return CacheLookup::Miss;
                }
            }
        }

        // Stale: the checksum changed since the entry was stored
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(path).is_some_and(|e| e.checksum != checksum) {
            entries.remove(path);
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        CacheLookup::Invalidated
    }

    /// Store metadata parsed from bytes with `checksum`
    pub fn insert(&self, path: &Path, checksum: u64, metadata: TrackMetadata) {
        if self.capacity == 0 {
            return;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        if entries.len() >= self.capacity && !entries.contains_key(path) {
            Self::evict_oldest(&mut entries, (self.capacity / 10).max(1));
        }
        entries.insert(
            path.to_path_buf(),
            CacheEntry {
                checksum,
                metadata,
                sequence,
            },
        );
    }

    fn evict_oldest(entries: &mut HashMap<PathBuf, CacheEntry>, count: usize) {
        let mut by_age: Vec<(u64, PathBuf)> = entries
            .iter()
            .map(|(path, entry)| (entry.sequence, path.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(sequence, _)| *sequence);
        for (_, path) in by_age.into_iter().take(count) {
            entries.remove(&path);
        }
        debug!("Evicted {} cache entries", count);
    }

    /// Drop the entry for `path`; returns whether one existed
    pub fn remove(&self, path: &Path) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }

    /// Drop every entry and reset the counters
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().unwrap_or_else(PoisonError::into_inner).len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Checksum of a file's full contents
pub fn checksum(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Read and checksum a file
pub fn compute_file_hash<P: AsRef<Path>>(path: P) -> Result<u64> {
    Ok(checksum(&fs::read(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_metadata(path: &str) -> TrackMetadata {
        let mut meta = TrackMetadata::new(path);
        meta.title = Some("Test Track".into());
        meta
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = MetadataCache::new(10);
        let path = Path::new("a.mp3");

        assert_eq!(cache.lookup(path, 1), CacheLookup::Miss);
        cache.insert(path, 1, make_metadata("a.mp3"));
        match cache.lookup(path, 1) {
            CacheLookup::Hit(meta) => assert_eq!(meta.title.as_deref(), Some("Test Track")),
            other => panic!("expected hit, got {:?}", other),
        }

        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (1, 1, 1));
    }

    #[test]
    fn test_checksum_change_invalidates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("track.mp3");
        fs::write(&path, b"first").unwrap();

        let cache = MetadataCache::new(10);
        let before = compute_file_hash(&path).unwrap();
        cache.insert(&path, before, make_metadata("track.mp3"));

        fs::write(&path, b"second").unwrap();
        let after = compute_file_hash(&path).unwrap();
        assert_ne!(before, after);

        assert_eq!(cache.lookup(&path, after), CacheLookup::Invalidated);
        // The stale entry is gone
        assert_eq!(cache.lookup(&path, before), CacheLookup::Miss);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let cache = MetadataCache::new(3);
        for name in ["1.mp3", "2.mp3", "3.mp3", "4.mp3"] {
            cache.insert(Path::new(name), 0, make_metadata(name));
        }

        assert_eq!(cache.stats().entries, 3);
        assert_eq!(cache.lookup(Path::new("1.mp3"), 0), CacheLookup::Miss);
        assert!(matches!(cache.lookup(Path::new("4.mp3"), 0), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_cache_clear() {
        let cache = MetadataCache::new(10);
        cache.insert(Path::new("a.mp3"), 1, make_metadata("a.mp3"));
        cache.lookup(Path::new("a.mp3"), 1);

        cache.clear();
        assert_eq!(
            cache.stats(),
            CacheStats {
                capacity: 10,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_zero_capacity_never_stores() {
        let cache = MetadataCache::new(0);
        cache.insert(Path::new("a.mp3"), 1, make_metadata("a.mp3"));
        assert_eq!(cache.stats().entries, 0);
    }
}
