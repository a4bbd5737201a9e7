//! The two-tier write-through cache: memory over disk (spec.md §4.3).
//!
//! No single teacher file owns this composition — it's assembled from
//! `memory.rs` and `disk.rs` directly per the contract in spec.md: `get`
//! walks layers and promotes a lower-layer hit into the higher layer;
//! `set` writes through to both layers by default, or to memory only in
//! non-write-through mode.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::disk::DiskCache;
use crate::entry::CacheKind;
use crate::error::{CacheError, Result};
use crate::memory::MemoryCache;

/// A typed two-tier cache for one [`CacheKind`] (events, profiles, ...).
pub struct LayeredCache<T> {
    kind: CacheKind,
    memory: MemoryCache<T>,
    disk: Arc<DiskCache>,
    default_ttl: Option<i64>,
}

impl<T: Clone + Serialize + DeserializeOwned> LayeredCache<T> {
    pub fn new(kind: CacheKind, memory_capacity: usize, disk: Arc<DiskCache>, default_ttl: Option<i64>) -> Self {
        Self { kind, memory: MemoryCache::new(memory_capacity), disk, default_ttl }
    }

    /// Walk L1 then L2; an L2 hit is promoted into L1 before returning.
    pub fn get(&self, key: &str) -> Result<Option<T>> {
        if let Some(value) = self.memory.get(key) {
            return Ok(Some(value));
        }
        let Some(bytes) = self.disk.get(self.kind, key)? else {
            return Ok(None);
        };
        let value: T = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(_) => {
                self.disk.remove(self.kind, key)?;
                return Err(CacheError::Corrupted(key.to_string()));
            }
        };
        self.memory.set(key.to_string(), value.clone(), self.default_ttl);
        Ok(Some(value))
    }

    /// Write-through: updates L1 and persists to L2.
    pub fn set(&self, key: &str, value: T, ttl_secs: Option<i64>) -> Result<()> {
        let ttl = ttl_secs.or(self.default_ttl);
        let bytes = serde_json::to_vec(&value)?;
        self.memory.set(key.to_string(), value, ttl);
        self.disk.put(self.kind, key, &bytes, ttl)?;
        Ok(())
    }

    /// Writes only to L1, leaving L2 untouched (spec.md §4.3 non-write-through mode).
    pub fn set_memory_only(&self, key: &str, value: T, ttl_secs: Option<i64>) {
        self.memory.set(key.to_string(), value, ttl_secs.or(self.default_ttl));
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.memory.remove(key);
        self.disk.remove(self.kind, key)
    }

    /// Enumerate every non-expired value of this kind, reading through the
    /// disk tier (L1 is not scanned: it is a strict subset, repopulated on
    /// read). Corrupted entries are skipped rather than surfaced as errors,
    /// matching `get`'s self-healing-on-read behavior.
    pub fn all(&self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for (_, bytes) in self.disk.iter_kind(self.kind)? {
            if let Ok(value) = serde_json::from_slice(&bytes) {
                out.push(value);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Dummy {
        n: u32,
    }

    fn layered(dir: &std::path::Path) -> LayeredCache<Dummy> {
        let disk = Arc::new(DiskCache::open(dir, 1_000_000).unwrap());
        LayeredCache::new(CacheKind::Event, 8, disk, None)
    }

    #[test]
    fn l2_hit_is_promoted_into_l1() {
        let dir = tempdir().unwrap();
        let cache = layered(dir.path());
        cache.set("k", Dummy { n: 1 }, None).unwrap();

        let disk_only = DiskCache::open(dir.path(), 1_000_000).unwrap();
        assert!(disk_only.get(CacheKind::Event, "k").unwrap().is_some());

        let fresh = LayeredCache::<Dummy>::new(CacheKind::Event, 8, Arc::new(disk_only), None);
        assert_eq!(fresh.get("k").unwrap(), Some(Dummy { n: 1 }));
    }

    #[test]
    fn memory_only_set_does_not_reach_disk() {
        let dir = tempdir().unwrap();
        let cache = layered(dir.path());
        cache.set_memory_only("k", Dummy { n: 7 }, None);
        assert_eq!(cache.get("k").unwrap(), Some(Dummy { n: 7 }));

        let disk_only = DiskCache::open(dir.path(), 1_000_000).unwrap();
        assert!(disk_only.get(CacheKind::Event, "k").unwrap().is_none());
    }

    #[test]
    fn remove_clears_both_layers() {
        let dir = tempdir().unwrap();
        let cache = layered(dir.path());
        cache.set("k", Dummy { n: 1 }, None).unwrap();
        cache.remove("k").unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn all_enumerates_every_persisted_value() {
        let dir = tempdir().unwrap();
        let cache = layered(dir.path());
        cache.set("a", Dummy { n: 1 }, None).unwrap();
        cache.set("b", Dummy { n: 2 }, None).unwrap();
        let mut values = cache.all().unwrap();
        values.sort_by_key(|d| d.n);
        assert_eq!(values, vec![Dummy { n: 1 }, Dummy { n: 2 }]);
    }
}
