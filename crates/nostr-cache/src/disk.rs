//! L2 disk cache: a size-capped LRU+TTL store on top of `sled`.
//!
//! Grounded directly on `gossipd::storage::Storage` (named `sled::Tree`s,
//! one put/get per tree) — here the trees are `events`, `profiles`, `nip05`,
//! `relay_health`, `outbox`, matching the directory layout spec.md §6
//! suggests, plus a `meta` tree tracking `(size, created_at, expires_at,
//! last_access_at)` per key so eviction doesn't need a separate index file:
//! `sled` opening its trees directly on `open()` already satisfies the
//! "index recoverable by directory scan" requirement (spec.md §4.3, §6).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sled::Db;
use tracing::{debug, warn};

use crate::entry::{now_unix, CacheKind};
use crate::error::{CacheError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DiskMeta {
    size: u64,
    created_at: i64,
    expires_at: Option<i64>,
    last_access_at: i64,
}

/// Size-capped, TTL-aware disk cache. Eviction runs on insertion, walking
/// the `meta` tree in `last_access_at` order until
/// `current + reserved <= max_bytes` (spec.md §4.3).
pub struct DiskCache {
    db: Db,
    meta: sled::Tree,
    max_bytes: u64,
    current_bytes: AtomicU64,
}

impl DiskCache {
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let db = sled::open(path)?;
        let meta = db.open_tree("meta")?;
        let current_bytes = Self::rebuild_total(&meta)?;
        Ok(Self { db, meta, max_bytes, current_bytes: AtomicU64::new(current_bytes) })
    }

    fn rebuild_total(meta: &sled::Tree) -> Result<u64> {
        let mut total = 0u64;
        for result in meta.iter() {
            let (_, bytes) = result?;
            if let Ok(m) = serde_json::from_slice::<DiskMeta>(&bytes) {
                total += m.size;
            }
        }
        Ok(total)
    }

    fn tree(&self, kind: CacheKind) -> Result<sled::Tree> {
        Ok(self.db.open_tree(kind.tree_name())?)
    }

    fn meta_key(kind: CacheKind, key: &str) -> String {
        format!("{}:{}", kind.tree_name(), key)
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::SeqCst)
    }

    /// Store pre-serialized bytes for `key` under `kind`, enforcing the
    /// size cap by evicting least-recently-used entries across every tree.
    pub fn put(&self, kind: CacheKind, key: &str, value: &[u8], ttl_secs: Option<i64>) -> Result<()> {
        let tree = self.tree(kind)?;
        let size = value.len() as u64;
        let meta_key = Self::meta_key(kind, key);

        // Replace: subtract the old entry's size before accounting the new one.
        if let Some(old) = self.meta.get(&meta_key)? {
            if let Ok(old_meta) = serde_json::from_slice::<DiskMeta>(&old) {
                self.current_bytes.fetch_sub(old_meta.size, Ordering::SeqCst);
            }
        }

        self.evict_to_fit(size)?;

        tree.insert(key, value)?;
        let now = now_unix();
        let meta = DiskMeta { size, created_at: now, expires_at: ttl_secs.map(|ttl| now + ttl), last_access_at: now };
        self.meta.insert(&meta_key, serde_json::to_vec(&meta)?)?;
        self.current_bytes.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    fn evict_to_fit(&self, reserved: u64) -> Result<()> {
        if self.current_bytes() + reserved <= self.max_bytes {
            return Ok(());
        }
        let mut candidates: Vec<(String, DiskMeta)> = Vec::new();
        for result in self.meta.iter() {
            let (k, v) = result?;
            let key = String::from_utf8_lossy(&k).into_owned();
            if let Ok(m) = serde_json::from_slice::<DiskMeta>(&v) {
                candidates.push((key, m));
            }
        }
        candidates.sort_by_key(|(_, m)| m.last_access_at);

        for (meta_key, m) in candidates {
            if self.current_bytes() + reserved <= self.max_bytes {
                break;
            }
            if let Some((tree_name, key)) = meta_key.split_once(':') {
                let tree = self.db.open_tree(tree_name)?;
                tree.remove(key)?;
            }
            self.meta.remove(&meta_key)?;
            self.current_bytes.fetch_sub(m.size, Ordering::SeqCst);
            debug!(key = %meta_key, "evicted disk cache entry to enforce size cap");
        }
        Ok(())
    }

    /// `None` if absent, expired, or corrupted (corrupted entries are
    /// evicted and the cache falls back to a miss, spec.md §7 "Storage").
    pub fn get(&self, kind: CacheKind, key: &str) -> Result<Option<Vec<u8>>> {
        let meta_key = Self::meta_key(kind, key);
        let Some(meta_bytes) = self.meta.get(&meta_key)? else {
            return Ok(None);
        };
        let mut meta: DiskMeta = match serde_json::from_slice(&meta_bytes) {
            Ok(m) => m,
            Err(_) => {
                warn!(key = %meta_key, "corrupted cache metadata, evicting");
                self.remove(kind, key)?;
                return Ok(None);
            }
        };
        if let Some(exp) = meta.expires_at {
            if now_unix() >= exp {
                self.remove(kind, key)?;
                return Ok(None);
            }
        }
        let tree = self.tree(kind)?;
        let Some(value) = tree.get(key)? else {
            self.meta.remove(&meta_key)?;
            return Ok(None);
        };
        meta.last_access_at = now_unix();
        self.meta.insert(&meta_key, serde_json::to_vec(&meta)?)?;
        Ok(Some(value.to_vec()))
    }

    pub fn remove(&self, kind: CacheKind, key: &str) -> Result<()> {
        let meta_key = Self::meta_key(kind, key);
        if let Some(old) = self.meta.remove(&meta_key)? {
            if let Ok(m) = serde_json::from_slice::<DiskMeta>(&old) {
                self.current_bytes.fetch_sub(m.size, Ordering::SeqCst);
            }
        }
        self.tree(kind)?.remove(key)?;
        Ok(())
    }

    pub fn contains(&self, kind: CacheKind, key: &str) -> Result<bool> {
        Ok(self.meta.contains_key(Self::meta_key(kind, key))?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Enumerate every non-expired value stored under `kind`, evicting any
    /// expired entries found along the way. Used by the outbox retry scan
    /// and the host facade's startup resume pass (spec.md §4.6: "on startup
    /// the engine enumerates [outbox records] and resumes retries").
    pub fn iter_kind(&self, kind: CacheKind) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = format!("{}:", kind.tree_name());
        let tree = self.tree(kind)?;
        let mut out = Vec::new();
        for result in self.meta.scan_prefix(&prefix) {
            let (meta_key_bytes, meta_bytes) = result?;
            let meta_key = String::from_utf8_lossy(&meta_key_bytes).into_owned();
            let Some(key) = meta_key.strip_prefix(&prefix) else { continue };

            let meta: DiskMeta = match serde_json::from_slice(&meta_bytes) {
                Ok(m) => m,
                Err(_) => {
                    self.meta.remove(&meta_key)?;
                    continue;
                }
            };
            if let Some(exp) = meta.expires_at {
                if now_unix() >= exp {
                    self.remove(kind, key)?;
                    continue;
                }
            }
            if let Some(value) = tree.get(key)? {
                out.push((key.to_string(), value.to_vec()));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        cache.put(CacheKind::Event, "e1", b"hello", None).unwrap();
        assert_eq!(cache.get(CacheKind::Event, "e1").unwrap().unwrap(), b"hello");
    }

    #[test]
    fn expired_entry_returns_none_and_is_removed() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        cache.put(CacheKind::Profile, "p1", b"data", Some(-1)).unwrap();
        assert!(cache.get(CacheKind::Profile, "p1").unwrap().is_none());
        assert!(!cache.contains(CacheKind::Profile, "p1").unwrap());
    }

    #[test]
    fn size_cap_is_enforced_by_evicting_lru() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 30).unwrap();
        cache.put(CacheKind::Event, "a", b"0123456789", None).unwrap();
        cache.put(CacheKind::Event, "b", b"0123456789", None).unwrap();
        cache.put(CacheKind::Event, "c", b"0123456789", None).unwrap();
        assert!(cache.current_bytes() <= 30);
        // "a" was least-recently-used and should have been evicted first.
        assert!(cache.get(CacheKind::Event, "a").unwrap().is_none());
        assert!(cache.get(CacheKind::Event, "c").unwrap().is_some());
    }

    #[test]
    fn iter_kind_skips_other_kinds_and_expired_entries() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
        cache.put(CacheKind::Outbox, "a", b"1", None).unwrap();
        cache.put(CacheKind::Outbox, "b", b"2", Some(-1)).unwrap();
        cache.put(CacheKind::Event, "c", b"3", None).unwrap();

        let items = cache.iter_kind(CacheKind::Outbox).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0], ("a".to_string(), b"1".to_vec()));
    }

    #[test]
    fn reopening_rebuilds_size_from_meta_tree() {
        let dir = tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path(), 1_000_000).unwrap();
            cache.put(CacheKind::Event, "a", b"0123456789", None).unwrap();
            cache.flush().unwrap();
        }
        let reopened = DiskCache::open(dir.path(), 1_000_000).unwrap();
        assert_eq!(reopened.current_bytes(), 10);
    }
}
