//! L1 memory cache: an LRU with per-entry TTL (spec.md §4.3).
//!
//! Grounded on the `lru` crate usage the pack's Nostr-adjacent manifests
//! pull in for exactly this (`rust-nostr`'s `lru = "0.16"`); TTL is checked
//! on read, on top of the crate's own recency eviction.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::num::NonZeroUsize;

use crate::entry::CacheEntry;

/// Thread-safe LRU cache with per-entry expiry. `get` is a promotion: a hit
/// moves the entry to the front of the recency list.
pub struct MemoryCache<T> {
    inner: Mutex<LruCache<String, CacheEntry<T>>>,
}

impl<T: Clone + Serialize + DeserializeOwned> MemoryCache<T> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity must be nonzero");
        Self { inner: Mutex::new(LruCache::new(cap)) }
    }

    /// `None` if absent or expired (an expired hit is evicted, not returned).
    pub fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        let expired = inner.peek(key).map(|e| e.is_expired()).unwrap_or(false);
        if expired {
            inner.pop(key);
            return None;
        }
        let entry = inner.get_mut(key)?;
        entry.touch();
        Some(entry.value.clone())
    }

    pub fn set(&self, key: String, value: T, ttl_secs: Option<i64>) {
        self.inner.lock().put(key, CacheEntry::new(value, ttl_secs));
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> usize {
        self.inner.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_configured_capacity() {
        let cache: MemoryCache<u32> = MemoryCache::new(2);
        cache.set("a".into(), 1, None);
        cache.set("b".into(), 2, None);
        cache.set("c".into(), 3, None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let cache: MemoryCache<u32> = MemoryCache::new(4);
        cache.set("a".into(), 1, Some(-1));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn get_promotes_entry_as_most_recently_used() {
        let cache: MemoryCache<u32> = MemoryCache::new(2);
        cache.set("a".into(), 1, None);
        cache.set("b".into(), 2, None);
        let _ = cache.get("a");
        cache.set("c".into(), 3, None);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
    }
}
