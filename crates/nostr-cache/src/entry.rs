//! Typed cache entry: the value plus the bookkeeping timestamps eviction and
//! expiry use (spec.md §3 "Cache entry").

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// A cached value with creation/expiry/last-access bookkeeping. `expires_at`
/// of `None` means the entry never expires on its own (still subject to LRU
/// eviction).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub last_access_at: i64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl_secs: Option<i64>) -> Self {
        let now = now_unix();
        Self { value, created_at: now, expires_at: ttl_secs.map(|ttl| now + ttl), last_access_at: now }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => now_unix() >= exp,
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_access_at = now_unix();
    }
}

/// The kind of value a cache entry holds; used to pick a disk tree and to
/// label entries in debugging/export output (spec.md §3, §6 directory layout).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Event,
    Profile,
    Nip05,
    RelayHealth,
    Outbox,
}

impl CacheKind {
    pub fn tree_name(self) -> &'static str {
        match self {
            CacheKind::Event => "events",
            CacheKind::Profile => "profiles",
            CacheKind::Nip05 => "nip05",
            CacheKind::RelayHealth => "relay_health",
            CacheKind::Outbox => "outbox",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_without_ttl_never_expires() {
        let entry = CacheEntry::new(42u32, None);
        assert!(!entry.is_expired());
    }

    #[test]
    fn entry_with_zero_ttl_is_immediately_expired() {
        let entry = CacheEntry::new(42u32, Some(-1));
        assert!(entry.is_expired());
    }

    #[test]
    fn tree_names_match_directory_layout() {
        assert_eq!(CacheKind::Event.tree_name(), "events");
        assert_eq!(CacheKind::Outbox.tree_name(), "outbox");
    }
}
