//! The sampling decision and the verified-event / blacklist state it
//! consults (spec.md §4.2 C2).
//!
//! Grounded on `prober::scheduler::Scheduler`: there a per-target registry
//! backs a scheduling decision (`should_probe_now`); here the same registry
//! shape (`TrustRegistry`) backs `decide()`. The pass/fail recording idiom
//! (`challenge.rs`'s accept/reject split) becomes `record_verified` /
//! `mark_evil`: a verification failure is terminal for a relay, never a
//! counter to recover from.

use std::collections::HashSet;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{Result, SamplerError};
use crate::trust::{SamplerConfig, TrustRegistry};

/// Outcome of consulting the sampler before accepting an event's signature
/// as valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// This exact event id was already cryptographically verified (from
    /// this relay or another) — accept without re-checking.
    Verify,
    /// Already verified and cached; no crypto work needed.
    SkipCached,
    /// Not cached; the sampler drew `false` for this relay's current
    /// ratio — accept without verification, incrementing `N`.
    SkipSampled,
}

/// Broadcast when a relay fails signature verification and is blacklisted.
#[derive(Clone, Debug)]
pub struct EvilRelayNotice {
    pub relay: String,
}

/// Combines the trust registry, a bounded verified-event-id cache, and a
/// monotonic relay blacklist into the single decision point used before
/// accepting any event body as valid.
pub struct Sampler {
    config: SamplerConfig,
    registry: TrustRegistry,
    verified_ids: Mutex<LruCache<String, ()>>,
    blacklist: RwLock<HashSet<String>>,
    evil_tx: broadcast::Sender<EvilRelayNotice>,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Self {
        let capacity = std::num::NonZeroUsize::new(config.verified_cache_capacity.max(1)).unwrap();
        let (evil_tx, _) = broadcast::channel(64);
        Self {
            config,
            registry: TrustRegistry::default(),
            verified_ids: Mutex::new(LruCache::new(capacity)),
            blacklist: RwLock::new(HashSet::new()),
            evil_tx,
        }
    }

    pub fn is_blacklisted(&self, relay: &str) -> bool {
        self.blacklist.read().contains(relay)
    }

    /// Decide whether `event_id` from `relay` needs cryptographic
    /// verification. Blacklisted relays always require it — the caller is
    /// expected to reject the connection entirely (`SamplerError::Blacklisted`)
    /// rather than process further events from it.
    pub fn decide(&self, relay: &str, event_id: &str) -> Result<Decision> {
        if self.is_blacklisted(relay) {
            return Err(SamplerError::Blacklisted(relay.to_string()));
        }
        if self.verified_ids.lock().contains(event_id) {
            return Ok(Decision::SkipCached);
        }
        let counters = self.registry.get_or_create(relay);
        let ratio = counters.ratio(&self.config);
        if rand::thread_rng().gen_bool(ratio.clamp(0.0, 1.0)) {
            Ok(Decision::Verify)
        } else {
            Ok(Decision::SkipSampled)
        }
    }

    /// Record a successful cryptographic verification: adds the event id to
    /// the verified cache and increments `V` for the relay. A sampled-skip
    /// must never call this — only events that actually passed signature
    /// verification may enter the cache.
    pub fn record_verified(&self, relay: &str, event_id: &str) {
        self.verified_ids.lock().put(event_id.to_string(), ());
        self.registry.get_or_create(relay).record_verified();
    }

    /// Record an event accepted without verification (the sampler drew
    /// `false`): increments `N` only, never touches the verified cache.
    pub fn record_skipped(&self, relay: &str) {
        self.registry.get_or_create(relay).record_skipped();
    }

    /// A verification failed: blacklist the relay permanently (monotonic,
    /// process-lifetime) and broadcast the notice. Idempotent.
    pub fn mark_evil(&self, relay: &str) {
        let newly_inserted = self.blacklist.write().insert(relay.to_string());
        if newly_inserted {
            warn!(relay, "relay blacklisted after signature verification failure");
            let _ = self.evil_tx.send(EvilRelayNotice { relay: relay.to_string() });
        }
    }

    pub fn subscribe_evil(&self) -> broadcast::Receiver<EvilRelayNotice> {
        self.evil_tx.subscribe()
    }

    pub fn verified_count(&self, relay: &str) -> u32 {
        self.registry.get_or_create(relay).verified_count()
    }

    pub fn skipped_count(&self, relay: &str) -> u32 {
        self.registry.get_or_create(relay).skipped_count()
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(SamplerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_warmup_always_verifies_unless_cached() {
        let sampler = Sampler::default();
        assert_eq!(sampler.decide("wss://r/", "id1").unwrap(), Decision::Verify);
        sampler.record_verified("wss://r/", "id1");
        assert_eq!(sampler.decide("wss://r/", "id1").unwrap(), Decision::SkipCached);
    }

    #[test]
    fn mark_evil_blacklists_and_broadcasts_once() {
        let sampler = Sampler::default();
        let mut rx = sampler.subscribe_evil();
        sampler.mark_evil("wss://bad/");
        sampler.mark_evil("wss://bad/");
        assert!(sampler.is_blacklisted("wss://bad/"));
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.relay, "wss://bad/");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn decide_errors_for_blacklisted_relay() {
        let sampler = Sampler::default();
        sampler.mark_evil("wss://bad/");
        assert!(sampler.decide("wss://bad/", "id1").is_err());
    }

    #[test]
    fn record_skipped_never_populates_verified_cache() {
        let sampler = Sampler::default();
        sampler.record_skipped("wss://r/");
        assert_eq!(sampler.skipped_count("wss://r/"), 1);
        assert_eq!(sampler.decide("wss://r/", "some-id").unwrap(), Decision::Verify);
    }
}
