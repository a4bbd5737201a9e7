//! Per-relay trust counters and the adaptive verification ratio (spec.md §4.2).
//!
//! Grounded on `prober::scheduler::ProbeHistory`: a rolling per-target
//! counter pair driving a derived policy value. There,
//! `consecutive_failures` drives `suggested_interval()`; here, `V`
//! (verified-valid events) drives `ratio()`, and the priority bucketing
//! becomes the warm-up floor below ten verifications.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Sampler tuning knobs (spec.md §4.2 defaults).
#[derive(Clone, Copy, Debug)]
pub struct SamplerConfig {
    pub initial: f64,
    pub min: f64,
    pub k: f64,
    pub warmup_threshold: u32,
    pub verified_cache_capacity: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { initial: 1.0, min: 0.1, k: 0.01, warmup_threshold: 10, verified_cache_capacity: 16_384 }
    }
}

/// `V` (verified-valid) and `N` (accepted-without-verification) counters for
/// one relay.
#[derive(Default)]
pub struct TrustCounters {
    verified: AtomicU32,
    skipped: AtomicU32,
}

impl TrustCounters {
    pub fn record_verified(&self) {
        self.verified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn verified_count(&self) -> u32 {
        self.verified.load(Ordering::Relaxed)
    }

    pub fn skipped_count(&self) -> u32 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// `initial * e^(-k * V)` clamped to `[min, initial]`; forced to `1.0`
    /// while `V < warmup_threshold` regardless of the formula (spec.md §4.2,
    /// P5).
    pub fn ratio(&self, config: &SamplerConfig) -> f64 {
        let v = self.verified_count();
        if v < config.warmup_threshold {
            return 1.0;
        }
        let raw = config.initial * (-config.k * v as f64).exp();
        raw.clamp(config.min, config.initial)
    }
}

/// Registry of per-relay trust counters, created lazily on first contact.
#[derive(Default)]
pub struct TrustRegistry {
    relays: RwLock<HashMap<String, Arc<TrustCounters>>>,
}

impl TrustRegistry {
    pub fn get_or_create(&self, relay: &str) -> Arc<TrustCounters> {
        if let Some(existing) = self.relays.read().get(relay) {
            return existing.clone();
        }
        let mut relays = self.relays.write();
        relays.entry(relay.to_string()).or_insert_with(|| Arc::new(TrustCounters::default())).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_one_below_warmup_threshold() {
        let counters = TrustCounters::default();
        let config = SamplerConfig::default();
        for _ in 0..9 {
            counters.record_verified();
        }
        assert_eq!(counters.ratio(&config), 1.0);
    }

    #[test]
    fn ratio_decays_and_is_clamped_after_warmup() {
        let counters = TrustCounters::default();
        let config = SamplerConfig::default();
        for _ in 0..1000 {
            counters.record_verified();
        }
        let ratio = counters.ratio(&config);
        assert!(ratio >= config.min);
        assert!(ratio <= config.initial);
    }

    #[test]
    fn registry_returns_same_counters_for_same_relay() {
        let registry = TrustRegistry::default();
        let a = registry.get_or_create("wss://relay.example.com/");
        a.record_verified();
        let b = registry.get_or_create("wss://relay.example.com/");
        assert_eq!(b.verified_count(), 1);
    }
}
