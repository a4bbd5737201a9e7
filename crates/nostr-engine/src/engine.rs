//! The subscription engine: `REQ` grouping, event demultiplexing, EOSE
//! aggregation, and fetch-once (spec.md §4.5 C6, the architectural
//! centerpiece).
//!
//! Grounded on `gossipd::sync::SyncManager` (a `RwLock<HashMap<...>>` peer
//! registry behind one lock, request/response correlation by id) generalized
//! from "one delta-sync peer" to "one subscription across many relays", and
//! on `gossipd::server::Server::spawn_sync_task`'s `tokio::time::interval`
//! background-loop shape for the debounce/flush timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nostr_cache::LayeredCache;
use nostr_core::{Event, Filter};
use nostr_net::{RelayPool, RelayUrl};
use nostr_sampler::{Decision, Sampler};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::subscription::{filters_compatible, merge_filters, Strategy, Subscription};

/// Tuning knobs for grouping and EOSE aggregation (spec.md §4.5, §5 defaults).
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub debounce: Duration,
    pub eose_tolerance: Duration,
    pub eose_cap: Duration,
    pub seen_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            eose_tolerance: Duration::from_millis(300),
            eose_cap: Duration::from_secs(5),
            seen_capacity: 4096,
        }
    }
}

struct PendingReq {
    sub_id: String,
    filters: Vec<Filter>,
    relays: Vec<RelayUrl>,
}

/// A wire-level `REQ`: one or more subscriptions sharing one `sub_id` because
/// their filters were compatible at grouping time. The wire `CLOSE` is
/// deferred until every member has closed (spec.md §4.5 "Grouping").
struct WireGroup {
    relays: Vec<RelayUrl>,
    members: Vec<String>,
}

/// Ties the relay pool, cache, and sampler together to run subscriptions
/// against both (spec.md §4.5). Exclusively owned by the host facade.
pub struct SubscriptionEngine {
    pool: Arc<RelayPool>,
    sampler: Arc<Sampler>,
    events_cache: Arc<LayeredCache<Event>>,
    config: EngineConfig,
    subs: RwLock<HashMap<String, Arc<Subscription>>>,
    wire_groups: RwLock<HashMap<String, WireGroup>>,
    sub_wire_ids: RwLock<HashMap<String, Vec<String>>>,
    pending: Mutex<Vec<PendingReq>>,
    next_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl SubscriptionEngine {
    pub fn new(pool: Arc<RelayPool>, sampler: Arc<Sampler>, events_cache: Arc<LayeredCache<Event>>, config: EngineConfig) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let engine = Arc::new(Self {
            pool,
            sampler,
            events_cache,
            config,
            subs: RwLock::new(HashMap::new()),
            wire_groups: RwLock::new(HashMap::new()),
            sub_wire_ids: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            shutdown_tx,
        });
        engine.clone().spawn_demux_task();
        engine.clone().spawn_debounce_task();
        engine
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut salt = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut salt);
        format!("{prefix}-{n}-{}", hex::encode(salt))
    }

    /// Create a subscription against `filters`, consulting the cache and/or
    /// relays per `strategy` (spec.md §4.5 "Strategies").
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        strategy: Strategy,
        close_on_eose: bool,
        relays: Option<Vec<RelayUrl>>,
    ) -> Result<Arc<Subscription>> {
        let targets = relays.unwrap_or_else(|| self.pool.connected_relays());
        let sub_id = self.fresh_id("sub");
        let sub = Subscription::new(sub_id.clone(), filters.clone(), strategy, close_on_eose, targets.clone(), self.config.seen_capacity);
        self.subs.write().insert(sub_id.clone(), sub.clone());

        let mut cache_hits = 0usize;
        if strategy.consults_cache() {
            cache_hits = self.deliver_from_cache(&sub, &filters).await?;
        }

        let should_contact_relays = match strategy {
            Strategy::CacheOnly => false,
            Strategy::CacheFirst => cache_hits == 0 || filters.iter().any(|f| f.limit.map(|l| cache_hits < l).unwrap_or(true)),
            Strategy::Parallel | Strategy::RelayOnly => true,
        };

        if !should_contact_relays || targets.is_empty() {
            // Not contacting any relay (or none available): this
            // subscription's EOSE condition is "no relay left to hear from",
            // so fire it immediately rather than hang waiting on a deadline.
            sub.set_relay_targets(Vec::new());
            sub.maybe_fire_eose(Duration::ZERO, Duration::ZERO);
            if close_on_eose {
                self.close(&sub_id).await;
            }
            return Ok(sub);
        }

        self.pending.lock().push(PendingReq { sub_id: sub_id.clone(), filters, relays: targets });
        Ok(sub)
    }

    async fn deliver_from_cache(&self, sub: &Arc<Subscription>, filters: &[Filter]) -> Result<usize> {
        let mut hits = 0;
        for key in self.candidate_cache_keys(filters) {
            if let Some(event) = self.events_cache.get(&key)? {
                if sub.matches(&event) {
                    sub.record_event(event);
                    hits += 1;
                }
            }
        }
        Ok(hits)
    }

    /// The cache is keyed by event id hex; only `ids`-constrained filters
    /// have a direct key lookup. Filters without `ids` cannot be served from
    /// this simple keyed cache and fall through to relays (a full scan cache
    /// index is out of scope, spec.md §1 Non-goals on persistence internals).
    fn candidate_cache_keys(&self, filters: &[Filter]) -> Vec<String> {
        filters.iter().filter_map(|f| f.ids.as_ref()).flatten().map(|id| id.to_hex()).collect()
    }

    /// `fetch(filters)`: one-shot subscription accumulated to EOSE (spec.md
    /// §4.5 "Fetch-once").
    pub async fn fetch(&self, filters: Vec<Filter>, strategy: Strategy, relays: Option<Vec<RelayUrl>>) -> Result<Vec<Event>> {
        let sub = self.subscribe(filters, strategy, true, relays).await?;
        let mut eose_rx = sub.subscribe_eose();
        let _ = tokio::time::timeout(self.config.eose_cap + Duration::from_secs(1), eose_rx.recv()).await;
        let events = sub.buffered();
        self.close(&sub.id).await;
        Ok(events)
    }

    pub fn get(&self, sub_id: &str) -> Option<Arc<Subscription>> {
        self.subs.read().get(sub_id).cloned()
    }

    /// Close a subscription: sends wire `CLOSE` once every subscription
    /// sharing its wire group has also closed, invokes close handlers, and
    /// removes it from the registry (spec.md §4.5 "Termination").
    pub async fn close(&self, sub_id: &str) {
        let Some(sub) = self.subs.write().remove(sub_id) else { return };
        sub.mark_closed();

        let wire_ids = self.sub_wire_ids.write().remove(sub_id).unwrap_or_default();
        for wire_id in wire_ids {
            let should_close_wire = {
                let mut groups = self.wire_groups.write();
                match groups.get_mut(&wire_id) {
                    Some(group) => {
                        group.members.retain(|m| m != sub_id);
                        group.members.is_empty()
                    }
                    None => false,
                }
            };
            if should_close_wire {
                let relays = self.wire_groups.write().remove(&wire_id).map(|g| g.relays).unwrap_or_default();
                self.pool.close(&wire_id, &relays).await;
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_debounce_task(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(self.config.debounce);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.flush_pending().await;
                        self.scan_eose_deadlines().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    async fn scan_eose_deadlines(self: &Arc<Self>) {
        let subs: Vec<Arc<Subscription>> = self.subs.read().values().cloned().collect();
        for sub in subs {
            if sub.maybe_fire_eose(self.config.eose_tolerance, self.config.eose_cap) && sub.close_on_eose {
                self.close(&sub.id).await;
            }
        }
    }

    async fn flush_pending(&self) {
        let items: Vec<PendingReq> = std::mem::take(&mut *self.pending.lock());
        if items.is_empty() {
            return;
        }

        let mut groups_by_relayset: HashMap<String, Vec<PendingReq>> = HashMap::new();
        for item in items {
            let mut sorted: Vec<String> = item.relays.iter().map(|r| r.to_string()).collect();
            sorted.sort();
            groups_by_relayset.entry(sorted.join(",")).or_default().push(item);
        }

        for (_, group) in groups_by_relayset {
            self.flush_relay_group(group).await;
        }
    }

    async fn flush_relay_group(&self, items: Vec<PendingReq>) {
        struct Bucket {
            filter: Filter,
            sub_ids: Vec<String>,
        }
        let relays = items.first().map(|i| i.relays.clone()).unwrap_or_default();
        let mut single_filter_buckets: Vec<Bucket> = Vec::new();
        let mut standalone: Vec<(String, Vec<Filter>)> = Vec::new();

        for item in items {
            if item.filters.len() == 1 {
                let filter = item.filters[0].clone();
                if let Some(bucket) = single_filter_buckets.iter_mut().find(|b| filters_compatible(&b.filter, &filter)) {
                    bucket.filter = merge_filters(&bucket.filter, &filter);
                    bucket.sub_ids.push(item.sub_id);
                } else {
                    single_filter_buckets.push(Bucket { filter, sub_ids: vec![item.sub_id] });
                }
            } else {
                standalone.push((item.sub_id, item.filters));
            }
        }

        for bucket in single_filter_buckets {
            self.send_wire_req(bucket.sub_ids, vec![bucket.filter], relays.clone()).await;
        }
        for (sub_id, filters) in standalone {
            self.send_wire_req(vec![sub_id], filters, relays.clone()).await;
        }
    }

    async fn send_wire_req(&self, members: Vec<String>, filters: Vec<Filter>, relays: Vec<RelayUrl>) {
        let wire_id = self.fresh_id("wire");
        for sub_id in &members {
            self.sub_wire_ids.write().entry(sub_id.clone()).or_default().push(wire_id.clone());
        }
        self.wire_groups.write().insert(wire_id.clone(), WireGroup { relays: relays.clone(), members });

        let results = self.pool.req(&wire_id, &filters, &relays).await;
        for (relay, outcome) in results {
            if let Err(e) = outcome {
                warn!(relay = %relay, wire_id = %wire_id, error = %e, "failed to send REQ to relay");
            }
        }
    }

    fn spawn_demux_task(self: Arc<Self>) {
        let mut inbound = self.pool.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbound.recv() => {
                        match message {
                            Ok(pooled) => Self::handle_pooled_message(&self, pooled).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "subscription engine fan-in lagged, dropping messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    async fn handle_pooled_message(self: &Arc<Self>, pooled: nostr_net::PooledMessage) {
        use nostr_net::RelayMessage;
        match pooled.message {
            RelayMessage::Event { sub_id, event } => {
                self.demux_event(&pooled.relay, &sub_id, event).await;
            }
            RelayMessage::Eose { sub_id } => {
                self.demux_eose(&pooled.relay, &sub_id).await;
            }
            RelayMessage::Closed { sub_id, reason } => {
                debug!(relay = %pooled.relay, sub_id, reason, "relay closed subscription");
                self.demux_eose(&pooled.relay, &sub_id).await;
            }
            _ => {}
        }
    }

    async fn demux_event(&self, relay: &RelayUrl, wire_id: &str, event: Event) {
        let decision = match self.sampler.decide(relay.as_str(), &event.id.to_hex()) {
            Ok(d) => d,
            Err(_) => return, // blacklisted; should not normally reach here.
        };

        match decision {
            Decision::Verify => {
                if nostr_core::validate_event(&event).is_ok() {
                    self.sampler.record_verified(relay.as_str(), &event.id.to_hex());
                } else {
                    self.sampler.mark_evil(relay.as_str());
                    if let Some(conn) = self.pool.get(relay) {
                        conn.blacklist();
                    }
                    return;
                }
            }
            Decision::SkipSampled => {
                self.sampler.record_skipped(relay.as_str());
            }
            Decision::SkipCached => {}
        }

        let _ = self.events_cache.set(&event.id.to_hex(), event.clone(), None);

        let members = self.wire_groups.read().get(wire_id).map(|g| g.members.clone()).unwrap_or_default();
        for sub_id in members {
            if let Some(sub) = self.subs.read().get(&sub_id).cloned() {
                if sub.matches(&event) {
                    sub.record_event(event.clone());
                }
            }
        }
    }

    async fn demux_eose(self: &Arc<Self>, relay: &RelayUrl, wire_id: &str) {
        let members = self.wire_groups.read().get(wire_id).map(|g| g.members.clone()).unwrap_or_default();
        for sub_id in members {
            let Some(sub) = self.subs.read().get(&sub_id).cloned() else { continue };
            sub.mark_relay_eose(relay);
            if sub.maybe_fire_eose(self.config.eose_tolerance, self.config.eose_cap) && sub.close_on_eose {
                self.close(&sub_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_cache_only_fires_eose_immediately_without_relays() {
        let pool = Arc::new(RelayPool::new());
        let sampler = Arc::new(Sampler::default());
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(nostr_cache::DiskCache::open(dir.path(), 1_000_000).unwrap());
        let cache = Arc::new(LayeredCache::new(nostr_cache::CacheKind::Event, 64, disk, None));
        let engine = SubscriptionEngine::new(pool, sampler, cache, EngineConfig::default());

        let sub = engine.subscribe(vec![Filter::new()], Strategy::CacheOnly, true, None).await.unwrap();
        assert!(sub.eose_already_fired());
    }

    #[test]
    fn fresh_id_is_unique_across_calls() {
        let pool = Arc::new(RelayPool::new());
        let sampler = Arc::new(Sampler::default());
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(nostr_cache::DiskCache::open(dir.path(), 1_000_000).unwrap());
        let cache = Arc::new(LayeredCache::new(nostr_cache::CacheKind::Event, 64, disk, None));
        let engine = SubscriptionEngine::new(pool, sampler, cache, EngineConfig::default());
        let a = engine.fresh_id("sub");
        let b = engine.fresh_id("sub");
        assert_ne!(a, b);
    }
}
