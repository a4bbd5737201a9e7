//! A single subscription: its targeted relays, per-relay EOSE bookkeeping,
//! bounded dedup, and the event/EOSE/close notification channels callers
//! observe (spec.md §4.5 C6).
//!
//! Grounded on `gossipd::event_log::EventLog`'s append-and-dedup-by-id shape
//! (`has_event`/`append`) for the seen-set, and on
//! `gossipd::sync::PeerSyncState` (one bookkeeping struct per counterparty,
//! behind the owner's single lock) generalized from "one peer" to "one relay
//! within one subscription".

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nostr_core::{Event, EventId, Filter};
use nostr_net::RelayUrl;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

/// How a subscription sources events (spec.md §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    CacheOnly,
    CacheFirst,
    Parallel,
    RelayOnly,
}

impl Strategy {
    pub fn consults_cache(self) -> bool {
        matches!(self, Strategy::CacheOnly | Strategy::CacheFirst | Strategy::Parallel)
    }

    pub fn consults_relays(self) -> bool {
        !matches!(self, Strategy::CacheOnly)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubState {
    Open,
    Closed,
}

/// Bounded FIFO-eviction dedup set, keyed by event id (spec.md §4.5: "a
/// bounded per-subscription seen set with timestamp ordering bounds memory;
/// eviction discards oldest").
struct SeenSet {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self { seen: HashSet::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Returns `true` if `id` is new (not previously seen on this subscription).
    fn insert_if_new(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Per-relay EOSE bookkeeping for the adaptive-deadline calculation
/// (spec.md §4.5 "EOSE").
struct RelayEose {
    received_at: Instant,
}

/// One active (or recently closed) subscription. Created by the engine,
/// shared via `Arc` with anyone holding a handle.
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
    pub strategy: Strategy,
    pub close_on_eose: bool,
    pub created_at: Instant,
    relays: RwLock<Vec<RelayUrl>>,
    relay_eose: RwLock<HashMap<RelayUrl, RelayEose>>,
    seen: Mutex<SeenSet>,
    buffer: RwLock<Vec<Event>>,
    unique_count: std::sync::atomic::AtomicU64,
    event_tx: broadcast::Sender<Event>,
    eose_tx: broadcast::Sender<()>,
    eose_fired: AtomicBool,
    close_tx: broadcast::Sender<()>,
    state: RwLock<SubState>,
    closed_at: RwLock<Option<Instant>>,
}

impl Subscription {
    pub fn new(id: String, filters: Vec<Filter>, strategy: Strategy, close_on_eose: bool, relays: Vec<RelayUrl>, seen_capacity: usize) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(1024);
        let (eose_tx, _) = broadcast::channel(1);
        let (close_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            id,
            filters,
            strategy,
            close_on_eose,
            created_at: Instant::now(),
            relays: RwLock::new(relays),
            relay_eose: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenSet::new(seen_capacity)),
            buffer: RwLock::new(Vec::new()),
            unique_count: std::sync::atomic::AtomicU64::new(0),
            event_tx,
            eose_tx,
            eose_fired: AtomicBool::new(false),
            close_tx,
            state: RwLock::new(SubState::Open),
            closed_at: RwLock::new(None),
        })
    }

    pub fn targeted_relays(&self) -> Vec<RelayUrl> {
        self.relays.read().clone()
    }

    /// Overrides the targeted relay set, e.g. when a strategy decides after
    /// construction that it will not contact relays after all.
    pub fn set_relay_targets(&self, relays: Vec<RelayUrl>) {
        *self.relays.write() = relays;
    }

    pub fn add_relay_target(&self, relay: RelayUrl) {
        let mut relays = self.relays.write();
        if !relays.contains(&relay) {
            relays.push(relay);
        }
    }

    pub fn state(&self) -> SubState {
        *self.state.read()
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.matches(event))
    }

    /// Dedup by event id, append to the buffer, and notify subscribers if
    /// new. Returns whether the event was newly recorded.
    pub fn record_event(&self, event: Event) -> bool {
        if !self.seen.lock().insert_if_new(event.id) {
            return false;
        }
        self.unique_count.fetch_add(1, Ordering::Relaxed);
        self.buffer.write().push(event.clone());
        let _ = self.event_tx.send(event);
        true
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn buffered(&self) -> Vec<Event> {
        self.buffer.read().clone()
    }

    pub fn unique_event_count(&self) -> u64 {
        self.unique_count.load(Ordering::Relaxed)
    }

    /// Record a relay's EOSE for this subscription. Returns `true` if this is
    /// the first time this relay has reported EOSE here.
    pub fn mark_relay_eose(&self, relay: &RelayUrl) -> bool {
        let mut map = self.relay_eose.write();
        if map.contains_key(relay) {
            return false;
        }
        map.insert(relay.clone(), RelayEose { received_at: Instant::now() });
        true
    }

    pub fn relays_with_eose(&self) -> usize {
        self.relay_eose.read().len()
    }

    pub fn has_relay_eose(&self, relay: &RelayUrl) -> bool {
        self.relay_eose.read().contains_key(relay)
    }

    pub fn eose_already_fired(&self) -> bool {
        self.eose_fired.load(Ordering::SeqCst)
    }

    /// Check whether this subscription's overall EOSE condition is met: every
    /// targeted relay has reported EOSE, or the adaptive deadline
    /// (`median(time-to-EOSE over ready relays) + tolerance`, capped) has
    /// elapsed since the first relay responded. Fires the EOSE notification
    /// at most once (spec.md §4.5).
    pub fn maybe_fire_eose(&self, tolerance: Duration, cap: Duration) -> bool {
        if self.eose_fired.load(Ordering::SeqCst) {
            return false;
        }
        let targets = self.relays.read().len();
        let received = self.relay_eose.read();
        let all_responded = received.len() >= targets;

        let deadline_elapsed = if received.is_empty() {
            false
        } else {
            let mut deltas: Vec<Duration> = received.values().map(|r| r.received_at.duration_since(self.created_at)).collect();
            deltas.sort();
            let median = deltas[deltas.len() / 2];
            let deadline = (median + tolerance).min(cap);
            self.created_at.elapsed() >= deadline
        };

        if all_responded || deadline_elapsed {
            if self.eose_fired.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                let _ = self.eose_tx.send(());
                return true;
            }
        }
        false
    }

    pub fn subscribe_eose(&self) -> broadcast::Receiver<()> {
        self.eose_tx.subscribe()
    }

    pub fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.close_tx.subscribe()
    }

    /// Transition to closed, invoking close handlers exactly once. Idempotent.
    pub fn mark_closed(&self) {
        let mut state = self.state.write();
        if *state == SubState::Closed {
            return;
        }
        *state = SubState::Closed;
        *self.closed_at.write() = Some(Instant::now());
        let _ = self.close_tx.send(());
    }

    pub fn closed_at(&self) -> Option<Instant> {
        *self.closed_at.read()
    }
}

/// Whether two filters may be merged into one `REQ` without changing the
/// observable semantics for either caller (spec.md §4.5 "Grouping"): every
/// scalar field equal-or-absent, no `limit` on either side (conservative
/// choice, see `DESIGN.md`).
pub fn filters_compatible(a: &Filter, b: &Filter) -> bool {
    if a.limit.is_some() || b.limit.is_some() {
        return false;
    }
    scalar_compatible(a.since, b.since) && scalar_compatible(a.until, b.until) && scalar_compatible(a.search.clone(), b.search.clone())
}

fn scalar_compatible<T: PartialEq>(a: Option<T>, b: Option<T>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        (Some(_), None) | (None, Some(_)) => false,
    }
}

/// Field-wise union of two compatible filters (spec.md §4.5).
pub fn merge_filters(a: &Filter, b: &Filter) -> Filter {
    let mut merged = Filter::new();
    merged.since = a.since.or(b.since);
    merged.until = a.until.or(b.until);
    merged.search = a.search.clone().or_else(|| b.search.clone());
    merged.ids = union_opt_vec(&a.ids, &b.ids);
    merged.authors = union_opt_vec(&a.authors, &b.authors);
    merged.kinds = union_opt_vec(&a.kinds, &b.kinds);
    for (key, values) in a.tags.iter().chain(b.tags.iter()) {
        let entry = merged.tags.entry(key.clone()).or_default();
        for v in values {
            if !entry.contains(v) {
                entry.push(v.clone());
            }
        }
    }
    merged
}

fn union_opt_vec<T: Clone + PartialEq>(a: &Option<Vec<T>>, b: &Option<Vec<T>>) -> Option<Vec<T>> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) => Some(x.clone()),
        (None, Some(y)) => Some(y.clone()),
        (Some(x), Some(y)) => {
            let mut merged = x.clone();
            for item in y {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Some(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_core::{EventBuilder, Secp256k1Crypto};

    fn sample_event() -> Event {
        let signer = Secp256k1Crypto::generate();
        EventBuilder::new(1, "hi").sign(&signer, 1_700_000_000).unwrap()
    }

    #[test]
    fn record_event_dedups_by_id() {
        let sub = Subscription::new("s1".into(), vec![Filter::new()], Strategy::Parallel, false, vec![], 100);
        let event = sample_event();
        assert!(sub.record_event(event.clone()));
        assert!(!sub.record_event(event));
        assert_eq!(sub.unique_event_count(), 1);
    }

    #[test]
    fn seen_set_evicts_oldest_beyond_capacity() {
        let mut seen = SeenSet::new(2);
        let ids: Vec<EventId> = (0..3).map(|i| EventId([i as u8; 32])).collect();
        assert!(seen.insert_if_new(ids[0]));
        assert!(seen.insert_if_new(ids[1]));
        assert!(seen.insert_if_new(ids[2]));
        // ids[0] was evicted, so it is "new" again.
        assert!(seen.insert_if_new(ids[0]));
    }

    #[test]
    fn eose_fires_once_all_relays_report() {
        let r1 = RelayUrl::parse("wss://r1.example.com").unwrap();
        let r2 = RelayUrl::parse("wss://r2.example.com").unwrap();
        let sub = Subscription::new("s1".into(), vec![Filter::new()], Strategy::RelayOnly, false, vec![r1.clone(), r2.clone()], 100);
        assert!(!sub.maybe_fire_eose(Duration::from_millis(50), Duration::from_secs(5)));
        sub.mark_relay_eose(&r1);
        assert!(!sub.maybe_fire_eose(Duration::from_millis(50), Duration::from_secs(5)));
        sub.mark_relay_eose(&r2);
        assert!(sub.maybe_fire_eose(Duration::from_millis(50), Duration::from_secs(5)));
        assert!(sub.eose_already_fired());
    }

    #[test]
    fn mark_relay_eose_is_reported_once_per_relay() {
        let r1 = RelayUrl::parse("wss://r1.example.com").unwrap();
        let sub = Subscription::new("s1".into(), vec![Filter::new()], Strategy::RelayOnly, false, vec![r1.clone()], 100);
        assert!(sub.mark_relay_eose(&r1));
        assert!(!sub.mark_relay_eose(&r1));
    }

    #[test]
    fn incompatible_filters_with_limit_never_merge() {
        let a = Filter::new().limit(10);
        let b = Filter::new();
        assert!(!filters_compatible(&a, &b));
    }

    #[test]
    fn compatible_filters_merge_kinds_by_union() {
        let a = Filter::new().kinds(vec![1]);
        let b = Filter::new().kinds(vec![2]);
        assert!(filters_compatible(&a, &b));
        let merged = merge_filters(&a, &b);
        assert_eq!(merged.kinds, Some(vec![1, 2]));
    }

    #[test]
    fn mismatched_since_prevents_merge() {
        let a = Filter::new().since(10);
        let b = Filter::new().since(20);
        assert!(!filters_compatible(&a, &b));
    }
}
