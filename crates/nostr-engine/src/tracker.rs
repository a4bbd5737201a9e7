//! Subscription tracker: per-subscription and per-relay metrics plus a
//! bounded history of closed subscriptions (spec.md §4.8 C9).
//!
//! Grounded on `gossipd::membership::MembershipManager`'s registry-behind-
//! one-lock plus `stats()` aggregation shape (`MembershipStats`), repurposed
//! from peer admission bookkeeping to subscription/relay counters. The
//! bounded ring of closed-subscription snapshots has no membership-manager
//! precedent (members there are never evicted, only banned) and is a plain
//! `VecDeque` truncated to capacity on push, default 100 per spec.md §4.8.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use nostr_net::RelayUrl;
use parking_lot::RwLock;
use serde::Serialize;

use crate::subscription::Subscription;

/// A closed subscription's final bookkeeping, retained for a bounded window
/// after termination (spec.md §4.8 "history").
#[derive(Clone, Debug, Serialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub closed_at: Option<Instant>,
    pub relays: Vec<String>,
    pub unique_events: u64,
    pub relays_with_eose: usize,
}

/// How many active subscriptions target a relay, and how many of those have
/// observed that relay's `EOSE` (spec.md §4.8 "per-relay metrics").
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RelayMetrics {
    pub active_subscriptions: usize,
    pub eose_reported: usize,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct TrackerStats {
    pub active: usize,
    pub history: usize,
    pub total_unique_events: u64,
}

/// Everything `export()` returns: current counters, per-relay metrics, and
/// the closed-subscription ring (spec.md §4.8 "export").
#[derive(Debug, Serialize)]
pub struct TrackerExport {
    pub stats: TrackerStats,
    pub relays: HashMap<String, RelayMetrics>,
    pub history: Vec<SubscriptionSnapshot>,
}

const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Tracks every subscription the engine has opened: active ones by handle,
/// closed ones as bounded snapshots (spec.md §4.8).
pub struct SubscriptionTracker {
    active: RwLock<HashMap<String, Arc<Subscription>>>,
    history: RwLock<VecDeque<SubscriptionSnapshot>>,
    history_capacity: usize,
}

impl Default for SubscriptionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SubscriptionTracker {
    pub fn new(history_capacity: usize) -> Self {
        Self { active: RwLock::new(HashMap::new()), history: RwLock::new(VecDeque::new()), history_capacity: history_capacity.max(1) }
    }

    pub fn track(&self, sub: Arc<Subscription>) {
        self.active.write().insert(sub.id.clone(), sub);
    }

    /// Move `sub_id` out of the active registry and into the bounded
    /// closed-subscription history. A no-op if the subscription is not (or
    /// is no longer) tracked.
    pub fn untrack(&self, sub_id: &str) {
        let Some(sub) = self.active.write().remove(sub_id) else { return };
        let snapshot = SubscriptionSnapshot {
            id: sub.id.clone(),
            created_at: sub.created_at,
            closed_at: sub.closed_at(),
            relays: sub.targeted_relays().iter().map(|r| r.to_string()).collect(),
            unique_events: sub.unique_event_count(),
            relays_with_eose: sub.relays_with_eose(),
        };
        let mut history = self.history.write();
        history.push_back(snapshot);
        while history.len() > self.history_capacity {
            history.pop_front();
        }
    }

    pub fn get(&self, sub_id: &str) -> Option<Arc<Subscription>> {
        self.active.read().get(sub_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn history(&self) -> Vec<SubscriptionSnapshot> {
        self.history.read().iter().cloned().collect()
    }

    /// Per-relay view across every currently active subscription.
    pub fn relay_metrics(&self) -> HashMap<String, RelayMetrics> {
        let mut out: HashMap<String, RelayMetrics> = HashMap::new();
        for sub in self.active.read().values() {
            for relay in sub.targeted_relays() {
                let entry = out.entry(relay.to_string()).or_default();
                entry.active_subscriptions += 1;
                if sub.has_relay_eose(&relay) {
                    entry.eose_reported += 1;
                }
            }
        }
        out
    }

    pub fn stats(&self) -> TrackerStats {
        let active = self.active.read();
        let total_unique_events = active.values().map(|s| s.unique_event_count()).sum();
        TrackerStats { active: active.len(), history: self.history.read().len(), total_unique_events }
    }

    pub fn export(&self) -> TrackerExport {
        TrackerExport { stats: self.stats(), relays: self.relay_metrics(), history: self.history() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Strategy;
    use nostr_core::Filter;

    fn relay(url: &str) -> RelayUrl {
        RelayUrl::parse(url).unwrap()
    }

    #[test]
    fn untrack_moves_subscription_into_bounded_history() {
        let tracker = SubscriptionTracker::new(2);
        let sub = Subscription::new("s1".into(), vec![Filter::new()], Strategy::Parallel, false, vec![relay("wss://r.example.com")], 10);
        tracker.track(sub.clone());
        assert_eq!(tracker.active_count(), 1);

        sub.mark_closed();
        tracker.untrack("s1");
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.history().len(), 1);
        assert_eq!(tracker.history()[0].id, "s1");
    }

    #[test]
    fn history_is_truncated_to_capacity() {
        let tracker = SubscriptionTracker::new(1);
        for i in 0..3 {
            let id = format!("s{i}");
            let sub = Subscription::new(id.clone(), vec![Filter::new()], Strategy::Parallel, false, vec![], 10);
            tracker.track(sub.clone());
            sub.mark_closed();
            tracker.untrack(&id);
        }
        let history = tracker.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "s2");
    }

    #[test]
    fn relay_metrics_counts_active_subscriptions_and_eose() {
        let tracker = SubscriptionTracker::new(10);
        let r1 = relay("wss://r1.example.com");
        let sub = Subscription::new("s1".into(), vec![Filter::new()], Strategy::Parallel, false, vec![r1.clone()], 10);
        tracker.track(sub.clone());

        let metrics = tracker.relay_metrics();
        assert_eq!(metrics.get(r1.as_str()).unwrap().active_subscriptions, 1);
        assert_eq!(metrics.get(r1.as_str()).unwrap().eose_reported, 0);

        sub.mark_relay_eose(&r1);
        let metrics = tracker.relay_metrics();
        assert_eq!(metrics.get(r1.as_str()).unwrap().eose_reported, 1);
    }
}
