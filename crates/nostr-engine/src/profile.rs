//! Profile manager: batched kind-0 ("metadata") fetch with an in-memory/disk
//! TTL cache (spec.md §4.7 C8).
//!
//! Grounded on `prober::scheduler::Scheduler`'s queue-then-drain batching
//! (requests accumulate, then one scan issues work for everything due at
//! once) generalized from "due by elapsed interval" to "due by batch delay or
//! batch size, whichever comes first".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nostr_cache::LayeredCache;
use nostr_core::{Filter, PubKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::warn;

use crate::engine::SubscriptionEngine;
use crate::error::Result;
use crate::subscription::Strategy;

#[derive(Clone, Copy, Debug)]
pub struct ProfileConfig {
    pub ttl: Duration,
    pub batch_delay: Duration,
    pub max_batch: usize,
    pub batch_timeout: Duration,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(3600), batch_delay: Duration::from_millis(200), max_batch: 50, batch_timeout: Duration::from_secs(5) }
    }
}

/// A parsed kind-0 event. Known NIP-01/NIP-05 fields are promoted to named
/// fields; anything else survives in `additional_fields` (spec.md §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Profile {
    pub pubkey: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub banner: Option<String>,
    pub nip05: Option<String>,
    pub lud16: Option<String>,
    pub website: Option<String>,
    pub additional_fields: Map<String, Value>,
    pub updated_at: i64,
}

const KNOWN_FIELDS: &[&str] = &["name", "display_name", "about", "picture", "banner", "nip05", "lud16", "website"];

impl Profile {
    fn from_event(event: &nostr_core::Event) -> Result<Self> {
        let mut value: Value = serde_json::from_str(&event.content).unwrap_or(Value::Object(Map::new()));
        let mut additional_fields = Map::new();
        if let Value::Object(obj) = &mut value {
            for (key, v) in obj.iter() {
                if !KNOWN_FIELDS.contains(&key.as_str()) {
                    additional_fields.insert(key.clone(), v.clone());
                }
            }
        }
        let field = |name: &str| -> Option<String> { value.get(name).and_then(Value::as_str).map(str::to_string) };
        Ok(Self {
            pubkey: event.pubkey.to_hex(),
            name: field("name"),
            display_name: field("display_name"),
            about: field("about"),
            picture: field("picture"),
            banner: field("banner"),
            nip05: field("nip05"),
            lud16: field("lud16"),
            website: field("website"),
            additional_fields,
            updated_at: event.created_at,
        })
    }
}

struct PendingRequest {
    pubkey: PubKey,
    responder: oneshot::Sender<Option<Profile>>,
}

/// Batches `fetchProfile` calls within `batchDelay`/`maxBatch` into one
/// merged kind-0 `REQ` (spec.md §4.7).
pub struct ProfileManager {
    engine: Arc<SubscriptionEngine>,
    cache: Arc<LayeredCache<Profile>>,
    config: ProfileConfig,
    pending: Mutex<Vec<PendingRequest>>,
}

impl ProfileManager {
    pub fn new(engine: Arc<SubscriptionEngine>, cache: Arc<LayeredCache<Profile>>, config: ProfileConfig) -> Arc<Self> {
        Arc::new(Self { engine, cache, config, pending: Mutex::new(Vec::new()) })
    }

    /// Returns the cached profile if fresh, otherwise enqueues a batched
    /// fetch and awaits its result (spec.md §4.7).
    pub async fn fetch_profile(self: &Arc<Self>, pubkey: PubKey, force_refresh: bool) -> Result<Option<Profile>> {
        if !force_refresh {
            if let Some(cached) = self.cache.get(&pubkey.to_hex())? {
                return Ok(Some(cached));
            }
        }

        let (tx, rx) = oneshot::channel();
        let should_flush_now = {
            let mut pending = self.pending.lock();
            pending.push(PendingRequest { pubkey, responder: tx });
            pending.len() >= self.config.max_batch
        };

        if should_flush_now {
            self.flush().await;
        } else {
            let manager = self.clone();
            let delay = self.config.batch_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.flush().await;
            });
        }

        match timeout(self.config.batch_timeout, rx).await {
            Ok(Ok(profile)) => Ok(profile),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                warn!(pubkey = %pubkey, "profile batch timed out");
                Ok(None)
            }
        }
    }

    /// Drain pending requests and issue one merged `REQ`. Idempotent against
    /// concurrent flushes: a flush that finds nothing pending is a no-op, so
    /// both the size-triggered and delay-triggered flush paths are safe to
    /// race.
    async fn flush(self: &Arc<Self>) {
        let batch: Vec<PendingRequest> = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }

        let mut unique_authors: Vec<PubKey> = Vec::new();
        for req in &batch {
            if !unique_authors.contains(&req.pubkey) {
                unique_authors.push(req.pubkey);
            }
        }

        let filter = Filter::new().kinds(vec![0]).authors(unique_authors);
        let events = self.engine.fetch(vec![filter], Strategy::Parallel, None).await.unwrap_or_default();

        let mut by_pubkey: HashMap<PubKey, Profile> = HashMap::new();
        for event in events {
            if event.kind != 0 {
                continue;
            }
            if let Ok(profile) = Profile::from_event(&event) {
                let existing_is_older = by_pubkey.get(&event.pubkey).map(|p| p.updated_at < event.created_at).unwrap_or(true);
                if existing_is_older {
                    by_pubkey.insert(event.pubkey, profile);
                }
            }
        }

        for (pubkey, profile) in &by_pubkey {
            let _ = self.cache.set(&pubkey.to_hex(), profile.clone(), Some(self.config.ttl.as_secs() as i64));
        }

        for req in batch {
            let _ = req.responder.send(by_pubkey.get(&req.pubkey).cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_from_event_preserves_unknown_fields() {
        let signer = nostr_core::Secp256k1Crypto::generate();
        let event = nostr_core::EventBuilder::new(0, r#"{"name":"alice","unknown_field":42}"#).sign(&signer, 1_700_000_000).unwrap();
        let profile = Profile::from_event(&event).unwrap();
        assert_eq!(profile.name.as_deref(), Some("alice"));
        assert_eq!(profile.additional_fields.get("unknown_field"), Some(&Value::from(42)));
    }

    #[test]
    fn profile_from_event_tolerates_non_json_content() {
        let signer = nostr_core::Secp256k1Crypto::generate();
        let event = nostr_core::EventBuilder::new(0, "not json").sign(&signer, 1_700_000_000).unwrap();
        let profile = Profile::from_event(&event).unwrap();
        assert!(profile.name.is_none());
    }
}
