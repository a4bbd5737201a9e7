//! `Ndk`: the host facade wiring every component into one entry point
//! (spec.md §4.8 C10, §6 "Host configuration").
//!
//! Grounded on `gossipd::server::Server`: a top-level struct constructed
//! from a `Config`, owning every dependent component behind its own lock,
//! spawning background tasks under one `broadcast::Sender<()>` shutdown
//! signal (`spawn_sync_task`/`spawn_prune_task` there; here the pool's
//! relay-connection loops, the engine's debounce task, and the outbox's
//! retry task, each already self-contained). Unlike `Server::new`, which
//! builds its dependents eagerly and in sequence, `Ndk::new` follows the
//! same sequencing but is async because opening the disk cache and
//! replaying the outbox happen here rather than lazily on first use.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nostr_cache::{CacheKind, DiskCache, LayeredCache};
use nostr_core::{Crypto, Event, Filter, Tag};
use nostr_net::{RelayPool, RelayUrl};
use nostr_sampler::{Sampler, SamplerConfig};
use parking_lot::RwLock;

use crate::engine::{EngineConfig, SubscriptionEngine};
use crate::error::{EngineError, Result};
use crate::outbox::{OutboxRecord, PublishConfig, PublishOutbox};
use crate::profile::{Profile, ProfileConfig, ProfileManager};
use crate::signer::Signer;
use crate::subscription::{Strategy, Subscription};
use crate::tracker::{SubscriptionTracker, TrackerExport};

/// Everything `Ndk::new` needs to construct its dependents (spec.md §6 "Host
/// configuration"): relay seeds, cache location/sizing, and the tuning knobs
/// each lower component already exposes a `Config` for.
#[derive(Clone, Debug)]
pub struct NdkConfig {
    pub relays: Vec<String>,
    pub disk_cache_path: PathBuf,
    pub disk_cache_max_bytes: u64,
    pub memory_cache_capacity: usize,
    pub sampler_config: SamplerConfig,
    pub engine_config: EngineConfig,
    pub publish_config: PublishConfig,
    pub profile_config: ProfileConfig,
    pub tracker_history_capacity: usize,
}

impl Default for NdkConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            disk_cache_path: PathBuf::from("./ndk-cache"),
            disk_cache_max_bytes: 256 * 1024 * 1024,
            memory_cache_capacity: 4096,
            sampler_config: SamplerConfig::default(),
            engine_config: EngineConfig::default(),
            publish_config: PublishConfig::default(),
            profile_config: ProfileConfig::default(),
            tracker_history_capacity: 100,
        }
    }
}

/// The single entry point a consumer constructs: owns the pool, sampler,
/// cache, engine, outbox, profile manager, tracker, and an optional signer
/// (spec.md §6, no globals — every dependency is passed in or owned here).
pub struct Ndk {
    pool: Arc<RelayPool>,
    sampler: Arc<Sampler>,
    events_cache: Arc<LayeredCache<Event>>,
    engine: Arc<SubscriptionEngine>,
    outbox: Arc<PublishOutbox>,
    profiles: Arc<ProfileManager>,
    tracker: Arc<SubscriptionTracker>,
    signer: RwLock<Option<Arc<dyn Signer>>>,
    publish_config: PublishConfig,
    eose_cap: Duration,
}

impl Ndk {
    /// Construct every component, connect the seeded relays, and resume any
    /// outbox records left pending from a prior process (spec.md §4.6:
    /// "on startup the engine enumerates them and resumes retries").
    /// `pow_crypto` is the signing capability the outbox re-signs under after
    /// mining a PoW nonce tag (spec.md §4.6 "Retry"); it is independent of
    /// `signer` because a NIP-46 `RemoteSigner` holds no local key to mine
    /// against without a round trip, so hosts using one simply pass `None`
    /// and leave `pow_difficulty` unset in their `PublishConfig`.
    pub async fn new(config: NdkConfig, signer: Option<Arc<dyn Signer>>, pow_crypto: Option<Arc<dyn Crypto>>) -> Result<Arc<Self>> {
        let pool = Arc::new(RelayPool::new());
        for raw in &config.relays {
            let url = RelayUrl::parse(raw)?;
            pool.add_relay(url);
        }
        pool.connect_all();

        let sampler = Arc::new(Sampler::new(config.sampler_config));
        let disk = Arc::new(DiskCache::open(&config.disk_cache_path, config.disk_cache_max_bytes)?);

        let events_cache = Arc::new(LayeredCache::new(CacheKind::Event, config.memory_cache_capacity, disk.clone(), None));
        let outbox_cache = Arc::new(LayeredCache::new(CacheKind::Outbox, config.memory_cache_capacity, disk.clone(), None));
        let profile_ttl = config.profile_config.ttl.as_secs() as i64;
        let profile_cache = Arc::new(LayeredCache::new(CacheKind::Profile, config.memory_cache_capacity, disk, Some(profile_ttl)));

        let eose_cap = config.engine_config.eose_cap;
        let engine = SubscriptionEngine::new(pool.clone(), sampler.clone(), events_cache.clone(), config.engine_config);
        let outbox = PublishOutbox::with_crypto(pool.clone(), outbox_cache, pow_crypto);
        let profiles = ProfileManager::new(engine.clone(), profile_cache, config.profile_config);
        let tracker = Arc::new(SubscriptionTracker::new(config.tracker_history_capacity));

        outbox.resume_pending().await;

        Ok(Arc::new(Self {
            pool,
            sampler,
            events_cache,
            engine,
            outbox,
            profiles,
            tracker,
            signer: RwLock::new(signer),
            publish_config: config.publish_config,
            eose_cap,
        }))
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }

    pub fn events_cache(&self) -> &Arc<LayeredCache<Event>> {
        &self.events_cache
    }

    pub fn tracker(&self) -> &Arc<SubscriptionTracker> {
        &self.tracker
    }

    pub fn export_tracker(&self) -> TrackerExport {
        self.tracker.export()
    }

    pub fn set_signer(&self, signer: Option<Arc<dyn Signer>>) {
        *self.signer.write() = signer;
    }

    /// Swap the signing capability the outbox uses to re-sign PoW-mined
    /// events.
    pub fn set_pow_crypto(&self, crypto: Option<Arc<dyn Crypto>>) {
        self.outbox.set_crypto(crypto);
    }

    /// Open a subscription, registering it with both the engine and the
    /// tracker (spec.md §4.5, §4.8).
    pub async fn subscribe(&self, filters: Vec<Filter>, strategy: Strategy, close_on_eose: bool, relays: Option<Vec<RelayUrl>>) -> Result<Arc<Subscription>> {
        let sub = self.engine.subscribe(filters, strategy, close_on_eose, relays).await?;
        self.tracker.track(sub.clone());
        Ok(sub)
    }

    /// One-shot fetch accumulated to `EOSE`, with tracker bookkeeping for the
    /// transient subscription it opens under the hood.
    pub async fn fetch(&self, filters: Vec<Filter>, strategy: Strategy, relays: Option<Vec<RelayUrl>>) -> Result<Vec<Event>> {
        let sub = self.subscribe(filters, strategy, true, relays).await?;
        let mut eose_rx = sub.subscribe_eose();
        let _ = tokio::time::timeout(self.eose_cap + Duration::from_secs(1), eose_rx.recv()).await;
        let events = sub.buffered();
        self.close(&sub.id).await;
        Ok(events)
    }

    pub async fn close(&self, sub_id: &str) {
        self.engine.close(sub_id).await;
        self.tracker.untrack(sub_id);
    }

    pub async fn publish(&self, event: Event, targets: Option<Vec<RelayUrl>>) -> Result<OutboxRecord> {
        self.outbox.publish(event, targets, self.publish_config.clone()).await
    }

    /// Sign `(kind, content, tags)` with the configured signer, then publish
    /// it (spec.md §4.6 "Operation" combined with §6 "Host configuration").
    pub async fn sign_and_publish(&self, kind: u32, content: String, tags: Vec<Tag>, targets: Option<Vec<RelayUrl>>) -> Result<OutboxRecord> {
        let signer = self.signer.read().clone().ok_or(EngineError::NoSigner)?;
        let event = signer.sign_event(kind, content, tags).await?;
        self.publish(event, targets).await
    }

    pub async fn fetch_profile(&self, pubkey: nostr_core::PubKey, force_refresh: bool) -> Result<Option<Profile>> {
        self.profiles.fetch_profile(pubkey, force_refresh).await
    }

    /// Tear down every background task and relay connection (spec.md §6).
    pub async fn shutdown(&self) {
        self.engine.shutdown();
        self.outbox.shutdown();
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_resumes_with_no_pending_outbox_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = NdkConfig { disk_cache_path: dir.path().to_path_buf(), ..NdkConfig::default() };
        let ndk = Ndk::new(config, None, None).await.unwrap();
        assert_eq!(ndk.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn sign_and_publish_without_signer_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = NdkConfig { disk_cache_path: dir.path().to_path_buf(), ..NdkConfig::default() };
        let ndk = Ndk::new(config, None, None).await.unwrap();
        let result = ndk.sign_and_publish(1, "hi".to_string(), vec![], None).await;
        assert!(matches!(result, Err(EngineError::NoSigner)));
    }

    #[tokio::test]
    async fn cache_only_fetch_returns_empty_without_relays() {
        let dir = tempfile::tempdir().unwrap();
        let config = NdkConfig { disk_cache_path: dir.path().to_path_buf(), ..NdkConfig::default() };
        let ndk = Ndk::new(config, None, None).await.unwrap();
        let events = ndk.fetch(vec![Filter::new()], Strategy::CacheOnly, None).await.unwrap();
        assert!(events.is_empty());
    }
}
