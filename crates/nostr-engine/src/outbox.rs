//! Publish outbox: per-relay delivery tracking, `OK`-ack status mapping,
//! aggregate status, and retry (spec.md §4.6 C7).
//!
//! Grounded on `routerd::router::Router`'s report_success/report_failure
//! per-destination bookkeeping (generalized here from "one next-hop" to "one
//! relay per outbox record") and on `prober::scheduler::Scheduler`'s
//! due-scan-and-reschedule loop for the retry task, reusing
//! `nostr_net::ReconnectBackoff` for the backoff curve itself (spec.md §4.6:
//! "the same exponential-backoff policy as relay reconnection").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nostr_cache::LayeredCache;
use nostr_core::{Crypto, Event, EventId};
use nostr_net::{PublishFailureReason, RelayPool, RelayUrl, ReconnectBackoff};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Iteration budget for NIP-13 nonce mining (spec.md §4.6, SPEC_FULL §4.6:
/// "bounded by a max-iterations guard so it cannot spin forever").
const MAX_POW_ITERATIONS: u64 = 2_000_000;

/// Why a publish attempt on one relay failed (spec.md §4.6 "Status mapping").
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailReason {
    Relay(String),
    Timeout,
    ConnectionLost,
}

impl From<PublishFailureReason> for FailReason {
    fn from(r: PublishFailureReason) -> Self {
        let s = match r {
            PublishFailureReason::Pow => "pow",
            PublishFailureReason::Duplicate => "duplicate",
            PublishFailureReason::Blocked => "blocked",
            PublishFailureReason::RateLimited => "rate-limited",
            PublishFailureReason::Invalid => "invalid",
            PublishFailureReason::AuthRequired => "auth-required",
            PublishFailureReason::Restricted => "restricted",
            PublishFailureReason::Error => "error",
        };
        FailReason::Relay(s.to_string())
    }
}

/// Per-relay publish status for one `OutboxRecord` (spec.md §4.6).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayPublishStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed(FailReason),
    RateLimited,
    Retrying(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateStatus {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Clone, Debug)]
pub struct PublishConfig {
    pub min_successful_relays: usize,
    pub max_retries: u32,
    pub pow_difficulty: Option<u8>,
    pub ack_timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self { min_successful_relays: 1, max_retries: 5, pow_difficulty: None, ack_timeout: Duration::from_secs(10) }
    }
}

/// A persisted publish attempt: the event, its target relays, and each
/// relay's status (spec.md §4.6 "OutboxRecord").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event: Event,
    pub targets: Vec<String>,
    pub status: HashMap<String, RelayPublishStatus>,
    pub created_at: i64,
    pub last_attempt_at: i64,
    pub min_successful_relays: usize,
    pub max_retries: u32,
    pub attempt: u32,
}

impl OutboxRecord {
    pub fn aggregate(&self) -> AggregateStatus {
        let succeeded = self.status.values().filter(|s| **s == RelayPublishStatus::Succeeded).count();
        if succeeded >= self.min_successful_relays {
            return AggregateStatus::Succeeded;
        }
        let pending = self.status.values().any(|s| matches!(s, RelayPublishStatus::Pending | RelayPublishStatus::InProgress | RelayPublishStatus::Retrying(_)));
        if pending {
            AggregateStatus::InProgress
        } else {
            AggregateStatus::Failed
        }
    }
}

/// Per-relay publish tracking with `OK`-ack status mapping and retry
/// (spec.md §4.6). Owns no relay connections; drives the pool it is given.
pub struct PublishOutbox {
    pool: Arc<RelayPool>,
    cache: Arc<LayeredCache<OutboxRecord>>,
    backoffs: RwLock<HashMap<String, ReconnectBackoff>>,
    shutdown_tx: broadcast::Sender<()>,
    crypto: RwLock<Option<Arc<dyn Crypto>>>,
}

impl PublishOutbox {
    pub fn new(pool: Arc<RelayPool>, cache: Arc<LayeredCache<OutboxRecord>>) -> Arc<Self> {
        Self::with_crypto(pool, cache, None)
    }

    /// Construct an outbox with a signing capability available to re-sign
    /// events after proof-of-work mining rewrites their `nonce` tag and id
    /// (spec.md §4.6 "Retry": "PoW requests may ... mine a nonce tag to the
    /// requested difficulty before resending"). `crypto` may be `None` if
    /// the host never configures `pow_difficulty`.
    pub fn with_crypto(pool: Arc<RelayPool>, cache: Arc<LayeredCache<OutboxRecord>>, crypto: Option<Arc<dyn Crypto>>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let outbox = Arc::new(Self { pool, cache, backoffs: RwLock::new(HashMap::new()), shutdown_tx, crypto: RwLock::new(crypto) });
        outbox.clone().spawn_retry_task();
        outbox
    }

    /// Set or clear the signing capability used for PoW re-signing, mirroring
    /// `Ndk::set_signer`'s swap-in-place shape.
    pub fn set_crypto(&self, crypto: Option<Arc<dyn Crypto>>) {
        *self.crypto.write() = crypto;
    }

    /// Mine a `nonce` tag to `difficulty` leading zero bits and re-sign the
    /// event under it, since changing any tag invalidates the original id
    /// and signature (spec.md §3 "sig verifies against pubkey over id").
    fn mine_and_resign(&self, event: Event, difficulty: u8) -> Result<Event> {
        let crypto = self.crypto.read().clone().ok_or(EngineError::NoPowCrypto)?;
        let (tags, digest) = nostr_core::mine_nonce_tag(
            &event.pubkey,
            event.created_at,
            event.kind,
            event.tags,
            &event.content,
            difficulty,
            MAX_POW_ITERATIONS,
        )
        .ok_or(EngineError::PowNotFound)?;
        let sig = crypto.sign(&digest)?;
        Ok(Event { id: EventId(digest), tags, sig, ..event })
    }

    /// Publish `event` to `targets` (default: the pool's connected relays),
    /// waiting up to `config.ack_timeout` per relay for an `OK` (spec.md
    /// §4.6 "Operation").
    pub async fn publish(&self, event: Event, targets: Option<Vec<RelayUrl>>, config: PublishConfig) -> Result<OutboxRecord> {
        let event = match config.pow_difficulty {
            Some(difficulty) => self.mine_and_resign(event, difficulty)?,
            None => event,
        };
        let targets = targets.unwrap_or_else(|| self.pool.connected_relays());
        let now = nostr_cache::now_unix();
        let mut status: HashMap<String, RelayPublishStatus> = targets.iter().map(|r| (r.to_string(), RelayPublishStatus::Pending)).collect();

        for relay in &targets {
            status.insert(relay.to_string(), RelayPublishStatus::InProgress);
        }
        let mut record = OutboxRecord {
            event: event.clone(),
            targets: targets.iter().map(|r| r.to_string()).collect(),
            status,
            created_at: now,
            last_attempt_at: now,
            min_successful_relays: config.min_successful_relays,
            max_retries: config.max_retries,
            attempt: 0,
        };
        self.persist(&record)?;

        self.send_and_await(&mut record, &targets, config.ack_timeout).await;
        self.persist(&record)?;
        Ok(record)
    }

    async fn send_and_await(&self, record: &mut OutboxRecord, targets: &[RelayUrl], ack_timeout: Duration) {
        let send_results = self.pool.publish(&record.event, targets).await;
        let event_id = record.event.id.to_hex();

        let mut awaiting = Vec::new();
        for (relay, outcome) in send_results {
            match outcome {
                Ok(()) => awaiting.push(relay),
                Err(_) => {
                    record.status.insert(relay.to_string(), RelayPublishStatus::Failed(FailReason::ConnectionLost));
                }
            }
        }

        let mut inbound = self.pool.subscribe();
        let deadline = tokio::time::Instant::now() + ack_timeout;
        let mut still_waiting: std::collections::HashSet<String> = awaiting.iter().map(|r| r.to_string()).collect();

        while !still_waiting.is_empty() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let received = tokio::time::timeout(remaining, inbound.recv()).await;
            match received {
                Ok(Ok(pooled)) => {
                    if let nostr_net::RelayMessage::Ok { event_id: acked_id, accepted, message } = pooled.message {
                        if acked_id == event_id && still_waiting.remove(pooled.relay.to_string().as_str()) {
                            let status = if accepted {
                                RelayPublishStatus::Succeeded
                            } else {
                                let reason = PublishFailureReason::from_message(&message);
                                if reason == PublishFailureReason::RateLimited {
                                    RelayPublishStatus::RateLimited
                                } else {
                                    RelayPublishStatus::Failed(reason.into())
                                }
                            };
                            record.status.insert(pooled.relay.to_string(), status);
                        }
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }

        for relay in still_waiting {
            record.status.insert(relay, RelayPublishStatus::Failed(FailReason::Timeout));
        }
        record.last_attempt_at = nostr_cache::now_unix();
    }

    fn persist(&self, record: &OutboxRecord) -> Result<()> {
        self.cache.set(&record.event.id.to_hex(), record.clone(), None)?;
        Ok(())
    }

    pub fn get(&self, event_id: &str) -> Result<Option<OutboxRecord>> {
        Ok(self.cache.get(event_id)?)
    }

    /// A background scan-and-retry loop, grounded on
    /// `Scheduler::schedule_due_probes`'s "scan registered items, retry those
    /// past their due time" shape.
    fn spawn_retry_task(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.retry_due().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Scan every persisted record and retry those still owed an attempt
    /// (spec.md §4.6: "a background task scans records for which now minus
    /// lastAttempt is at least retryInterval(attempt) and attempt is at most
    /// maxRetries"). `retry_record` itself no-ops records that have nothing
    /// retriable or haven't yet reached their backoff interval, so a full
    /// scan every tick is cheap and correct.
    async fn retry_due(&self) {
        let records = match self.cache.all() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "failed to enumerate outbox records for retry scan");
                return;
            }
        };
        for record in records {
            if record.aggregate() == AggregateStatus::Succeeded {
                continue;
            }
            if let Err(e) = self.retry_record(record).await {
                warn!(error = %e, "outbox retry attempt failed");
            }
        }
    }

    /// Enumerate persisted records and resume retries for any still owed an
    /// attempt. Exposed for the host facade to call once at startup (spec.md
    /// §4.6: "Outbox records survive process restart via the disk cache; on
    /// startup the engine enumerates them and resumes retries"); the
    /// background retry task performs the same scan periodically thereafter.
    pub async fn resume_pending(&self) {
        self.retry_due().await;
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Retry one record against its still-failed-or-retrying relays
    /// (spec.md §4.6 "Retry"). Exposed for the startup resume pass and for
    /// the background scan to call once records are enumerable.
    pub async fn retry_record(&self, mut record: OutboxRecord) -> Result<OutboxRecord> {
        if record.attempt >= record.max_retries {
            return Ok(record);
        }
        let due: Vec<RelayUrl> = record
            .status
            .iter()
            .filter(|(_, s)| matches!(s, RelayPublishStatus::Failed(FailReason::Timeout) | RelayPublishStatus::Failed(FailReason::ConnectionLost) | RelayPublishStatus::RateLimited))
            .filter_map(|(relay, _)| RelayUrl::parse(relay).ok())
            .collect();
        if due.is_empty() {
            return Ok(record);
        }

        let backoff_key = record.event.id.to_hex();
        let interval = self.backoffs.read().get(&backoff_key).cloned().unwrap_or_default().delay_for(record.attempt);
        let now = nostr_cache::now_unix();
        if now - record.last_attempt_at < interval.as_secs() as i64 {
            return Ok(record);
        }

        let delay = self.backoffs.write().entry(backoff_key).or_default().next_delay();
        info!(event_id = %record.event.id, attempt = record.attempt, delay_secs = delay.as_secs_f64(), "retrying publish");
        for relay in &due {
            record.status.insert(relay.to_string(), RelayPublishStatus::Retrying(record.attempt + 1));
        }
        record.attempt += 1;

        self.send_and_await(&mut record, &due, Duration::from_secs(10)).await;
        self.persist(&record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        use nostr_core::{EventBuilder, Secp256k1Crypto};
        let signer = Secp256k1Crypto::generate();
        EventBuilder::new(1, "hi").sign(&signer, 1_700_000_000).unwrap()
    }

    fn cache() -> (tempfile::TempDir, Arc<LayeredCache<OutboxRecord>>) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(nostr_cache::DiskCache::open(dir.path(), 1_000_000).unwrap());
        let cache = Arc::new(LayeredCache::new(nostr_cache::CacheKind::Outbox, 64, disk, None));
        (dir, cache)
    }

    #[test]
    fn aggregate_succeeds_once_threshold_met() {
        let event = sample_event();
        let mut status = HashMap::new();
        status.insert("wss://a/".to_string(), RelayPublishStatus::Succeeded);
        status.insert("wss://b/".to_string(), RelayPublishStatus::Failed(FailReason::Timeout));
        let record = OutboxRecord {
            event,
            targets: vec!["wss://a/".into(), "wss://b/".into()],
            status,
            created_at: 0,
            last_attempt_at: 0,
            min_successful_relays: 1,
            max_retries: 5,
            attempt: 0,
        };
        assert_eq!(record.aggregate(), AggregateStatus::Succeeded);
    }

    #[test]
    fn aggregate_fails_when_threshold_unmet_and_nothing_pending() {
        let event = sample_event();
        let mut status = HashMap::new();
        status.insert("wss://a/".to_string(), RelayPublishStatus::Succeeded);
        status.insert("wss://b/".to_string(), RelayPublishStatus::Failed(FailReason::Timeout));
        let record = OutboxRecord {
            event,
            targets: vec!["wss://a/".into(), "wss://b/".into()],
            status,
            created_at: 0,
            last_attempt_at: 0,
            min_successful_relays: 2,
            max_retries: 5,
            attempt: 0,
        };
        assert_eq!(record.aggregate(), AggregateStatus::Failed);
    }

    #[test]
    fn aggregate_in_progress_while_any_relay_pending() {
        let event = sample_event();
        let mut status = HashMap::new();
        status.insert("wss://a/".to_string(), RelayPublishStatus::InProgress);
        let record = OutboxRecord {
            event,
            targets: vec!["wss://a/".into()],
            status,
            created_at: 0,
            last_attempt_at: 0,
            min_successful_relays: 1,
            max_retries: 5,
            attempt: 0,
        };
        assert_eq!(record.aggregate(), AggregateStatus::InProgress);
    }

    #[tokio::test]
    async fn publish_with_no_targets_yields_empty_record() {
        let pool = Arc::new(RelayPool::new());
        let (_dir, cache) = cache();
        let outbox = PublishOutbox::new(pool, cache);
        let record = outbox.publish(sample_event(), Some(vec![]), PublishConfig::default()).await.unwrap();
        assert!(record.status.is_empty());
        assert_eq!(record.aggregate(), AggregateStatus::Failed);
    }

    #[tokio::test]
    async fn publish_with_pow_difficulty_mines_and_resigns() {
        use nostr_core::Secp256k1Crypto;
        let pool = Arc::new(RelayPool::new());
        let (_dir, cache) = cache();
        let crypto: Arc<dyn Crypto> = Arc::new(Secp256k1Crypto::generate());
        let outbox = PublishOutbox::with_crypto(pool, cache, Some(crypto));
        let config = PublishConfig { pow_difficulty: Some(8), ..PublishConfig::default() };
        let record = outbox.publish(sample_event(), Some(vec![]), config).await.unwrap();
        let mined_id = record.event.id.0;
        assert!(nostr_core::leading_zero_bits(&mined_id) >= 8);
        nostr_core::validate_event(&record.event).unwrap();
    }

    #[tokio::test]
    async fn publish_with_pow_difficulty_and_no_crypto_errors() {
        let pool = Arc::new(RelayPool::new());
        let (_dir, cache) = cache();
        let outbox = PublishOutbox::new(pool, cache);
        let config = PublishConfig { pow_difficulty: Some(8), ..PublishConfig::default() };
        let result = outbox.publish(sample_event(), Some(vec![]), config).await;
        assert!(matches!(result, Err(EngineError::NoPowCrypto)));
    }

    #[tokio::test]
    async fn retry_record_is_a_no_op_before_its_backoff_interval_elapses() {
        let pool = Arc::new(RelayPool::new());
        let (_dir, cache) = cache();
        let outbox = PublishOutbox::new(pool, cache);
        let event = sample_event();
        let mut status = HashMap::new();
        status.insert("wss://a/".to_string(), RelayPublishStatus::Failed(FailReason::Timeout));
        let record = OutboxRecord {
            event,
            targets: vec!["wss://a/".into()],
            status,
            created_at: nostr_cache::now_unix(),
            last_attempt_at: nostr_cache::now_unix(),
            min_successful_relays: 1,
            max_retries: 5,
            attempt: 0,
        };
        let retried = outbox.retry_record(record.clone()).await.unwrap();
        // Attempt 0's backoff interval is at least `initial` (1s, default),
        // so a retry attempted immediately after `last_attempt_at` must not
        // have advanced the attempt counter or touched relay status.
        assert_eq!(retried.attempt, 0);
        assert_eq!(retried.status, record.status);
    }
}
