//! Per-relay connection: state machine, reconnection with exponential
//! backoff, and per-subscription accounting (spec.md §4.4).
//!
//! Grounded on the teacher's `transport::Connection`/`Transport` split — an
//! `mpsc` outbound channel, a broadcast inbound channel, an open flag behind
//! `parking_lot::RwLock` — generalized from one static QUIC connection to a
//! reconnecting WebSocket one.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::framing::{ClientMessage, RelayMessage};
use crate::peer::{ConnectionState, RelayUrl};
use nostr_core::Filter;

/// Exponential backoff with full jitter (spec.md §4.4, §5 defaults).
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    attempt: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(300), multiplier: 2.0, attempt: 0 }
    }
}

impl ReconnectBackoff {
    /// The delay before the next attempt, with full jitter, then advance the
    /// attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let cap = self.initial.as_secs_f64() * self.multiplier.powi(self.attempt as i32);
        let cap = cap.min(self.max.as_secs_f64());
        self.attempt += 1;
        let jittered = rand::thread_rng().gen_range(0.0..=cap.max(0.0));
        Duration::from_secs_f64(jittered)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The deterministic (unjittered) interval for a given attempt number —
    /// `retryInterval(attempt)` from spec.md §4.6, used to gate whether a
    /// retry is due without mutating any state.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(cap.min(self.max.as_secs_f64()))
    }
}

/// Per-subscription bookkeeping the relay surfaces to the subscription
/// tracker (spec.md §4.4, §4.8).
#[derive(Clone, Debug)]
pub struct SubAccounting {
    pub filters: Vec<Filter>,
    pub events_received: u64,
    pub eose_received: bool,
    pub first_event_at: Option<Instant>,
    pub eose_at: Option<Instant>,
}

impl SubAccounting {
    fn new(filters: Vec<Filter>) -> Self {
        Self { filters, events_received: 0, eose_received: false, first_event_at: None, eose_at: None }
    }
}

/// A single relay connection. Owns its outbound send handle and a broadcast
/// inbound handle (spec.md §5 ownership rules); never auto-connects.
pub struct RelayConnection {
    url: RelayUrl,
    state: RwLock<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ClientMessage>>>,
    inbound_tx: broadcast::Sender<RelayMessage>,
    subs: RwLock<std::collections::HashMap<String, SubAccounting>>,
    backoff: parking_lot::Mutex<ReconnectBackoff>,
    voluntary_disconnect: AtomicBool,
    blacklisted: AtomicBool,
    verified_count: AtomicU32,
    skipped_count: AtomicU32,
}

impl RelayConnection {
    pub fn new(url: RelayUrl) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            url,
            state: RwLock::new(ConnectionState::Disconnected),
            outbound_tx,
            outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
            inbound_tx,
            subs: RwLock::new(std::collections::HashMap::new()),
            backoff: parking_lot::Mutex::new(ReconnectBackoff::default()),
            voluntary_disconnect: AtomicBool::new(false),
            blacklisted: AtomicBool::new(false),
            verified_count: AtomicU32::new(0),
            skipped_count: AtomicU32::new(0),
        })
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted.load(Ordering::SeqCst)
    }

    /// Permanently distrust this relay for the life of the process
    /// (spec.md §4.2 "evil relay"). Monotonic: never cleared.
    pub fn blacklist(&self) {
        self.blacklisted.store(true, Ordering::SeqCst);
    }

    /// A new receiver for this relay's inbound message stream. Messages from
    /// a blacklisted relay are never published here (spec.md §4.2).
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<RelayMessage> {
        self.inbound_tx.subscribe()
    }

    /// Trust counters consumed by `nostr-sampler`'s ratio calculation.
    pub fn record_verification_outcome(&self, verified: bool) {
        if verified {
            self.verified_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.skipped_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn verified_count(&self) -> u32 {
        self.verified_count.load(Ordering::Relaxed)
    }

    pub fn skipped_count(&self) -> u32 {
        self.skipped_count.load(Ordering::Relaxed)
    }

    /// Begin connecting. Spawns the read/write loop with reconnection; the
    /// pool or host must call this explicitly (connections never
    /// auto-initiate, spec.md §4.4).
    pub fn connect(self: &Arc<Self>) {
        if self.is_blacklisted() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.run_loop().await;
        });
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.voluntary_disconnect.load(Ordering::SeqCst) || self.is_blacklisted() {
                *self.state.write() = ConnectionState::Disconnected;
                return;
            }
            *self.state.write() = ConnectionState::Connecting;
            match self.run_once().await {
                Ok(()) => {
                    // Clean read-side close; reconnect unless voluntary.
                }
                Err(e) => {
                    warn!(relay = %self.url, error = %e, "relay connection failed");
                }
            }
            if self.voluntary_disconnect.load(Ordering::SeqCst) {
                *self.state.write() = ConnectionState::Disconnected;
                return;
            }
            *self.state.write() = ConnectionState::Failed;
            let delay = self.backoff.lock().next_delay();
            debug!(relay = %self.url, delay_ms = delay.as_millis(), "reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_once(self: &Arc<Self>) -> Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| NetError::ConnectFailed { relay: self.url.to_string(), reason: e.to_string() })?;
        *self.state.write() = ConnectionState::Connected;
        self.backoff.lock().reset();
        info!(relay = %self.url, "relay connected");

        let (mut sink, mut stream) = ws_stream.split();

        // Re-send every subscription this relay previously held (spec.md §4.4
        // "on successful reconnect all subscriptions ... are re-sent"). Done
        // before `outbound_rx` is taken out of its `Option`, so an error here
        // returns with the receiver still in place for the next reconnect
        // attempt to take.
        let resend: Vec<(String, Vec<Filter>)> = self
            .subs
            .read()
            .iter()
            .map(|(id, acc)| (id.clone(), acc.filters.clone()))
            .collect();
        for (sub_id, filters) in resend {
            let frame = ClientMessage::Req { sub_id, filters }.to_json()?;
            sink.send(WsMessage::Text(frame)).await?;
        }

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .expect("outbound receiver taken exactly once per connection attempt");

        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(msg) => {
                            let frame = msg.to_json()?;
                            if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                                self.outbound_rx.lock().replace(outbound_rx);
                                return Err(NetError::WebSocket(e));
                            }
                        }
                        None => {
                            // Sender side dropped (relay removed from pool); close gracefully.
                            let _ = sink.close().await;
                            self.outbound_rx.lock().replace(outbound_rx);
                            return Ok(());
                        }
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            if self.is_blacklisted() {
                                continue;
                            }
                            match RelayMessage::from_json(&text) {
                                Ok(msg) => {
                                    self.account_inbound(&msg);
                                    let _ = self.inbound_tx.send(msg);
                                }
                                Err(e) => warn!(relay = %self.url, error = %e, "dropping malformed frame"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            self.outbound_rx.lock().replace(outbound_rx);
                            return Ok(());
                        }
                        Some(Ok(_)) => {
                            // Ping/Pong/Binary: ignored, NIP-01 is text-only.
                        }
                        Some(Err(e)) => {
                            self.outbound_rx.lock().replace(outbound_rx);
                            return Err(NetError::WebSocket(e));
                        }
                    }
                }
            }
        }
    }

    fn account_inbound(&self, msg: &RelayMessage) {
        match msg {
            RelayMessage::Event { sub_id, .. } => {
                let mut subs = self.subs.write();
                if let Some(acc) = subs.get_mut(sub_id) {
                    acc.events_received += 1;
                    acc.first_event_at.get_or_insert_with(Instant::now);
                }
            }
            RelayMessage::Eose { sub_id } => {
                let mut subs = self.subs.write();
                if let Some(acc) = subs.get_mut(sub_id) {
                    // Deliver EOSE exactly once per subscription id per
                    // session (spec.md §4.4); duplicates are ignored here by
                    // leaving `eose_received` as-is for the caller to check.
                    if !acc.eose_received {
                        acc.eose_received = true;
                        acc.eose_at = Some(Instant::now());
                    }
                }
            }
            _ => {}
        }
    }

    /// Whether the most recent EOSE for `sub_id` was this relay's first
    /// (i.e. the caller should treat it as novel, not a duplicate to ignore).
    pub fn is_first_eose(&self, sub_id: &str) -> bool {
        self.subs
            .read()
            .get(sub_id)
            .map(|acc| acc.eose_received && acc.eose_at.is_some())
            .unwrap_or(false)
    }

    pub fn sub_accounting(&self, sub_id: &str) -> Option<SubAccounting> {
        self.subs.read().get(sub_id).cloned()
    }

    /// Send a `REQ` and start tracking accounting for `sub_id`.
    pub async fn send_req(&self, sub_id: String, filters: Vec<Filter>) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(NetError::NotConnected(self.url.to_string()));
        }
        self.subs.write().insert(sub_id.clone(), SubAccounting::new(filters.clone()));
        self.outbound_tx
            .send(ClientMessage::Req { sub_id, filters })
            .map_err(|_| NetError::NotConnected(self.url.to_string()))
    }

    /// Send a `CLOSE` and drop this subscription's accounting.
    pub async fn send_close(&self, sub_id: &str) -> Result<()> {
        self.subs.write().remove(sub_id);
        if self.state() != ConnectionState::Connected {
            return Ok(());
        }
        self.outbound_tx
            .send(ClientMessage::Close { sub_id: sub_id.to_string() })
            .map_err(|_| NetError::NotConnected(self.url.to_string()))
    }

    /// Send an `EVENT` (publish).
    pub async fn send_event(&self, event: nostr_core::Event) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(NetError::NotConnected(self.url.to_string()));
        }
        self.outbound_tx
            .send(ClientMessage::Event(event))
            .map_err(|_| NetError::NotConnected(self.url.to_string()))
    }

    /// Voluntary disconnect: tears down all outstanding subscriptions and
    /// never reconnects on its own (spec.md §4.4, §5 graceful-close 2s).
    pub async fn disconnect(&self) {
        self.voluntary_disconnect.store(true, Ordering::SeqCst);
        let sub_ids: Vec<String> = self.subs.read().keys().cloned().collect();
        for sub_id in sub_ids {
            let _ = self.send_close(&sub_id).await;
        }
        *self.state.write() = ConnectionState::Disconnecting;
        tokio::time::timeout(Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_millis(1)).await;
        })
        .await
        .ok();
        *self.state.write() = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max_and_grows() {
        let mut backoff = ReconnectBackoff { initial: Duration::from_secs(1), max: Duration::from_secs(10), multiplier: 2.0, attempt: 0 };
        for _ in 0..10 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_secs(10));
        }
    }

    #[test]
    fn backoff_reset_restarts_schedule() {
        let mut backoff = ReconnectBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt, 2);
        backoff.reset();
        assert_eq!(backoff.attempt, 0);
    }

    #[tokio::test]
    async fn new_connection_starts_disconnected_and_not_blacklisted() {
        let url = RelayUrl::parse("wss://relay.example.com").unwrap();
        let conn = RelayConnection::new(url);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_blacklisted());
    }

    #[test]
    fn blacklist_is_monotonic() {
        let url = RelayUrl::parse("wss://relay.example.com").unwrap();
        let conn = RelayConnection::new(url);
        conn.blacklist();
        assert!(conn.is_blacklisted());
        // No API exists to clear it; calling blacklist again is a no-op.
        conn.blacklist();
        assert!(conn.is_blacklisted());
    }

    #[test]
    fn eose_tracked_once_per_subscription() {
        let url = RelayUrl::parse("wss://relay.example.com").unwrap();
        let conn = RelayConnection::new(url);
        conn.subs.write().insert("s1".into(), SubAccounting::new(vec![]));
        conn.account_inbound(&RelayMessage::Eose { sub_id: "s1".into() });
        assert!(conn.sub_accounting("s1").unwrap().eose_received);
        let first_ts = conn.sub_accounting("s1").unwrap().eose_at;
        conn.account_inbound(&RelayMessage::Eose { sub_id: "s1".into() });
        assert_eq!(conn.sub_accounting("s1").unwrap().eose_at, first_ts);
    }
}
