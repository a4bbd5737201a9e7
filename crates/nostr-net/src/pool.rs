//! Relay pool: registry of relay connections, fan-out sends, and a merged
//! inbound stream (spec.md §4.4 C5). Grounded on `Transport`'s
//! `RwLock<HashMap<PeerId, Arc<Connection>>>` registry, generalized from one
//! connection kind to NIP-01 relays, and on `gossipd::server::Server`'s
//! `peers` registry for the add/remove/list shape.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{NetError, Result};
use crate::framing::RelayMessage;
use crate::peer::RelayUrl;
use crate::relay::RelayConnection;
use nostr_core::{Event, Filter};

/// An inbound message tagged with the relay it arrived from.
#[derive(Clone, Debug)]
pub struct PooledMessage {
    pub relay: RelayUrl,
    pub message: RelayMessage,
}

/// Registry of relay connections. Exclusively owned by the host facade
/// (spec.md §5 ownership rules): the pool exclusively owns each connection.
pub struct RelayPool {
    relays: RwLock<HashMap<RelayUrl, Arc<RelayConnection>>>,
    fanin_tx: broadcast::Sender<PooledMessage>,
}

impl Default for RelayPool {
    fn default() -> Self {
        let (fanin_tx, _) = broadcast::channel(4096);
        Self { relays: RwLock::new(HashMap::new()), fanin_tx }
    }
}

impl RelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relay and begin forwarding its inbound messages into the
    /// pool's merged stream. Does not connect it.
    pub fn add_relay(&self, url: RelayUrl) -> Arc<RelayConnection> {
        if let Some(existing) = self.relays.read().get(&url) {
            return existing.clone();
        }
        let conn = RelayConnection::new(url.clone());
        self.spawn_fanin(&conn);
        self.relays.write().insert(url, conn.clone());
        conn
    }

    fn spawn_fanin(&self, conn: &Arc<RelayConnection>) {
        let url = conn.url().clone();
        let mut inbound = conn.subscribe_inbound();
        let fanin_tx = self.fanin_tx.clone();
        tokio::spawn(async move {
            while let Ok(message) = inbound.recv().await {
                let _ = fanin_tx.send(PooledMessage { relay: url.clone(), message });
            }
        });
    }

    /// Remove a relay from the pool, disconnecting it first.
    pub async fn remove_relay(&self, url: &RelayUrl) {
        let conn = self.relays.write().remove(url);
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
    }

    pub fn get(&self, url: &RelayUrl) -> Option<Arc<RelayConnection>> {
        self.relays.read().get(url).cloned()
    }

    pub fn relay_urls(&self) -> Vec<RelayUrl> {
        self.relays.read().keys().cloned().collect()
    }

    /// The subset of relays currently connected (used as the outbox's
    /// default publish target, spec.md §4.6).
    pub fn connected_relays(&self) -> Vec<RelayUrl> {
        self.relays
            .read()
            .iter()
            .filter(|(_, c)| c.state() == crate::peer::ConnectionState::Connected)
            .map(|(u, _)| u.clone())
            .collect()
    }

    /// Connect every registered relay that isn't already connecting/connected.
    pub fn connect_all(&self) {
        for conn in self.relays.read().values() {
            if conn.state() == crate::peer::ConnectionState::Disconnected {
                conn.connect();
            }
        }
    }

    /// A fresh receiver for the pool's merged inbound stream (fan-in).
    pub fn subscribe(&self) -> broadcast::Receiver<PooledMessage> {
        self.fanin_tx.subscribe()
    }

    /// Send `REQ` for `sub_id`/`filters` to each of `targets` (fan-out).
    /// Errors from individual relays are collected, not short-circuited —
    /// per spec.md §7 a multi-relay operation's partial failures are not
    /// surfaced when other relays succeed.
    pub async fn req(&self, sub_id: &str, filters: &[Filter], targets: &[RelayUrl]) -> Vec<(RelayUrl, Result<()>)> {
        let mut results = Vec::with_capacity(targets.len());
        for url in targets {
            let outcome = match self.get(url) {
                Some(conn) => conn.send_req(sub_id.to_string(), filters.to_vec()).await,
                None => Err(NetError::RelayNotFound(url.to_string())),
            };
            results.push((url.clone(), outcome));
        }
        results
    }

    /// Send `CLOSE` for `sub_id` to each of `targets`.
    pub async fn close(&self, sub_id: &str, targets: &[RelayUrl]) {
        for url in targets {
            if let Some(conn) = self.get(url) {
                let _ = conn.send_close(sub_id).await;
            }
        }
    }

    /// Broadcast (or fan-out to a specific target set) an `EVENT` publish.
    pub async fn publish(&self, event: &Event, targets: &[RelayUrl]) -> Vec<(RelayUrl, Result<()>)> {
        let mut results = Vec::with_capacity(targets.len());
        for url in targets {
            let outcome = match self.get(url) {
                Some(conn) => conn.send_event(event.clone()).await,
                None => Err(NetError::RelayNotFound(url.to_string())),
            };
            results.push((url.clone(), outcome));
        }
        results
    }

    /// Disconnect and drop every relay (graceful shutdown).
    pub async fn shutdown(&self) {
        let urls: Vec<RelayUrl> = self.relay_urls();
        for url in urls {
            self.remove_relay(&url).await;
        }
        info!("relay pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_relay_is_idempotent_by_url() {
        let pool = RelayPool::new();
        let url = RelayUrl::parse("wss://relay.example.com").unwrap();
        let a = pool.add_relay(url.clone());
        let b = pool.add_relay(url.clone());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.relay_urls().len(), 1);
    }

    #[tokio::test]
    async fn connected_relays_excludes_disconnected() {
        let pool = RelayPool::new();
        let url = RelayUrl::parse("wss://relay.example.com").unwrap();
        pool.add_relay(url);
        assert!(pool.connected_relays().is_empty());
    }

    #[tokio::test]
    async fn req_against_unknown_relay_reports_error_without_panicking() {
        let pool = RelayPool::new();
        let missing = RelayUrl::parse("wss://missing.example.com").unwrap();
        let results = pool.req("sub1", &[Filter::new()], &[missing]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_err());
    }
}
