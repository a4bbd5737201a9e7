//! Signing capability: a local in-process signer and a NIP-46 "remote
//! signer" that proxies the same operations over an encrypted relay channel
//! (spec.md §6 "Host configuration", §1 "pure crypto capability").
//!
//! `RemoteSigner`'s request/response correlation is grounded on
//! `infernode::circuit::CircuitManager` (a `[u8; 16]`-keyed registry behind
//! one lock, `create_circuit`/timeout-based expiry) generalized from
//! "circuit id" to "NIP-46 request id" and from a fixed per-manager timeout
//! to a per-request `oneshot` awaited with a deadline. Payload encryption is
//! grounded on `infernode::onion`'s encrypt/decrypt-envelope shape, but the
//! envelope itself is delegated to an injected [`PayloadCodec`] rather than
//! reimplemented here: NIP-44/NIP-04 remain external collaborators (spec.md
//! §1, §6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_core::{Crypto, Event, EventBuilder, PubKey, Tag};
use nostr_net::RelayUrl;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, oneshot};

use crate::engine::SubscriptionEngine;
use crate::error::{EngineError, Result};
use crate::outbox::{PublishConfig, PublishOutbox};
use crate::subscription::Strategy;

/// NIP-04/NIP-44 payload codec: an external collaborator injected into a
/// signer. An implementation performs the ECDH key agreement and the actual
/// encrypt/decrypt; this crate only defines the seam it is consumed through
/// (spec.md §6).
pub trait PayloadCodec: Send + Sync {
    fn encrypt(&self, peer: &PubKey, plaintext: &str) -> Result<String>;
    fn decrypt(&self, peer: &PubKey, ciphertext: &str) -> Result<String>;
}

/// Capability to produce signed events and encrypted payloads, regardless of
/// whether the key lives in this process ([`LocalSigner`]) or behind a
/// NIP-46 remote signer connection ([`RemoteSigner`]) (spec.md §6).
#[async_trait]
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PubKey;
    async fn sign_event(&self, kind: u32, content: String, tags: Vec<Tag>) -> Result<Event>;
    async fn encrypt(&self, peer: &PubKey, plaintext: &str) -> Result<String>;
    async fn decrypt(&self, peer: &PubKey, ciphertext: &str) -> Result<String>;
}

/// Wraps an in-process [`Crypto`] keypair and an optional payload codec.
pub struct LocalSigner {
    crypto: Arc<dyn Crypto>,
    codec: Option<Arc<dyn PayloadCodec>>,
}

impl LocalSigner {
    pub fn new(crypto: Arc<dyn Crypto>, codec: Option<Arc<dyn PayloadCodec>>) -> Self {
        Self { crypto, codec }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn public_key(&self) -> PubKey {
        self.crypto.public_key()
    }

    async fn sign_event(&self, kind: u32, content: String, tags: Vec<Tag>) -> Result<Event> {
        let builder = EventBuilder::new(kind, content).tags(tags);
        Ok(builder.sign(self.crypto.as_ref(), nostr_cache::now_unix())?)
    }

    async fn encrypt(&self, peer: &PubKey, plaintext: &str) -> Result<String> {
        self.codec.as_ref().ok_or(EngineError::NoCodec)?.encrypt(peer, plaintext)
    }

    async fn decrypt(&self, peer: &PubKey, ciphertext: &str) -> Result<String> {
        self.codec.as_ref().ok_or(EngineError::NoCodec)?.decrypt(peer, ciphertext)
    }
}

const NIP46_KIND: u32 = 24133;

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: String,
    method: &'a str,
    params: Vec<String>,
}

#[derive(Deserialize)]
struct RpcResponse {
    id: String,
    result: Option<String>,
    error: Option<String>,
    #[serde(default)]
    auth_url: Option<String>,
}

/// Tuning and addressing for one NIP-46 connection.
#[derive(Clone, Debug)]
pub struct RemoteSignerConfig {
    pub remote_pubkey: PubKey,
    pub relays: Vec<RelayUrl>,
    pub request_timeout: Duration,
}

impl Default for RemoteSignerConfig {
    fn default() -> Self {
        Self { remote_pubkey: PubKey([0u8; 32]), relays: Vec::new(), request_timeout: Duration::from_secs(30) }
    }
}

/// A NIP-46 remote signer connection: every [`Signer`] operation is proxied
/// as an encrypted request/response pair over the relay pool, correlated by
/// a request id (spec.md §6 "remote signer").
pub struct RemoteSigner {
    connection: Arc<dyn Crypto>,
    codec: Arc<dyn PayloadCodec>,
    config: RemoteSignerConfig,
    engine: Arc<SubscriptionEngine>,
    outbox: Arc<PublishOutbox>,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>,
    user_pubkey: RwLock<Option<PubKey>>,
    auth_url_tx: broadcast::Sender<String>,
    next_id: AtomicU64,
}

impl RemoteSigner {
    /// Open a NIP-46 connection: `connection` is the ephemeral local keypair
    /// used to sign/encrypt the transport envelope (distinct from the user's
    /// actual identity key, which the remote signer holds). Spawns a
    /// background listener for the remote's replies.
    pub async fn connect(
        connection: Arc<dyn Crypto>,
        codec: Arc<dyn PayloadCodec>,
        engine: Arc<SubscriptionEngine>,
        outbox: Arc<PublishOutbox>,
        config: RemoteSignerConfig,
    ) -> Result<Arc<Self>> {
        let (auth_url_tx, _) = broadcast::channel(8);
        let signer = Arc::new(Self {
            connection,
            codec,
            engine,
            outbox,
            config,
            pending: Mutex::new(HashMap::new()),
            user_pubkey: RwLock::new(None),
            auth_url_tx,
            next_id: AtomicU64::new(0),
        });
        signer.clone().spawn_response_listener().await?;
        Ok(signer)
    }

    fn fresh_request_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("nip46-{n}")
    }

    pub fn subscribe_auth_url(&self) -> broadcast::Receiver<String> {
        self.auth_url_tx.subscribe()
    }

    async fn spawn_response_listener(self: Arc<Self>) -> Result<()> {
        let filter = nostr_core::Filter::new().kinds(vec![NIP46_KIND]).tag("p", vec![self.connection.public_key().to_hex()]);
        let sub = self.engine.subscribe(vec![filter], Strategy::RelayOnly, false, Some(self.config.relays.clone())).await?;
        let mut events = sub.events();
        let listener = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                listener.handle_response_event(event).await;
            }
        });
        Ok(())
    }

    async fn handle_response_event(&self, event: Event) {
        if event.kind != NIP46_KIND {
            return;
        }
        let Ok(plaintext) = self.codec.decrypt(&event.pubkey, &event.content) else { return };
        let Ok(response) = serde_json::from_str::<RpcResponse>(&plaintext) else { return };
        if let Some(auth_url) = response.auth_url.clone() {
            let _ = self.auth_url_tx.send(auth_url);
        }
        if let Some(tx) = self.pending.lock().remove(&response.id) {
            let _ = tx.send(response);
        }
    }

    /// Send one NIP-46 request and await its matching response, or
    /// [`EngineError::RemoteSignerTimeout`] if the deadline passes first.
    async fn request(&self, method: &str, params: Vec<String>) -> Result<String> {
        let id = self.fresh_request_id();
        let plaintext = serde_json::to_string(&RpcRequest { id: id.clone(), method, params })?;
        let ciphertext = self.codec.encrypt(&self.config.remote_pubkey, &plaintext)?;
        let event = EventBuilder::new(NIP46_KIND, ciphertext)
            .tag(vec!["p".into(), self.config.remote_pubkey.to_hex()])
            .sign(self.connection.as_ref(), nostr_cache::now_unix())?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        self.outbox.publish(event, Some(self.config.relays.clone()), PublishConfig::default()).await?;

        let outcome = tokio::time::timeout(self.config.request_timeout, rx).await;
        self.pending.lock().remove(&id);
        match outcome {
            Ok(Ok(response)) => match response.error {
                Some(e) => Err(EngineError::RemoteSignerError(e)),
                None => response.result.ok_or_else(|| EngineError::RemoteSignerError("empty result".into())),
            },
            Ok(Err(_)) | Err(_) => Err(EngineError::RemoteSignerTimeout),
        }
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    fn public_key(&self) -> PubKey {
        self.user_pubkey.read().unwrap_or_else(|| self.connection.public_key())
    }

    async fn sign_event(&self, kind: u32, content: String, tags: Vec<Tag>) -> Result<Event> {
        let template = json!({
            "kind": kind,
            "content": content,
            "tags": tags,
            "created_at": nostr_cache::now_unix(),
            "pubkey": self.public_key().to_hex(),
        });
        let result = self.request("sign_event", vec![template.to_string()]).await?;
        Ok(serde_json::from_str(&result)?)
    }

    async fn encrypt(&self, peer: &PubKey, plaintext: &str) -> Result<String> {
        self.request("nip44_encrypt", vec![peer.to_hex(), plaintext.to_string()]).await
    }

    async fn decrypt(&self, peer: &PubKey, ciphertext: &str) -> Result<String> {
        self.request("nip44_decrypt", vec![peer.to_hex(), ciphertext.to_string()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_core::Secp256k1Crypto;

    struct EchoCodec;
    impl PayloadCodec for EchoCodec {
        fn encrypt(&self, _peer: &PubKey, plaintext: &str) -> Result<String> {
            Ok(format!("enc:{plaintext}"))
        }
        fn decrypt(&self, _peer: &PubKey, ciphertext: &str) -> Result<String> {
            Ok(ciphertext.strip_prefix("enc:").unwrap_or(ciphertext).to_string())
        }
    }

    #[tokio::test]
    async fn local_signer_signs_with_wrapped_crypto() {
        let crypto: Arc<dyn Crypto> = Arc::new(Secp256k1Crypto::generate());
        let signer = LocalSigner::new(crypto.clone(), Some(Arc::new(EchoCodec)));
        let event = signer.sign_event(1, "hi".to_string(), vec![]).await.unwrap();
        assert_eq!(event.pubkey, crypto.public_key());
    }

    #[tokio::test]
    async fn local_signer_roundtrips_through_codec() {
        let crypto: Arc<dyn Crypto> = Arc::new(Secp256k1Crypto::generate());
        let signer = LocalSigner::new(crypto.clone(), Some(Arc::new(EchoCodec)));
        let peer = crypto.public_key();
        let ciphertext = signer.encrypt(&peer, "hello").await.unwrap();
        let plaintext = signer.decrypt(&peer, &ciphertext).await.unwrap();
        assert_eq!(plaintext, "hello");
    }

    #[tokio::test]
    async fn local_signer_without_codec_rejects_encryption() {
        let crypto: Arc<dyn Crypto> = Arc::new(Secp256k1Crypto::generate());
        let signer = LocalSigner::new(crypto.clone(), None);
        let peer = crypto.public_key();
        assert!(matches!(signer.encrypt(&peer, "hi").await, Err(EngineError::NoCodec)));
    }
}
