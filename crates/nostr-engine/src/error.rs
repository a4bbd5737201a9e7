//! The engine's error type, aggregating every lower crate's error at the
//! seam (spec.md §7).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] nostr_core::CoreError),
    #[error(transparent)]
    Net(#[from] nostr_net::NetError),
    #[error(transparent)]
    Cache(#[from] nostr_cache::CacheError),
    #[error(transparent)]
    Sampler(#[from] nostr_sampler::SamplerError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),
    #[error("no signer configured")]
    NoSigner,
    #[error("publish requested proof-of-work but no signing capability was configured to re-sign the mined event")]
    NoPowCrypto,
    #[error("proof-of-work mining exhausted its iteration budget without reaching the requested difficulty")]
    PowNotFound,
    #[error("no payload codec configured for encryption")]
    NoCodec,
    #[error("publish timed out waiting for relay acks")]
    PublishTimeout,
    #[error("no relay targets available")]
    NoTargets,
    #[error("remote signer request timed out")]
    RemoteSignerTimeout,
    #[error("remote signer returned an error: {0}")]
    RemoteSignerError(String),
}
