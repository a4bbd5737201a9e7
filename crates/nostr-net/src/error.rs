//! Error types for relay connections, wire framing, and the pool.

use thiserror::Error;

/// Result type alias using `NetError`.
pub type Result<T> = std::result::Result<T, NetError>;

/// Networking and protocol error kinds (spec.md §7 "Network"/"Protocol").
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("relay {0} not found in pool")]
    RelayNotFound(String),

    #[error("relay {0} is already registered")]
    AlreadyRegistered(String),

    #[error("connect to {relay} failed: {reason}")]
    ConnectFailed { relay: String, reason: String },

    #[error("relay {0} is not connected")]
    NotConnected(String),

    #[error("relay {0} is blacklisted")]
    Blacklisted(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed wire frame: {0}")]
    Frame(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] nostr_core::CoreError),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}
