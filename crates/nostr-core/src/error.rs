//! Error types for event/filter validation and signing.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core validation and crypto error kinds.
#[derive(Debug, Error)]
pub enum CoreError {
    /// `id` did not match the recomputed SHA-256 of the canonical serialization.
    #[error("event id mismatch: computed {computed} != stated {stated}")]
    IdMismatch { computed: String, stated: String },

    /// `sig` did not verify against `pubkey` over `id`.
    #[error("invalid signature")]
    InvalidSignature,

    /// A hex field (id, pubkey, sig) was malformed.
    #[error("invalid hex in field {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    /// A field had the wrong byte length once decoded.
    #[error("field {field} has wrong length: expected {expected}, got {got}")]
    WrongLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    /// A tag's inner array was empty (invariant: length >= 1).
    #[error("tag at index {0} is empty")]
    EmptyTag(usize),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Signing failed at the crypto capability boundary.
    #[error("signing failed: {0}")]
    SigningFailed(String),
}
