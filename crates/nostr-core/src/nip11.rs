//! NIP-11 relay information document, fetched over `https://` with an
//! `Accept: application/nostr+json` header by `nostr-net::peer`.

use serde::{Deserialize, Serialize};

/// The subset of NIP-11 fields the engine and sampler act on; unknown fields
/// round-trip through `serde_json::Value` via `#[serde(flatten)]` rather than
/// being dropped.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayInformationDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "supported_nips")]
    pub supported_nips: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limitation: Option<RelayLimitation>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The `limitation` object (write/auth/payment constraints a relay advertises).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayLimitation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_filters: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restricted_writes: Option<bool>,
}

impl RelayInformationDocument {
    pub fn supports_nip(&self, nip: u32) -> bool {
        self.supported_nips
            .as_ref()
            .is_some_and(|nips| nips.contains(&nip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let json = r#"{"name":"relay.example","supported_nips":[1,11,42]}"#;
        let doc: RelayInformationDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.name.as_deref(), Some("relay.example"));
        assert!(doc.supports_nip(42));
        assert!(!doc.supports_nip(99));
    }

    #[test]
    fn preserves_unknown_fields() {
        let json = r#"{"name":"r","icon":"https://example.com/i.png"}"#;
        let doc: RelayInformationDocument = serde_json::from_str(json).unwrap();
        assert_eq!(
            doc.extra.get("icon").and_then(|v| v.as_str()),
            Some("https://example.com/i.png")
        );
    }
}
