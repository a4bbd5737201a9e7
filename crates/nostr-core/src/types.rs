//! Core protocol types: events, tags, and kind-derived predicates (NIP-01).
//!
//! Events are immutable by contract: nothing here mutates `id` or `sig` once
//! set. `EventBuilder` is the only supported path to a signed event.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte event identifier, rendered as lowercase hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub [u8; 32]);

/// 32-byte public key (x-only secp256k1), rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey(pub [u8; 32]);

/// 64-byte BIP-340 Schnorr signature, rendered as lowercase hex.
#[derive(Clone, Copy)]
pub struct Sig(pub [u8; 64]);

macro_rules! hex_newtype {
    ($ty:ident, $len:expr, $field:expr) => {
        impl $ty {
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s).map_err(|e| CoreError::InvalidHex {
                    field: $field,
                    reason: e.to_string(),
                })?;
                if bytes.len() != $len {
                    return Err(CoreError::WrongLength {
                        field: $field,
                        expected: $len,
                        got: bytes.len(),
                    });
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.to_hex())
            }
        }

        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_newtype!(EventId, 32, "id");
hex_newtype!(PubKey, 32, "pubkey");
hex_newtype!(Sig, 64, "sig");

impl PartialEq for Sig {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}
impl Eq for Sig {}

/// An ordered tag: `[name, value, ...]`. Invariant: length >= 1.
pub type Tag = Vec<String>;

/// A signed Nostr event (NIP-01).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PubKey,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: Sig,
}

/// Parameterized address of an addressable (kind 30000-39999) event.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub kind: u32,
    pub author: PubKey,
    pub identifier: String,
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.author, self.identifier)
    }
}

impl Event {
    /// `20000 <= kind < 30000`: relays need not store these.
    pub fn is_ephemeral(&self) -> bool {
        (20000..30000).contains(&self.kind)
    }

    /// `kind in {0, 3}` or `10000 <= kind < 20000`: newest per `(kind, author)` wins.
    pub fn is_replaceable(&self) -> bool {
        self.kind == 0 || self.kind == 3 || (10000..20000).contains(&self.kind)
    }

    /// `30000 <= kind < 40000`: identified by `(kind, author, d-tag)`.
    pub fn is_addressable(&self) -> bool {
        (30000..40000).contains(&self.kind)
    }

    /// Value of the first `d` tag, or `""` if absent (per spec.md §3).
    pub fn d_tag_value(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("d"))
            .and_then(|t| t.get(1))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The addressable coordinate for this event, if it is addressable.
    pub fn coordinate(&self) -> Option<Coordinate> {
        if !self.is_addressable() {
            return None;
        }
        Some(Coordinate {
            kind: self.kind,
            author: self.pubkey,
            identifier: self.d_tag_value().to_string(),
        })
    }

    /// All values for tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }

    /// Structural validation beyond id/sig: non-empty inner tag arrays.
    pub fn validate_structure(&self) -> Result<()> {
        for (i, tag) in self.tags.iter().enumerate() {
            if tag.is_empty() {
                return Err(CoreError::EmptyTag(i));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = EventId::from_hex(
            "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36",
        )
        .unwrap();
        assert_eq!(
            id.to_hex(),
            "5c83da77af1dec6d7289834998ad7aafbd9e2191396d75ec3cc27f5a77226f36"
        );
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(EventId::from_hex("ab").is_err());
    }

    #[test]
    fn kind_predicates() {
        let mut e = sample_event(1);
        assert!(!e.is_ephemeral() && !e.is_replaceable() && !e.is_addressable());
        e.kind = 20001;
        assert!(e.is_ephemeral());
        e.kind = 0;
        assert!(e.is_replaceable());
        e.kind = 30001;
        assert!(e.is_addressable());
    }

    #[test]
    fn coordinate_uses_d_tag_or_empty() {
        let mut e = sample_event(30001);
        assert_eq!(e.coordinate().unwrap().identifier, "");
        e.tags.push(vec!["d".into(), "my-article".into()]);
        assert_eq!(e.coordinate().unwrap().identifier, "my-article");
    }

    #[test]
    fn rejects_empty_tag() {
        let mut e = sample_event(1);
        e.tags.push(vec![]);
        assert!(e.validate_structure().is_err());
    }

    pub(crate) fn sample_event(kind: u32) -> Event {
        Event {
            id: EventId([0u8; 32]),
            pubkey: PubKey([1u8; 32]),
            created_at: 1_700_000_000,
            kind,
            tags: vec![],
            content: String::new(),
            sig: Sig([0u8; 64]),
        }
    }
}
