//! Canonical serialization and id derivation (NIP-01 §"Events and signatures").
//!
//! The wire format for hashing is the six-element JSON array
//! `[0, pubkey, created_at, kind, tags, content]`, serialized with no
//! insignificant whitespace and with exactly the escape rules below — this is
//! the one place that encoding happens; every signer and verifier in the
//! crate goes through [`event_id`].

use crate::types::{Event, PubKey, Tag};
use sha2::{Digest, Sha256};

/// Escape a string per the JSON rules NIP-01 mandates for id hashing:
/// `"`, `\`, and U+0000-U+001F are escaped (`\n \r \t \b \f` get short forms,
/// everything else in that range gets `\u00XX`); everything else, including
/// non-ASCII UTF-8 and `/`, passes through unescaped.
fn escape_json_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn push_tags(out: &mut String, tags: &[Tag]) {
    out.push('[');
    for (i, tag) in tags.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        for (j, value) in tag.iter().enumerate() {
            if j > 0 {
                out.push(',');
            }
            escape_json_string(out, value);
        }
        out.push(']');
    }
    out.push(']');
}

/// Serialize `(pubkey, created_at, kind, tags, content)` into the canonical
/// byte string that is hashed to produce an event id.
pub fn canonical_bytes(
    pubkey: &PubKey,
    created_at: i64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("[0,");
    escape_json_string(&mut out, &pubkey.to_hex());
    out.push(',');
    out.push_str(&created_at.to_string());
    out.push(',');
    out.push_str(&kind.to_string());
    out.push(',');
    push_tags(&mut out, tags);
    out.push(',');
    escape_json_string(&mut out, content);
    out.push(']');
    out.into_bytes()
}

/// The SHA-256 digest of [`canonical_bytes`], i.e. the bytes that become the
/// event's `id` once hex-encoded.
pub fn event_id_digest(
    pubkey: &PubKey,
    created_at: i64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> [u8; 32] {
    let bytes = canonical_bytes(pubkey, created_at, kind, tags, content);
    let digest = Sha256::digest(&bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Recompute `event`'s id from its fields, ignoring the stated `id`.
pub fn recompute_id(event: &Event) -> [u8; 32] {
    event_id_digest(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventId, Sig};

    #[test]
    fn escapes_control_and_quote_chars() {
        let mut out = String::new();
        escape_json_string(&mut out, "a\"b\\c\nd\te\rf\u{01}g");
        assert_eq!(out, "\"a\\\"b\\\\c\\nd\\te\\rf\\u0001g\"");
    }

    #[test]
    fn leaves_forward_slash_and_unicode_alone() {
        let mut out = String::new();
        escape_json_string(&mut out, "a/b/☃");
        assert_eq!(out, "\"a/b/☃\"");
    }

    #[test]
    fn canonical_bytes_match_expected_shape() {
        let pubkey = PubKey([0xab; 32]);
        let bytes = canonical_bytes(&pubkey, 1700000000, 1, &[vec!["e".into(), "deadbeef".into()]], "hi");
        let s = String::from_utf8(bytes).unwrap();
        assert!(s.starts_with("[0,\"abababab"));
        assert!(s.contains(",1700000000,1,"));
        assert!(s.ends_with("\"hi\"]"));
    }

    #[test]
    fn id_is_deterministic() {
        let pubkey = PubKey([1u8; 32]);
        let a = event_id_digest(&pubkey, 1, 1, &[], "x");
        let b = event_id_digest(&pubkey, 1, 1, &[], "x");
        assert_eq!(a, b);
    }

    #[test]
    fn recompute_detects_tamper() {
        let event = Event {
            id: EventId([0u8; 32]),
            pubkey: PubKey([1u8; 32]),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: "hello".into(),
            sig: Sig([0u8; 64]),
        };
        let mut tampered = event.clone();
        tampered.content = "goodbye".into();
        assert_ne!(recompute_id(&event), recompute_id(&tampered));
    }
}
