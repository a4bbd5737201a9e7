//! NIP-13 proof-of-work: a pure nonce-mining function over the canonical id
//! digest (spec.md §4.6 "Retry" — "PoW requests may ... mine a nonce tag to
//! the requested difficulty before resending").
//!
//! Grounded on `canonical.rs`'s "one normative hashing path" idiom: mining
//! never reimplements the hash, it only drives [`crate::canonical::event_id_digest`]
//! with a changing `nonce` tag.

use crate::canonical::event_id_digest;
use crate::types::{PubKey, Tag};

/// Count of leading zero bits in a 32-byte id, the NIP-13 difficulty metric.
pub fn leading_zero_bits(id: &[u8; 32]) -> u32 {
    let mut count = 0u32;
    for &byte in id {
        if byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

/// Search for a `nonce` tag value such that the resulting id has at least
/// `difficulty` leading zero bits, trying at most `max_iterations` values.
/// A pure function: it never signs, it only rewrites the `nonce` tag and
/// rehashes. Returns `None` if `max_iterations` is exhausted first (spec.md
/// SPEC_FULL §4.6: "bounded by a max-iterations guard so it cannot spin
/// forever in adversarial configs").
pub fn mine_nonce_tag(
    pubkey: &PubKey,
    created_at: i64,
    kind: u32,
    mut tags: Vec<Tag>,
    content: &str,
    difficulty: u8,
    max_iterations: u64,
) -> Option<(Vec<Tag>, [u8; 32])> {
    let nonce_idx = tags.iter().position(|t| t.first().map(String::as_str) == Some("nonce"));
    let idx = match nonce_idx {
        Some(i) => i,
        None => {
            tags.push(vec!["nonce".to_string(), "0".to_string(), difficulty.to_string()]);
            tags.len() - 1
        }
    };

    for n in 0..max_iterations {
        tags[idx] = vec!["nonce".to_string(), n.to_string(), difficulty.to_string()];
        let digest = event_id_digest(pubkey, created_at, kind, &tags, content);
        if leading_zero_bits(&digest) >= difficulty as u32 {
            return Some((tags, digest));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_zero_bits_counts_full_zero_bytes() {
        let mut id = [0xffu8; 32];
        id[0] = 0;
        id[1] = 0;
        id[2] = 0b0000_1111;
        assert_eq!(leading_zero_bits(&id), 20);
    }

    #[test]
    fn leading_zero_bits_of_all_zero_is_256() {
        assert_eq!(leading_zero_bits(&[0u8; 32]), 256);
    }

    #[test]
    fn mining_at_zero_difficulty_succeeds_immediately() {
        let pubkey = PubKey([7u8; 32]);
        let (tags, _digest) = mine_nonce_tag(&pubkey, 1_700_000_000, 1, vec![], "hi", 0, 1).unwrap();
        assert_eq!(tags, vec![vec!["nonce".to_string(), "0".to_string(), "0".to_string()]]);
    }

    #[test]
    fn mining_gives_up_after_max_iterations() {
        let pubkey = PubKey([7u8; 32]);
        // 64 leading zero bits is astronomically unlikely to land within 4 tries.
        let result = mine_nonce_tag(&pubkey, 1_700_000_000, 1, vec![], "hi", 64, 4);
        assert!(result.is_none());
    }

    #[test]
    fn mined_id_meets_requested_difficulty() {
        let pubkey = PubKey([3u8; 32]);
        let (_, digest) = mine_nonce_tag(&pubkey, 1_700_000_000, 1, vec![], "hi", 8, 100_000).unwrap();
        assert!(leading_zero_bits(&digest) >= 8);
    }
}
