//! Canonical Nostr event and filter model, signature primitives, and
//! NIP-19/NIP-11 identifier types shared by every other crate in the
//! workspace.

pub mod builder;
pub mod canonical;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod nip11;
pub mod nip19;
pub mod pow;
pub mod types;

pub use builder::EventBuilder;
pub use crypto::{Crypto, Secp256k1Crypto};
pub use error::{CoreError, Result};
pub use filter::Filter;
pub use nip11::{RelayInformationDocument, RelayLimitation};
pub use nip19::Nip19;
pub use pow::{leading_zero_bits, mine_nonce_tag};
pub use types::{Coordinate, Event, EventId, PubKey, Sig, Tag};

/// Validate a fully-formed event: recompute its id and verify its signature.
pub fn validate_event(event: &Event) -> Result<()> {
    event.validate_structure()?;
    let computed = canonical::recompute_id(event);
    if computed != event.id.0 {
        return Err(CoreError::IdMismatch {
            computed: hex::encode(computed),
            stated: event.id.to_hex(),
        });
    }
    crypto::verify(&event.pubkey, &event.id.0, &event.sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_event_accepts_well_formed_event() {
        let signer = Secp256k1Crypto::generate();
        let event = EventBuilder::new(1, "hi").sign(&signer, 1_700_000_000).unwrap();
        validate_event(&event).unwrap();
    }

    #[test]
    fn validate_event_rejects_tampered_content() {
        let signer = Secp256k1Crypto::generate();
        let mut event = EventBuilder::new(1, "hi").sign(&signer, 1_700_000_000).unwrap();
        event.content = "tampered".into();
        assert!(validate_event(&event).is_err());
    }
}
