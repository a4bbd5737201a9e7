//! Construction and signing of outgoing events.

use crate::canonical::event_id_digest;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::types::{Event, EventId, Tag};

/// Builds an [`Event`], deriving its id and signature from a [`Crypto`]
/// capability so callers never hand-assemble the canonical form themselves.
#[derive(Clone, Debug, Default)]
pub struct EventBuilder {
    kind: u32,
    content: String,
    tags: Vec<Tag>,
    created_at: Option<i64>,
}

impl EventBuilder {
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Set an explicit `created_at`; intended for tests. Production callers
    /// should leave this unset and pass the current unix time to [`Self::sign`].
    pub fn created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Finalize into a signed [`Event`] under `signer`. `now` is the unix
    /// timestamp used when `created_at` wasn't fixed explicitly.
    pub fn sign(self, signer: &dyn Crypto, now: i64) -> Result<Event> {
        let created_at = self.created_at.unwrap_or(now);
        let pubkey = signer.public_key();
        let digest = event_id_digest(&pubkey, created_at, self.kind, &self.tags, &self.content);
        let sig = signer.sign(&digest)?;
        Ok(Event {
            id: EventId(digest),
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secp256k1Crypto;

    #[test]
    fn signed_event_verifies() {
        let signer = Secp256k1Crypto::generate();
        let event = EventBuilder::new(1, "hello")
            .tag(vec!["e".into(), "deadbeef".into()])
            .created_at(1_700_000_000)
            .sign(&signer, 0)
            .unwrap();
        assert_eq!(event.pubkey, signer.public_key());
        crate::crypto::verify(&event.pubkey, &event.id.0, &event.sig).unwrap();
        assert_eq!(crate::canonical::recompute_id(&event), event.id.0);
    }
}
