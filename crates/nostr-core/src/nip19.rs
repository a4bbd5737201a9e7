//! NIP-19 bech32-encoded identifiers: `npub`, `nsec`, `note`, `nprofile`,
//! `nevent`, `naddr`.

use crate::error::{CoreError, Result};
use crate::types::{EventId, PubKey};
use bech32::{Bech32, Hrp};

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

/// A decoded NIP-19 identifier.
#[derive(Clone, Debug, PartialEq)]
pub enum Nip19 {
    PubKey(PubKey),
    SecretKey([u8; 32]),
    EventId(EventId),
    Profile {
        pubkey: PubKey,
        relays: Vec<String>,
    },
    Event {
        id: EventId,
        relays: Vec<String>,
        author: Option<PubKey>,
        kind: Option<u32>,
    },
    Address {
        identifier: String,
        pubkey: PubKey,
        kind: u32,
        relays: Vec<String>,
    },
}

fn decode_raw(s: &str) -> Result<(String, Vec<u8>)> {
    let (hrp, data) = bech32::decode(s)
        .map_err(|e| CoreError::InvalidHex { field: "bech32", reason: e.to_string() })?;
    Ok((hrp.as_str().to_string(), data))
}

fn fixed32(data: &[u8], field: &'static str) -> Result<[u8; 32]> {
    if data.len() != 32 {
        return Err(CoreError::WrongLength { field, expected: 32, got: data.len() });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(data);
    Ok(out)
}

fn parse_tlv(data: &[u8]) -> Result<Vec<(u8, &[u8])>> {
    let mut entries = Vec::new();
    let mut i = 0;
    while i + 2 <= data.len() {
        let ty = data[i];
        let len = data[i + 1] as usize;
        let start = i + 2;
        let end = start + len;
        if end > data.len() {
            return Err(CoreError::InvalidHex {
                field: "tlv",
                reason: "truncated entry".into(),
            });
        }
        entries.push((ty, &data[start..end]));
        i = end;
    }
    Ok(entries)
}

impl Nip19 {
    /// Decode any NIP-19 bech32 string into its typed form.
    pub fn decode(s: &str) -> Result<Self> {
        let (hrp, data) = decode_raw(s)?;
        match hrp.as_str() {
            "npub" => Ok(Nip19::PubKey(PubKey(fixed32(&data, "pubkey")?))),
            "nsec" => Ok(Nip19::SecretKey(fixed32(&data, "seckey")?)),
            "note" => Ok(Nip19::EventId(EventId(fixed32(&data, "id")?))),
            "nprofile" => {
                let mut pubkey = None;
                let mut relays = Vec::new();
                for (ty, value) in parse_tlv(&data)? {
                    match ty {
                        TLV_SPECIAL => pubkey = Some(PubKey(fixed32(value, "pubkey")?)),
                        TLV_RELAY => relays.push(String::from_utf8_lossy(value).into_owned()),
                        _ => {}
                    }
                }
                let pubkey = pubkey.ok_or(CoreError::InvalidHex {
                    field: "nprofile",
                    reason: "missing special (pubkey) TLV entry".into(),
                })?;
                Ok(Nip19::Profile { pubkey, relays })
            }
            "nevent" => {
                let mut id = None;
                let mut relays = Vec::new();
                let mut author = None;
                let mut kind = None;
                for (ty, value) in parse_tlv(&data)? {
                    match ty {
                        TLV_SPECIAL => id = Some(EventId(fixed32(value, "id")?)),
                        TLV_RELAY => relays.push(String::from_utf8_lossy(value).into_owned()),
                        TLV_AUTHOR => author = Some(PubKey(fixed32(value, "pubkey")?)),
                        TLV_KIND if value.len() == 4 => {
                            kind = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
                        }
                        _ => {}
                    }
                }
                let id = id.ok_or(CoreError::InvalidHex {
                    field: "nevent",
                    reason: "missing special (id) TLV entry".into(),
                })?;
                Ok(Nip19::Event { id, relays, author, kind })
            }
            "naddr" => {
                let mut identifier = None;
                let mut relays = Vec::new();
                let mut pubkey = None;
                let mut kind = None;
                for (ty, value) in parse_tlv(&data)? {
                    match ty {
                        TLV_SPECIAL => {
                            identifier = Some(String::from_utf8_lossy(value).into_owned())
                        }
                        TLV_RELAY => relays.push(String::from_utf8_lossy(value).into_owned()),
                        TLV_AUTHOR => pubkey = Some(PubKey(fixed32(value, "pubkey")?)),
                        TLV_KIND if value.len() == 4 => {
                            kind = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
                        }
                        _ => {}
                    }
                }
                let identifier = identifier.unwrap_or_default();
                let pubkey = pubkey.ok_or(CoreError::InvalidHex {
                    field: "naddr",
                    reason: "missing author TLV entry".into(),
                })?;
                let kind = kind.ok_or(CoreError::InvalidHex {
                    field: "naddr",
                    reason: "missing kind TLV entry".into(),
                })?;
                Ok(Nip19::Address { identifier, pubkey, kind, relays })
            }
            other => Err(CoreError::InvalidHex {
                field: "hrp",
                reason: format!("unrecognized NIP-19 prefix {other}"),
            }),
        }
    }
}

/// Encode a raw pubkey as `npub1...`.
pub fn encode_npub(pubkey: &PubKey) -> Result<String> {
    encode_simple("npub", &pubkey.0)
}

/// Encode a raw event id as `note1...`.
pub fn encode_note(id: &EventId) -> Result<String> {
    encode_simple("note", &id.0)
}

fn encode_simple(hrp: &str, data: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(hrp)
        .map_err(|e| CoreError::InvalidHex { field: "hrp", reason: e.to_string() })?;
    bech32::encode::<Bech32>(hrp, data)
        .map_err(|e| CoreError::InvalidHex { field: "bech32", reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npub_roundtrip() {
        let pubkey = PubKey([0x42; 32]);
        let encoded = encode_npub(&pubkey).unwrap();
        assert!(encoded.starts_with("npub1"));
        match Nip19::decode(&encoded).unwrap() {
            Nip19::PubKey(decoded) => assert_eq!(decoded, pubkey),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn note_roundtrip() {
        let id = EventId([0x11; 32]);
        let encoded = encode_note(&id).unwrap();
        match Nip19::decode(&encoded).unwrap() {
            Nip19::EventId(decoded) => assert_eq!(decoded, id),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_prefix() {
        let hrp = Hrp::parse("xnostr").unwrap();
        let s = bech32::encode::<Bech32>(hrp, &[0u8; 32]).unwrap();
        assert!(Nip19::decode(&s).is_err());
    }
}
