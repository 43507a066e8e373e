//! NIP-19 bech32-encoded identifiers.
//!
//! Plain forms wrap a single 32-byte payload (`npub`, `note`, `nsec`); TLV
//! forms (`nevent`, `nprofile`) carry type-tagged fields: type 0 is the
//! primary identifier, type 1 a relay hint (repeatable), type 2 an author
//! pubkey, type 3 a big-endian u32 kind. Encoding and decoding are
//! round-trip exact for every supported identifier.

use bech32::{Bech32, Hrp};
use thiserror::Error;

use crate::types::nostr::{EventId, Kind, PublicKey, SecretKey};

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

#[derive(Debug, Error)]
pub enum Nip19Error {
    #[error("bech32 decode error: {0}")]
    Decode(String),

    #[error("bech32 encode error: {0}")]
    Encode(String),

    #[error("unknown prefix: {0}")]
    UnknownPrefix(String),

    #[error("invalid payload length: {0}")]
    InvalidLength(usize),

    #[error("malformed TLV payload")]
    MalformedTlv,

    #[error("missing primary TLV entry")]
    MissingPrimary,

    #[error("relay hint is not valid UTF-8")]
    InvalidRelayHint,
}

/// A profile pointer: pubkey plus zero or more relay hints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nip19Profile {
    pub public_key: PublicKey,
    pub relays: Vec<String>,
}

/// An event pointer: id plus optional relay hints, author and kind.
#[derive(Clone, Debug, PartialEq)]
pub struct Nip19Event {
    pub event_id: EventId,
    pub relays: Vec<String>,
    pub author: Option<PublicKey>,
    pub kind: Option<Kind>,
}

/// Any supported NIP-19 identifier.
#[derive(Clone, Debug)]
pub enum Nip19 {
    Pubkey(PublicKey),
    EventId(EventId),
    Secret(SecretKey),
    Profile(Nip19Profile),
    Event(Nip19Event),
}

fn hrp(name: &str) -> Hrp {
    Hrp::parse(name).expect("static hrp is valid")
}

fn encode(name: &str, data: &[u8]) -> Result<String, Nip19Error> {
    bech32::encode::<Bech32>(hrp(name), data).map_err(|e| Nip19Error::Encode(e.to_string()))
}

pub fn encode_npub(public_key: &PublicKey) -> Result<String, Nip19Error> {
    encode("npub", public_key.as_bytes())
}

pub fn encode_note(event_id: &EventId) -> Result<String, Nip19Error> {
    encode("note", event_id.as_bytes())
}

pub fn encode_nsec(secret_key: &SecretKey) -> Result<String, Nip19Error> {
    encode("nsec", &secret_key.0)
}

pub fn encode_nprofile(profile: &Nip19Profile) -> Result<String, Nip19Error> {
    let mut payload = Vec::new();
    push_tlv(&mut payload, TLV_SPECIAL, profile.public_key.as_bytes());
    for relay in &profile.relays {
        push_tlv(&mut payload, TLV_RELAY, relay.as_bytes());
    }
    encode("nprofile", &payload)
}

pub fn encode_nevent(event: &Nip19Event) -> Result<String, Nip19Error> {
    let mut payload = Vec::new();
    push_tlv(&mut payload, TLV_SPECIAL, event.event_id.as_bytes());
    for relay in &event.relays {
        push_tlv(&mut payload, TLV_RELAY, relay.as_bytes());
    }
    if let Some(author) = &event.author {
        push_tlv(&mut payload, TLV_AUTHOR, author.as_bytes());
    }
    if let Some(kind) = event.kind {
        push_tlv(&mut payload, TLV_KIND, &kind.to_be_bytes());
    }
    encode("nevent", &payload)
}

/// Decode any supported identifier, dispatching on the human-readable part.
pub fn decode(input: &str) -> Result<Nip19, Nip19Error> {
    let (hrp, data) =
        bech32::decode(input).map_err(|e| Nip19Error::Decode(e.to_string()))?;
    match hrp.as_str() {
        "npub" => Ok(Nip19::Pubkey(
            PublicKey::from_slice(&data).map_err(|_| Nip19Error::InvalidLength(data.len()))?,
        )),
        "note" => Ok(Nip19::EventId(
            EventId::from_slice(&data).map_err(|_| Nip19Error::InvalidLength(data.len()))?,
        )),
        "nsec" => {
            if data.len() != 32 {
                return Err(Nip19Error::InvalidLength(data.len()));
            }
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&data);
            Ok(Nip19::Secret(SecretKey(arr)))
        }
        "nprofile" => Ok(Nip19::Profile(decode_nprofile_tlv(&data)?)),
        "nevent" => Ok(Nip19::Event(decode_nevent_tlv(&data)?)),
        other => Err(Nip19Error::UnknownPrefix(other.to_string())),
    }
}

pub fn decode_npub(input: &str) -> Result<PublicKey, Nip19Error> {
    match decode(input)? {
        Nip19::Pubkey(pk) => Ok(pk),
        _ => Err(Nip19Error::UnknownPrefix(input.to_string())),
    }
}

pub fn decode_nsec(input: &str) -> Result<SecretKey, Nip19Error> {
    match decode(input)? {
        Nip19::Secret(sk) => Ok(sk),
        _ => Err(Nip19Error::UnknownPrefix(input.to_string())),
    }
}

fn push_tlv(payload: &mut Vec<u8>, tlv_type: u8, value: &[u8]) {
    payload.push(tlv_type);
    payload.push(value.len() as u8);
    payload.extend_from_slice(value);
}

fn parse_tlv(payload: &[u8]) -> Result<Vec<(u8, &[u8])>, Nip19Error> {
    let mut entries = Vec::new();
    let mut cursor = 0usize;
    while cursor < payload.len() {
        if cursor + 2 > payload.len() {
            return Err(Nip19Error::MalformedTlv);
        }
        let tlv_type = payload[cursor];
        let length = payload[cursor + 1] as usize;
        cursor += 2;
        if cursor + length > payload.len() {
            return Err(Nip19Error::MalformedTlv);
        }
        entries.push((tlv_type, &payload[cursor..cursor + length]));
        cursor += length;
    }
    Ok(entries)
}

fn decode_nprofile_tlv(payload: &[u8]) -> Result<Nip19Profile, Nip19Error> {
    let mut public_key = None;
    let mut relays = Vec::new();
    for (tlv_type, value) in parse_tlv(payload)? {
        match tlv_type {
            TLV_SPECIAL => {
                public_key = Some(
                    PublicKey::from_slice(value)
                        .map_err(|_| Nip19Error::InvalidLength(value.len()))?,
                );
            }
            TLV_RELAY => relays.push(
                String::from_utf8(value.to_vec()).map_err(|_| Nip19Error::InvalidRelayHint)?,
            ),
            // Unknown TLV types are skipped per NIP-19.
            _ => {}
        }
    }
    Ok(Nip19Profile {
        public_key: public_key.ok_or(Nip19Error::MissingPrimary)?,
        relays,
    })
}

fn decode_nevent_tlv(payload: &[u8]) -> Result<Nip19Event, Nip19Error> {
    let mut event_id = None;
    let mut relays = Vec::new();
    let mut author = None;
    let mut kind = None;
    for (tlv_type, value) in parse_tlv(payload)? {
        match tlv_type {
            TLV_SPECIAL => {
                event_id = Some(
                    EventId::from_slice(value)
                        .map_err(|_| Nip19Error::InvalidLength(value.len()))?,
                );
            }
            TLV_RELAY => relays.push(
                String::from_utf8(value.to_vec()).map_err(|_| Nip19Error::InvalidRelayHint)?,
            ),
            TLV_AUTHOR => {
                author = Some(
                    PublicKey::from_slice(value)
                        .map_err(|_| Nip19Error::InvalidLength(value.len()))?,
                );
            }
            TLV_KIND => {
                if value.len() != 4 {
                    return Err(Nip19Error::MalformedTlv);
                }
                kind = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            _ => {}
        }
    }
    Ok(Nip19Event {
        event_id: event_id.ok_or(Nip19Error::MissingPrimary)?,
        relays,
        author,
        kind,
    })
}
