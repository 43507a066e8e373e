//! Core Nostr types: events, filters, keys.
//!
//! The canonical event form and id derivation follow NIP-01 exactly: the id
//! is the SHA-256 of `[0, pubkey, created_at, kind, tags, content]` encoded
//! as compact JSON with no HTML escaping and no trailing newline. Signatures
//! are BIP-340 Schnorr over the 32-byte id.

use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use thiserror::Error;

/// Event kind. Non-negative; the registry ranges exceed `u16`.
pub type Kind = u32;

/// Unix seconds, signed 64-bit.
pub type Timestamp = i64;

pub const METADATA: Kind = 0;
pub const TEXT_NOTE: Kind = 1;
pub const CONTACT_LIST: Kind = 3;
pub const REPOST: Kind = 6;
pub const REACTION: Kind = 7;
pub const REPORT: Kind = 1984;
pub const MUTE_LIST: Kind = 10000;
pub const BOOKMARK_LIST: Kind = 10003;
pub const RELAY_LIST: Kind = 10002;
pub const ZAP_REQUEST: Kind = 9734;
pub const ZAP_RECEIPT: Kind = 9735;
pub const NWC_REQUEST: Kind = 23194;
pub const NWC_RESPONSE: Kind = 23195;
pub const NOSTR_CONNECT: Kind = 24133;

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("invalid key")]
    InvalidKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

macro_rules! hex32_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_hex(s: &str) -> Result<Self, TypesError> {
                if s.len() != 64 {
                    return Err(TypesError::InvalidLength {
                        expected: 32,
                        got: s.len() / 2,
                    });
                }
                let bytes = hex::decode(s)?;
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok($name(arr))
            }

            pub fn from_slice(slice: &[u8]) -> Result<Self, TypesError> {
                if slice.len() != 32 {
                    return Err(TypesError::InvalidLength {
                        expected: 32,
                        got: slice.len(),
                    });
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(slice);
                Ok($name(arr))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $name::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex32_newtype!(EventId);
hex32_newtype!(PublicKey);

/// Secret key. Never serialized implicitly; `to_hex` is explicit.
#[derive(Clone)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    pub fn from_hex(s: &str) -> Result<Self, TypesError> {
        if s.len() != 64 {
            return Err(TypesError::InvalidLength {
                expected: 32,
                got: s.len() / 2,
            });
        }
        let bytes = hex::decode(s)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(SecretKey(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn public_key(&self) -> Result<PublicKey, TypesError> {
        let signing_key =
            SigningKey::from_bytes(&self.0).map_err(|_| TypesError::InvalidKey)?;
        Ok(PublicKey(signing_key.verifying_key().to_bytes().into()))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A secp256k1 keypair with the x-only public key precomputed.
#[derive(Clone, Debug)]
pub struct Keys {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl Keys {
    pub fn new(secret_key: SecretKey) -> Result<Self, TypesError> {
        let public_key = secret_key.public_key()?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut k256::elliptic_curve::rand_core::OsRng);
        let secret_bytes: [u8; 32] = signing_key.to_bytes().into();
        let public_key = PublicKey(signing_key.verifying_key().to_bytes().into());
        Self {
            secret_key: SecretKey(secret_bytes),
            public_key,
        }
    }

    /// Parse a secret key from hex or bech32 `nsec1…`.
    pub fn parse(input: &str) -> Result<Self, TypesError> {
        let secret_key = if input.starts_with("nsec1") {
            crate::types::nip19::decode_nsec(input)
                .map_err(|e| TypesError::MalformedEvent(e.to_string()))?
        } else {
            SecretKey::from_hex(input)?
        };
        Self::new(secret_key)
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// BIP-340 signature over a 32-byte message (usually an event id).
    pub fn sign(&self, message: &[u8; 32]) -> Result<String, TypesError> {
        let signing_key =
            SigningKey::from_bytes(&self.secret_key.0).map_err(|_| TypesError::InvalidKey)?;
        let signature: Signature = signing_key
            .sign_prehash(message)
            .map_err(|_| TypesError::InvalidSignature)?;
        Ok(hex::encode(signature.to_bytes()))
    }
}

/// Verify a BIP-340 signature over a 32-byte message.
///
/// Fails closed: hex of the wrong length never reaches the curve math.
pub fn verify_signature(
    pubkey: &PublicKey,
    message: &[u8; 32],
    sig_hex: &str,
) -> Result<(), TypesError> {
    if sig_hex.len() != 128 {
        return Err(TypesError::InvalidSignature);
    }
    let sig_bytes = hex::decode(sig_hex).map_err(|_| TypesError::InvalidSignature)?;
    let signature =
        Signature::try_from(sig_bytes.as_slice()).map_err(|_| TypesError::InvalidSignature)?;
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey.0).map_err(|_| TypesError::InvalidKey)?;
    verifying_key
        .verify_prehash(message, &signature)
        .map_err(|_| TypesError::InvalidSignature)
}

/// The fundamental record: signed and content-addressed. Never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Canonical NIP-01 form: `[0, pubkey, created_at, kind, tags, content]`.
    ///
    /// serde_json escapes only `"`, `\` and control characters; `<`, `>` and
    /// `&` pass through unescaped, which is what the rest of the network
    /// hashes. No trailing newline.
    pub fn canonical(
        pubkey: &PublicKey,
        created_at: Timestamp,
        kind: Kind,
        tags: &[Vec<String>],
        content: &str,
    ) -> Result<String, TypesError> {
        Ok(serde_json::to_string(&(
            0u8,
            pubkey.to_hex(),
            created_at,
            kind,
            tags,
            content,
        ))?)
    }

    pub fn compute_id(
        pubkey: &PublicKey,
        created_at: Timestamp,
        kind: Kind,
        tags: &[Vec<String>],
        content: &str,
    ) -> Result<EventId, TypesError> {
        let canonical = Self::canonical(pubkey, created_at, kind, tags, content)?;
        let digest = Sha256::digest(canonical.as_bytes());
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Ok(EventId(id))
    }

    /// Structural validation plus id recomputation plus signature check.
    /// Anything that fails here is dropped at the pool boundary.
    pub fn verify(&self) -> Result<(), TypesError> {
        for tag in &self.tags {
            if tag.is_empty() {
                return Err(TypesError::MalformedEvent("empty tag".into()));
            }
        }
        let expected = Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;
        if expected != self.id {
            return Err(TypesError::MalformedEvent("id mismatch".into()));
        }
        verify_signature(&self.pubkey, self.id.as_bytes(), &self.sig)
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, TypesError> {
        Ok(serde_json::from_str(json)?)
    }

    /// First value of the given tag name, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All values of the given tag name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }
}

/// An event template: everything but authorship. Turned into a signed
/// [`Event`] locally (`to_event`) or shipped to a remote signer as-is.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Template {
    pub kind: Kind,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
}

impl Template {
    pub fn new(kind: Kind, content: impl Into<String>, tags: Vec<Vec<String>>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags,
            created_at: None,
        }
    }

    pub fn to_event(&self, keys: &Keys) -> Result<Event, TypesError> {
        let created_at = self.created_at.unwrap_or_else(crate::utils::now);
        let pubkey = keys.public_key();
        let id = Event::compute_id(&pubkey, created_at, self.kind, &self.tags, &self.content)?;
        let sig = keys.sign(id.as_bytes())?;
        Ok(Event {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
            sig,
        })
    }

    /// The unsigned-event JSON a NIP-46 signer expects as `sign_event`
    /// parameter: same fields as an event, no id and no sig.
    pub fn to_unsigned_json(&self, pubkey: &PublicKey) -> serde_json::Value {
        serde_json::json!({
            "pubkey": pubkey.to_hex(),
            "created_at": self.created_at.unwrap_or_else(crate::utils::now),
            "kind": self.kind,
            "tags": self.tags,
            "content": self.content,
        })
    }
}

/// Subscription query shape. A relay returns events satisfying the
/// conjunction of the non-empty fields; `limit` is advisory per relay and
/// enforced post-merge by the fan-out.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EventId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub e_tags: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(rename = "#t", skip_serializing_if = "Option::is_none")]
    pub t_tags: Option<Vec<String>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub d_tags: Option<Vec<String>>,
    #[serde(rename = "#a", skip_serializing_if = "Option::is_none")]
    pub a_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: EventId) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id);
        self
    }

    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author);
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors.get_or_insert_with(Vec::new).extend(authors);
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn event_ref(mut self, id: impl Into<String>) -> Self {
        self.e_tags.get_or_insert_with(Vec::new).push(id.into());
        self
    }

    pub fn pubkey_ref(mut self, pk: impl Into<String>) -> Self {
        self.p_tags.get_or_insert_with(Vec::new).push(pk.into());
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Conjunction match of all non-empty constraint fields. `limit` and
    /// `search` are not structural constraints and are ignored here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        let tag_match = |name: &str, wanted: &Option<Vec<String>>| -> bool {
            match wanted {
                Some(values) => event
                    .tag_values(name)
                    .any(|v| values.iter().any(|w| w == v)),
                None => true,
            }
        };
        tag_match("e", &self.e_tags)
            && tag_match("p", &self.p_tags)
            && tag_match("t", &self.t_tags)
            && tag_match("d", &self.d_tags)
            && tag_match("a", &self.a_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_does_not_escape_html() {
        let keys = Keys::generate();
        let content = r#"{"layout":"card","elements":[{"type":"heading","value":"<b>&amp;</b>"}]}"#;
        let canonical = Event::canonical(&keys.public_key(), 1764775888, 1, &[], content).unwrap();
        assert!(canonical.contains('<'));
        assert!(canonical.contains('>'));
        assert!(canonical.contains('&'));
        assert!(!canonical.contains("\\u003c"));
        assert!(!canonical.contains("\\u0026"));
        assert!(!canonical.ends_with('\n'));
        assert!(canonical.starts_with(&format!("[0,\"{}\",1764775888,1,[],", keys.public_key())));
    }

    #[test]
    fn canonical_exact_form() {
        let pubkey = PublicKey::from_hex(
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        )
        .unwrap();
        let tags = vec![vec!["e".to_string(), "abc".to_string()]];
        let canonical = Event::canonical(&pubkey, 10, 7, &tags, "+").unwrap();
        assert_eq!(
            canonical,
            format!(r#"[0,"{}",10,7,[["e","abc"]],"+"]"#, pubkey.to_hex())
        );
    }

    #[test]
    fn event_id_is_deterministic() {
        let keys = Keys::generate();
        let a = Event::compute_id(&keys.public_key(), 100, 1, &[], "hello").unwrap();
        let b = Event::compute_id(&keys.public_key(), 100, 1, &[], "hello").unwrap();
        assert_eq!(a, b);
        let c = Event::compute_id(&keys.public_key(), 101, 1, &[], "hello").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = Keys::generate();
        let event = Template::new(TEXT_NOTE, "hi there", vec![])
            .to_event(&keys)
            .unwrap();
        event.verify().unwrap();
        assert_eq!(event.pubkey, keys.public_key());
    }

    #[test]
    fn tampered_content_fails_verification() {
        let keys = Keys::generate();
        let mut event = Template::new(TEXT_NOTE, "original", vec![])
            .to_event(&keys)
            .unwrap();
        event.content = "tampered".to_string();
        assert!(event.verify().is_err());
    }

    #[test]
    fn verify_rejects_bad_signature_lengths_without_curve_math() {
        let keys = Keys::generate();
        let mut event = Template::new(TEXT_NOTE, "x", vec![]).to_event(&keys).unwrap();
        event.sig = "deadbeef".to_string();
        assert!(matches!(event.verify(), Err(TypesError::InvalidSignature)));
    }

    #[test]
    fn empty_inner_tag_is_rejected() {
        let keys = Keys::generate();
        let mut event = Template::new(TEXT_NOTE, "x", vec![]).to_event(&keys).unwrap();
        event.tags = vec![vec![]];
        assert!(event.verify().is_err());
    }

    #[test]
    fn pubkey_hex_length_is_enforced() {
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(EventId::from_hex(&"0".repeat(63)).is_err());
        assert!(EventId::from_hex(&"0".repeat(64)).is_ok());
    }

    #[test]
    fn filter_serializes_only_non_empty_fields() {
        let filter = Filter::new().kind(1).limit(20);
        assert_eq!(filter.as_json(), r#"{"kinds":[1],"limit":20}"#);

        let filter = Filter::new().event_ref("abc");
        assert_eq!(filter.as_json(), r##"{"#e":["abc"]}"##);
    }

    #[test]
    fn filter_matches_conjunction() {
        let keys = Keys::generate();
        let event = Template::new(
            REACTION,
            "+",
            vec![vec!["e".to_string(), "target".to_string()]],
        )
        .to_event(&keys)
        .unwrap();

        assert!(Filter::new().kind(REACTION).matches(&event));
        assert!(Filter::new().kind(REACTION).event_ref("target").matches(&event));
        assert!(!Filter::new().kind(REACTION).event_ref("other").matches(&event));
        assert!(!Filter::new().kind(TEXT_NOTE).matches(&event));
        assert!(Filter::new().author(keys.public_key()).matches(&event));
        assert!(!Filter::new()
            .since(event.created_at + 1)
            .matches(&event));
    }

    #[test]
    fn event_json_round_trip() {
        let keys = Keys::generate();
        let event = Template::new(TEXT_NOTE, "serde round trip", vec![])
            .to_event(&keys)
            .unwrap();
        let json = event.as_json();
        let parsed = Event::from_json(&json).unwrap();
        assert_eq!(parsed.id, event.id);
        assert_eq!(parsed.sig, event.sig);
        parsed.verify().unwrap();
    }
}
