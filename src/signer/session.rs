//! Bunker sessions: the authenticated user context.
//!
//! A session owns a disposable client keypair, the signer counterparty,
//! the cached conversation key, relay lists and interaction sets. The
//! record itself is cache-resident (24 h TTL); the in-memory relay
//! connections it owns live in the signer service and are torn down
//! explicitly before the record is deleted.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use url::Url;

use super::SignerError;
use crate::crypto::nip44::ConversationKey;
use crate::types::{Keys, PublicKey, SecretKey, Timestamp};

/// Session lifecycle. `Terminal` records a failed connect; everything else
/// follows NEW → UNCONNECTED → CONNECTED → CLOSED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unconnected,
    Connected,
    Closed,
    Terminal,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unconnected, Connected)
                | (Unconnected, Terminal)
                | (Connected, Connected)
                | (Connected, Closed)
        )
    }
}

/// Cached interaction sets: what the user follows, bookmarked, reacted to,
/// reposted, zapped, and mutes. Kept on the session so rendering can mark
/// state without a relay round trip.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InteractionSets {
    pub followed_pubkeys: HashSet<String>,
    pub bookmarked_events: HashSet<String>,
    pub reacted_events: HashSet<String>,
    pub reposted_events: HashSet<String>,
    pub zapped_events: HashSet<String>,
    pub muted_pubkeys: HashSet<String>,
    pub muted_events: HashSet<String>,
    pub muted_hashtags: HashSet<String>,
    pub muted_words: HashSet<String>,
}

impl InteractionSets {
    pub fn is_muted(&self, event: &crate::types::Event) -> bool {
        if self.muted_pubkeys.contains(&event.pubkey.to_hex())
            || self.muted_events.contains(&event.id.to_hex())
        {
            return true;
        }
        let content = event.content.to_lowercase();
        if self.muted_words.iter().any(|word| content.contains(word)) {
            return true;
        }
        event
            .tag_values("t")
            .any(|tag| self.muted_hashtags.contains(&tag.to_lowercase()))
    }
}

/// NWC wallet descriptor, parsed from a `nostr+walletconnect://` URI. Only
/// the RPC shape is consumed here; wallet business flows live elsewhere.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NwcWallet {
    pub wallet_pubkey: PublicKey,
    pub relay: String,
    pub secret: String,
}

impl NwcWallet {
    pub fn parse(uri: &str) -> Result<Self, SignerError> {
        let url = Url::parse(uri).map_err(|e| SignerError::InvalidUri(e.to_string()))?;
        if url.scheme() != "nostr+walletconnect" {
            return Err(SignerError::InvalidUri("expected nostr+walletconnect://".into()));
        }
        let wallet_pubkey = url
            .host_str()
            .ok_or_else(|| SignerError::InvalidUri("missing wallet pubkey".into()))
            .and_then(|host| {
                PublicKey::from_hex(host)
                    .map_err(|_| SignerError::InvalidUri("wallet pubkey is not hex".into()))
            })?;
        let mut relay = None;
        let mut secret = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "relay" => relay = Some(value.into_owned()),
                "secret" => secret = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(Self {
            wallet_pubkey,
            relay: relay.ok_or_else(|| SignerError::InvalidUri("missing relay".into()))?,
            secret: secret.ok_or_else(|| SignerError::InvalidUri("missing secret".into()))?,
        })
    }
}

/// The persisted session record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BunkerSession {
    pub session_id: String,
    pub state: SessionState,
    /// Disposable per-session keypair: the on-wire identity toward the
    /// signer, so passive observers of the signer relays cannot tie
    /// traffic to the gateway identity.
    pub client_secret: String,
    pub client_pubkey: PublicKey,
    /// Encryption counterparty. Not necessarily the user.
    pub remote_signer_pubkey: PublicKey,
    /// Event authorship and social-graph identity.
    pub user_pubkey: PublicKey,
    pub relays: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// NIP-44 conversation key with the signer, derived once.
    pub conversation_key: String,
    pub read_relays: Vec<String>,
    pub write_relays: Vec<String>,
    #[serde(default)]
    pub interactions: InteractionSets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nwc: Option<NwcWallet>,
    /// CSRF token bound to this session.
    pub csrf_token: String,
    pub created_at: Timestamp,
}

impl BunkerSession {
    pub fn new(
        client_keys: &Keys,
        remote_signer_pubkey: PublicKey,
        relays: Vec<String>,
        secret: Option<String>,
    ) -> Result<Self, SignerError> {
        let conversation =
            ConversationKey::derive(&client_keys.secret_key, &remote_signer_pubkey)?;
        Ok(Self {
            session_id: crate::utils::random_hex(16),
            state: SessionState::Unconnected,
            client_secret: client_keys.secret_key.to_hex(),
            client_pubkey: client_keys.public_key(),
            remote_signer_pubkey,
            // Overwritten by the signer's get_public_key answer; they often
            // coincide but must never be conflated.
            user_pubkey: remote_signer_pubkey,
            relays,
            secret,
            conversation_key: hex::encode(conversation.as_bytes()),
            read_relays: Vec::new(),
            write_relays: Vec::new(),
            interactions: InteractionSets::default(),
            nwc: None,
            csrf_token: crate::utils::random_hex(32),
            created_at: crate::utils::now(),
        })
    }

    pub fn client_keys(&self) -> Result<Keys, SignerError> {
        let secret = SecretKey::from_hex(&self.client_secret)?;
        Ok(Keys::new(secret)?)
    }

    pub fn conversation_key(&self) -> Result<ConversationKey, SignerError> {
        let bytes = hex::decode(&self.conversation_key)
            .map_err(|_| SignerError::InvalidUri("conversation key hex".into()))?;
        Ok(ConversationKey::from_slice(&bytes)?)
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), SignerError> {
        if !self.state.can_transition_to(next) {
            return Err(SignerError::UnexpectedResponse(format!(
                "illegal session transition {:?} -> {next:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// A short-lived record matching an outstanding `nostrconnect://` secret to
/// the client keypair generated for it. Promoted to a session when the
/// signer responds with the expected secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingConnection {
    pub pending_id: String,
    pub client_secret: String,
    pub client_pubkey: PublicKey,
    pub secret: String,
    pub relays: Vec<String>,
    pub created_at: Timestamp,
    /// Set on promotion; the login page polls for this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl PendingConnection {
    pub fn new(client_keys: &Keys, relays: Vec<String>) -> Self {
        Self {
            pending_id: crate::utils::random_hex(16),
            client_secret: client_keys.secret_key.to_hex(),
            client_pubkey: client_keys.public_key(),
            secret: crate::utils::random_hex(16),
            relays,
            created_at: crate::utils::now(),
            session_id: None,
        }
    }

    pub fn client_keys(&self) -> Result<Keys, SignerError> {
        let secret = SecretKey::from_hex(&self.client_secret)?;
        Ok(Keys::new(secret)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Template, TEXT_NOTE};

    fn session() -> BunkerSession {
        let client = Keys::generate();
        let signer = Keys::generate();
        BunkerSession::new(&client, signer.public_key(), vec!["wss://r.example".into()], None)
            .unwrap()
    }

    #[test]
    fn state_machine_allows_only_documented_transitions() {
        use SessionState::*;
        assert!(Unconnected.can_transition_to(Connected));
        assert!(Unconnected.can_transition_to(Terminal));
        assert!(Connected.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Connected));
        assert!(!Terminal.can_transition_to(Connected));
        assert!(!Unconnected.can_transition_to(Closed));
    }

    #[test]
    fn transition_enforcement() {
        let mut s = session();
        s.transition(SessionState::Connected).unwrap();
        s.transition(SessionState::Closed).unwrap();
        assert!(s.transition(SessionState::Connected).is_err());
    }

    #[test]
    fn conversation_key_matches_signer_side_derivation() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let session =
            BunkerSession::new(&client, signer.public_key(), vec![], None).unwrap();

        let ours = session.conversation_key().unwrap();
        let theirs =
            ConversationKey::derive(&signer.secret_key, &client.public_key()).unwrap();
        assert_eq!(ours.as_bytes(), theirs.as_bytes());
    }

    #[test]
    fn session_record_serde_round_trip() {
        let original = session();
        let json = serde_json::to_string(&original).unwrap();
        let parsed: BunkerSession = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, original.session_id);
        assert_eq!(parsed.client_pubkey, original.client_pubkey);
        assert_eq!(parsed.conversation_key, original.conversation_key);
        assert_eq!(parsed.state, SessionState::Unconnected);
    }

    #[test]
    fn user_pubkey_is_tracked_separately_from_signer_pubkey() {
        let mut s = session();
        let user = Keys::generate().public_key();
        s.user_pubkey = user;
        assert_ne!(s.user_pubkey, s.remote_signer_pubkey);
    }

    #[test]
    fn nwc_uri_parses() {
        let wallet = Keys::generate();
        let uri = format!(
            "nostr+walletconnect://{}?relay=wss://w.example&secret={}",
            wallet.public_key().to_hex(),
            "ab".repeat(32),
        );
        let parsed = NwcWallet::parse(&uri).unwrap();
        assert_eq!(parsed.wallet_pubkey, wallet.public_key());
        assert_eq!(parsed.relay, "wss://w.example");

        assert!(NwcWallet::parse("nostr+walletconnect://abc").is_err());
        assert!(NwcWallet::parse("https://example.com").is_err());
    }

    #[test]
    fn mute_sets_apply_to_events() {
        let keys = Keys::generate();
        let event = Template::new(
            TEXT_NOTE,
            "GM everyone #Spam",
            vec![vec!["t".to_string(), "spam".to_string()]],
        )
        .to_event(&keys)
        .unwrap();

        let mut sets = InteractionSets::default();
        assert!(!sets.is_muted(&event));

        sets.muted_hashtags.insert("spam".to_string());
        assert!(sets.is_muted(&event));

        sets.muted_hashtags.clear();
        sets.muted_words.insert("gm".to_string());
        assert!(sets.is_muted(&event));

        sets.muted_words.clear();
        sets.muted_pubkeys.insert(keys.public_key().to_hex());
        assert!(sets.is_muted(&event));
    }

    #[test]
    fn pending_connection_generates_distinct_secrets() {
        let keys = Keys::generate();
        let a = PendingConnection::new(&keys, vec![]);
        let b = PendingConnection::new(&keys, vec![]);
        assert_ne!(a.secret, b.secret);
        assert_ne!(a.pending_id, b.pending_id);
        assert!(a.session_id.is_none());
    }
}
