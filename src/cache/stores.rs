//! Typed stores over the key/value backend.
//!
//! Every domain object is cached inside the same envelope: payload,
//! `fetched_at`, and an explicit `not_found` flag so "no answer yet" and
//! "authoritatively absent" are distinguishable — the latter gets a shorter
//! TTL. Backend errors are logged at debug level and read as misses.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::KvBackend;
use crate::types::{Event, PublicKey, Timestamp};

/// Cached envelope for a domain object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cached<T> {
    pub payload: Option<T>,
    pub fetched_at: Timestamp,
    pub not_found: bool,
}

impl<T> Cached<T> {
    pub fn hit(payload: T) -> Self {
        Self {
            payload: Some(payload),
            fetched_at: crate::utils::now(),
            not_found: false,
        }
    }

    pub fn absent() -> Self {
        Self {
            payload: None,
            fetched_at: crate::utils::now(),
            not_found: true,
        }
    }
}

/// A keyspace: prefix plus the TTL pair (positive answer / not-found).
#[derive(Clone, Copy, Debug)]
pub struct Keyspace {
    pub prefix: &'static str,
    pub ttl: Duration,
    pub not_found_ttl: Duration,
}

const fn mins(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

const fn hours(h: u64) -> Duration {
    Duration::from_secs(h * 3600)
}

pub const PROFILE: Keyspace = Keyspace { prefix: "profile:", ttl: mins(30), not_found_ttl: mins(2) };
pub const CONTACTS: Keyspace = Keyspace { prefix: "contacts:", ttl: mins(30), not_found_ttl: mins(2) };
pub const RELAY_LIST: Keyspace = Keyspace { prefix: "relaylist:", ttl: mins(30), not_found_ttl: mins(5) };
pub const AVATAR: Keyspace = Keyspace { prefix: "avatar:", ttl: hours(1), not_found_ttl: mins(5) };
pub const LINK_PREVIEW: Keyspace = Keyspace { prefix: "preview:", ttl: hours(24), not_found_ttl: hours(1) };
pub const SESSION: Keyspace = Keyspace { prefix: "session:", ttl: hours(24), not_found_ttl: mins(1) };
pub const PENDING_CONN: Keyspace = Keyspace { prefix: "pendingconn:", ttl: mins(10), not_found_ttl: mins(1) };
pub const SEARCH: Keyspace = Keyspace { prefix: "search:", ttl: mins(5), not_found_ttl: mins(1) };
pub const THREAD: Keyspace = Keyspace { prefix: "thread:", ttl: mins(2), not_found_ttl: mins(1) };
pub const NOTIFICATION_SEEN: Keyspace = Keyspace { prefix: "notifseen:", ttl: hours(24 * 30), not_found_ttl: mins(1) };
pub const NOTIFICATIONS: Keyspace = Keyspace { prefix: "notif:", ttl: mins(5), not_found_ttl: mins(1) };
pub const DVM_RESULT: Keyspace = Keyspace { prefix: "dvmresult:", ttl: mins(10), not_found_ttl: mins(1) };
pub const DVM_META: Keyspace = Keyspace { prefix: "dvmmeta:", ttl: hours(1), not_found_ttl: mins(5) };
pub const LNURL_PAY: Keyspace = Keyspace { prefix: "lnurlpay:", ttl: hours(1), not_found_ttl: mins(5) };
pub const WALLET_INFO: Keyspace = Keyspace { prefix: "walletinfo:", ttl: mins(30), not_found_ttl: mins(5) };
pub const EVENT_RESULT: Keyspace = Keyspace { prefix: "events:", ttl: Duration::from_secs(60), not_found_ttl: Duration::from_secs(30) };
pub const RELAY_HEALTH: Keyspace = Keyspace { prefix: "relayhealth:", ttl: hours(1), not_found_ttl: mins(1) };
pub const ANON_CSRF: Keyspace = Keyspace { prefix: "anoncsrf:", ttl: mins(5), not_found_ttl: mins(1) };

/// A typed store: one keyspace, one payload type.
pub struct Store<T> {
    backend: Arc<dyn KvBackend>,
    keyspace: Keyspace,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            keyspace: self.keyspace,
            _payload: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Store<T> {
    pub fn new(backend: Arc<dyn KvBackend>, keyspace: Keyspace) -> Self {
        Self {
            backend,
            keyspace,
            _payload: PhantomData,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.keyspace.prefix, key)
    }

    /// Backend or decode errors degrade to a miss.
    pub async fn get(&self, key: &str) -> Option<Cached<T>> {
        let full = self.key(key);
        match self.backend.get(&full).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(cached) => Some(cached),
                Err(e) => {
                    tracing::debug!(key = %full, error = %e, "cache decode failed, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(key = %full, error = %e, "cache backend error, treating as miss");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, payload: T) {
        self.write(key, Cached::hit(payload), self.keyspace.ttl).await;
    }

    /// Record an authoritative absence, on the shorter TTL.
    pub async fn put_not_found(&self, key: &str) {
        self.write(key, Cached::absent(), self.keyspace.not_found_ttl)
            .await;
    }

    pub async fn put_with_ttl(&self, key: &str, payload: T, ttl: Duration) {
        self.write(key, Cached::hit(payload), ttl).await;
    }

    async fn write(&self, key: &str, cached: Cached<T>, ttl: Duration) {
        let full = self.key(key);
        let bytes = match serde_json::to_vec(&cached) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(key = %full, error = %e, "cache encode failed, skipping write");
                return;
            }
        };
        if let Err(e) = self.backend.set(&full, bytes, ttl).await {
            tracing::debug!(key = %full, error = %e, "cache write failed");
        }
    }

    pub async fn delete(&self, key: &str) {
        let full = self.key(key);
        if let Err(e) = self.backend.delete(&full).await {
            tracing::debug!(key = %full, error = %e, "cache delete failed");
        }
    }

    /// Positional multi-get; a backend error reads as all-miss.
    pub async fn get_many(&self, keys: &[String]) -> Vec<Option<Cached<T>>> {
        let full: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        match self.backend.get_multiple(&full).await {
            Ok(values) => values
                .into_iter()
                .map(|v| v.and_then(|bytes| serde_json::from_slice(&bytes).ok()))
                .collect(),
            Err(e) => {
                tracing::debug!(error = %e, "cache multi-get failed, treating as all-miss");
                keys.iter().map(|_| None).collect()
            }
        }
    }

    pub async fn put_many(&self, entries: Vec<(String, T)>) {
        let mut batch = Vec::with_capacity(entries.len());
        for (key, payload) in entries {
            match serde_json::to_vec(&Cached::hit(payload)) {
                Ok(bytes) => batch.push((self.key(&key), bytes)),
                Err(e) => tracing::debug!(error = %e, "cache encode failed, skipping entry"),
            }
        }
        if let Err(e) = self.backend.set_multiple(batch, self.keyspace.ttl).await {
            tracing::debug!(error = %e, "cache multi-write failed");
        }
    }
}

/// Kind-0 profile metadata, as published.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl ProfileMetadata {
    pub fn from_event(event: &Event) -> Option<Self> {
        serde_json::from_str(&event.content).ok()
    }
}

/// NIP-65 relay lists, split by marker.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayList {
    pub read: Vec<String>,
    pub write: Vec<String>,
}

impl RelayList {
    /// Parse a kind-10002 event: `r` tags, optional `read`/`write` marker,
    /// unmarked entries count for both directions.
    pub fn from_event(event: &Event) -> Self {
        let mut list = RelayList::default();
        for tag in &event.tags {
            if tag.first().map(String::as_str) != Some("r") {
                continue;
            }
            let Some(url) = tag.get(1) else { continue };
            match tag.get(2).map(String::as_str) {
                Some("read") => list.read.push(url.clone()),
                Some("write") => list.write.push(url.clone()),
                _ => {
                    list.read.push(url.clone());
                    list.write.push(url.clone());
                }
            }
        }
        list
    }
}

/// Open Graph style preview for an external link.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// LNURL-pay endpoint descriptor (the contract the zap flow consumes).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LnurlPayInfo {
    pub callback: String,
    pub min_sendable: u64,
    pub max_sendable: u64,
    #[serde(default)]
    pub allows_nostr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nostr_pubkey: Option<String>,
}

/// NWC `get_info` result shape.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WalletInfo {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Fan-out result envelope: the merged events plus whether every relay
/// finished streaming before the deadline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventResult {
    pub events: Vec<Event>,
    pub all_eose: bool,
}

/// The process-wide cache plane: one backend, every keyspace.
#[derive(Clone)]
pub struct CachePlane {
    backend: Arc<dyn KvBackend>,
}

impl CachePlane {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn KvBackend> {
        self.backend.clone()
    }

    pub fn profiles(&self) -> Store<ProfileMetadata> {
        Store::new(self.backend.clone(), PROFILE)
    }

    pub fn contacts(&self) -> Store<Vec<PublicKey>> {
        Store::new(self.backend.clone(), CONTACTS)
    }

    pub fn relay_lists(&self) -> Store<RelayList> {
        Store::new(self.backend.clone(), RELAY_LIST)
    }

    pub fn avatars(&self) -> Store<bool> {
        Store::new(self.backend.clone(), AVATAR)
    }

    pub fn link_previews(&self) -> Store<LinkPreview> {
        Store::new(self.backend.clone(), LINK_PREVIEW)
    }

    pub fn search_results(&self) -> Store<Vec<Event>> {
        Store::new(self.backend.clone(), SEARCH)
    }

    pub fn threads(&self) -> Store<Vec<Event>> {
        Store::new(self.backend.clone(), THREAD)
    }

    pub fn notification_seen(&self) -> Store<Timestamp> {
        Store::new(self.backend.clone(), NOTIFICATION_SEEN)
    }

    pub fn notifications(&self) -> Store<Vec<Event>> {
        Store::new(self.backend.clone(), NOTIFICATIONS)
    }

    pub fn dvm_results(&self) -> Store<serde_json::Value> {
        Store::new(self.backend.clone(), DVM_RESULT)
    }

    pub fn dvm_metadata(&self) -> Store<serde_json::Value> {
        Store::new(self.backend.clone(), DVM_META)
    }

    pub fn lnurl_pay(&self) -> Store<LnurlPayInfo> {
        Store::new(self.backend.clone(), LNURL_PAY)
    }

    pub fn wallet_info(&self) -> Store<WalletInfo> {
        Store::new(self.backend.clone(), WALLET_INFO)
    }

    pub fn event_results(&self) -> Store<EventResult> {
        Store::new(self.backend.clone(), EVENT_RESULT)
    }

    /// Stores whose payload type lives in another module (sessions, pending
    /// connections, relay health snapshots) are built through this.
    pub fn store<T: Serialize + DeserializeOwned>(&self, keyspace: Keyspace) -> Store<T> {
        Store::new(self.backend.clone(), keyspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;

    fn plane() -> CachePlane {
        CachePlane::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn hit_and_not_found_are_distinguishable() {
        let store = plane().profiles();
        assert!(store.get("pk1").await.is_none());

        store.put_not_found("pk1").await;
        let cached = store.get("pk1").await.unwrap();
        assert!(cached.not_found);
        assert!(cached.payload.is_none());

        store
            .put(
                "pk1",
                ProfileMetadata {
                    name: Some("alice".into()),
                    ..Default::default()
                },
            )
            .await;
        let cached = store.get("pk1").await.unwrap();
        assert!(!cached.not_found);
        assert_eq!(cached.payload.unwrap().name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn keyspaces_do_not_collide() {
        let plane = plane();
        plane.threads().put("x", vec![]).await;
        assert!(plane.notifications().get("x").await.is_none());
        assert!(plane.threads().get("x").await.is_some());
    }

    #[tokio::test]
    async fn get_many_is_positional() {
        let store = plane().avatars();
        store.put("a", true).await;
        store.put("c", false).await;
        let results = store
            .get_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await;
        assert_eq!(results[0].as_ref().unwrap().payload, Some(true));
        assert!(results[1].is_none());
        assert_eq!(results[2].as_ref().unwrap().payload, Some(false));
    }

    #[test]
    fn relay_list_parses_markers() {
        use crate::types::{Keys, Template, RELAY_LIST as RELAY_LIST_KIND};
        let keys = Keys::generate();
        let event = Template::new(
            RELAY_LIST_KIND,
            "",
            vec![
                vec!["r".into(), "wss://both.example".into()],
                vec!["r".into(), "wss://read.example".into(), "read".into()],
                vec!["r".into(), "wss://write.example".into(), "write".into()],
            ],
        )
        .to_event(&keys)
        .unwrap();
        let list = RelayList::from_event(&event);
        assert_eq!(list.read, vec!["wss://both.example", "wss://read.example"]);
        assert_eq!(list.write, vec!["wss://both.example", "wss://write.example"]);
    }
}
