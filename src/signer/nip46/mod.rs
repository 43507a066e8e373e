//! NIP-46 RPC client and session orchestration.
//!
//! A request is an encrypted `{id, method, params}` body inside a
//! kind-24133 event. Replies come back through the per-relay connections
//! and are matched by request id. Relays are tried in turn, not in
//! parallel, inside one overall request timeout.

pub mod connection;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::time::Instant;

pub use connection::{DiscoveryHook, Nip46Connection, PendingTable};

use super::session::{BunkerSession, PendingConnection, SessionState};
use super::uri::{build_nostrconnect_uri, parse_bunker_uri};
use super::SignerError;
use crate::cache::stores::{PENDING_CONN, SESSION};
use crate::cache::{CachePlane, RateLimiter, Store};
use crate::relays::types::RelayConfig;
use crate::types::{Event, Keys, PublicKey, Template};

#[derive(Clone, Debug)]
pub struct SignerConfig {
    /// Relays offered in `nostrconnect://` URIs.
    pub relays: Vec<String>,
    pub app_name: String,
    pub request_timeout: Duration,
    pub sign_event_limit: u32,
    pub login_limit: u32,
    pub rate_window: Duration,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            relays: vec!["wss://relay.nsec.app".to_string()],
            app_name: "nostr-gateway".to_string(),
            request_timeout: Duration::from_secs(30),
            sign_event_limit: 10,
            login_limit: 5,
            rate_window: Duration::from_secs(60),
        }
    }
}

/// A session's in-memory half: the relay connections it owns and the
/// pending-request table they share. Torn down before the session record
/// is deleted.
struct LiveSession {
    connections: Vec<Arc<Nip46Connection>>,
    pending: Arc<PendingTable>,
}

/// An outstanding `nostrconnect://` listener.
struct Listener {
    connections: Vec<Arc<Nip46Connection>>,
    pending: Arc<PendingTable>,
}

pub struct SignerService {
    config: SignerConfig,
    relay_config: RelayConfig,
    sessions: Store<BunkerSession>,
    pending_store: Store<PendingConnection>,
    rate_limiter: Arc<RateLimiter>,
    live: Mutex<FxHashMap<String, Arc<LiveSession>>>,
    listeners: Mutex<FxHashMap<String, Arc<Listener>>>,
}

impl SignerService {
    pub fn new(cache: &CachePlane, config: SignerConfig, relay_config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            relay_config,
            sessions: cache.store(SESSION),
            pending_store: cache.store(PENDING_CONN),
            rate_limiter: Arc::new(RateLimiter::new(cache.backend())),
            live: Mutex::new(FxHashMap::default()),
            listeners: Mutex::new(FxHashMap::default()),
        })
    }

    pub async fn session(&self, session_id: &str) -> Option<BunkerSession> {
        self.sessions
            .get(session_id)
            .await
            .and_then(|cached| cached.payload)
    }

    pub async fn update_session(&self, session: &BunkerSession) {
        self.sessions.put(&session.session_id, session.clone()).await;
    }

    /// `bunker://` login: the gateway initiates `connect` and resolves the
    /// user pubkey. Rate limited per client IP.
    pub async fn login_with_bunker(
        &self,
        uri: &str,
        client_ip: &str,
    ) -> Result<BunkerSession, SignerError> {
        let decision = self
            .rate_limiter
            .allow(
                &format!("login:{client_ip}"),
                self.config.login_limit,
                self.config.rate_window,
            )
            .await;
        if !decision.allowed {
            return Err(SignerError::RateLimited);
        }

        let parsed = parse_bunker_uri(uri)?;
        let client_keys = Keys::generate();
        let mut session = BunkerSession::new(
            &client_keys,
            parsed.signer_pubkey,
            parsed.relays.clone(),
            parsed.secret.clone(),
        )?;

        let live = self.build_live(&session)?;
        let connect_result = self.run_connect_handshake(&live, &mut session, &parsed.secret).await;
        match connect_result {
            Ok(()) => {
                session.transition(SessionState::Connected)?;
                self.sessions.put(&session.session_id, session.clone()).await;
                self.live
                    .lock()
                    .expect("live sessions lock")
                    .insert(session.session_id.clone(), live);
                Ok(session)
            }
            Err(e) => {
                let _ = session.transition(SessionState::Terminal);
                for conn in &live.connections {
                    conn.close().await;
                }
                Err(e)
            }
        }
    }

    async fn run_connect_handshake(
        &self,
        live: &Arc<LiveSession>,
        session: &mut BunkerSession,
        secret: &Option<String>,
    ) -> Result<(), SignerError> {
        let mut params = vec![Value::from(session.remote_signer_pubkey.to_hex())];
        if let Some(secret) = secret {
            params.push(Value::from(secret.as_str()));
        }
        let result = self.send_request(live, "connect", &params).await?;
        let acked = result == "ack" || secret.as_deref() == Some(result.as_str());
        if !acked {
            return Err(SignerError::UnexpectedResponse(format!(
                "connect answered {result:?}"
            )));
        }

        let user_pubkey_hex = self.send_request(live, "get_public_key", &[]).await?;
        // The user pubkey may differ from the signer's own; never conflate.
        session.user_pubkey = PublicKey::from_hex(user_pubkey_hex.trim_matches('"'))?;
        Ok(())
    }

    /// `nostrconnect://` login: the gateway listens; the signer initiates
    /// by echoing the secret. Returns the URI to display and the pending
    /// connection id the login page polls.
    pub async fn start_nostrconnect(
        self: Arc<Self>,
        client_ip: &str,
    ) -> Result<(String, String), SignerError> {
        let decision = self
            .rate_limiter
            .allow(
                &format!("login:{client_ip}"),
                self.config.login_limit,
                self.config.rate_window,
            )
            .await;
        if !decision.allowed {
            return Err(SignerError::RateLimited);
        }

        let client_keys = Keys::generate();
        let record = PendingConnection::new(&client_keys, self.config.relays.clone());
        self.pending_store
            .put(&record.pending_id, record.clone())
            .await;

        let uri = build_nostrconnect_uri(
            &client_keys,
            &record.relays,
            &record.secret,
            &self.config.app_name,
        );

        let pending = Arc::new(PendingTable::new());
        let (discovered_tx, mut discovered_rx) = tokio::sync::mpsc::channel::<PublicKey>(1);
        let hook: DiscoveryHook = Arc::new(move |signer_pk| {
            let _ = discovered_tx.try_send(signer_pk);
        });

        let mut connections = Vec::new();
        for relay in &record.relays {
            let conn = Arc::new(Nip46Connection::new(
                relay.clone(),
                self.relay_config.clone(),
                client_keys.clone(),
                None,
                pending.clone(),
                Some(record.secret.clone()),
                Some(hook.clone()),
            )?);
            if let Err(e) = conn.clone().ensure_connected().await {
                tracing::debug!(relay = %relay, error = %e, "nostrconnect listener dial failed");
            }
            Nip46Connection::spawn_keepalive(conn.clone());
            connections.push(conn);
        }

        let listener = Arc::new(Listener {
            connections,
            pending: pending.clone(),
        });
        self.listeners
            .lock()
            .expect("listeners lock")
            .insert(record.pending_id.clone(), listener);

        // Promotion: when the signer shows up with the secret, resolve the
        // user pubkey and turn the pending record into a session.
        let service = self.clone();
        let pending_id = record.pending_id.clone();
        tokio::spawn(async move {
            let ttl = crate::cache::stores::PENDING_CONN.ttl;
            let signer_pk = match tokio::time::timeout(ttl, discovered_rx.recv()).await {
                Ok(Some(pk)) => pk,
                _ => {
                    service.drop_listener(&pending_id).await;
                    return;
                }
            };
            if let Err(e) = service.promote_pending(&pending_id, signer_pk).await {
                tracing::warn!(pending = %pending_id, error = %e, "pending connection promotion failed");
                service.drop_listener(&pending_id).await;
            }
        });

        Ok((uri, record.pending_id))
    }

    async fn promote_pending(
        &self,
        pending_id: &str,
        signer_pk: PublicKey,
    ) -> Result<(), SignerError> {
        let mut record = self
            .pending_store
            .get(pending_id)
            .await
            .and_then(|cached| cached.payload)
            .ok_or(SignerError::SessionNotFound)?;

        let listener = self
            .listeners
            .lock()
            .expect("listeners lock")
            .remove(pending_id)
            .ok_or(SignerError::SessionNotFound)?;

        let client_keys = record.client_keys()?;
        let mut session = BunkerSession::new(
            &client_keys,
            signer_pk,
            record.relays.clone(),
            Some(record.secret.clone()),
        )?;

        let live = Arc::new(LiveSession {
            connections: listener.connections.clone(),
            pending: listener.pending.clone(),
        });
        let user_pubkey_hex = self.send_request(&live, "get_public_key", &[]).await?;
        session.user_pubkey = PublicKey::from_hex(user_pubkey_hex.trim_matches('"'))?;
        session.transition(SessionState::Connected)?;

        self.sessions.put(&session.session_id, session.clone()).await;
        self.live
            .lock()
            .expect("live sessions lock")
            .insert(session.session_id.clone(), live);

        record.session_id = Some(session.session_id.clone());
        self.pending_store.put(pending_id, record).await;
        tracing::info!(user = %session.user_pubkey, "nostrconnect session established");
        Ok(())
    }

    async fn drop_listener(&self, pending_id: &str) {
        let listener = self
            .listeners
            .lock()
            .expect("listeners lock")
            .remove(pending_id);
        if let Some(listener) = listener {
            for conn in &listener.connections {
                conn.close().await;
            }
        }
    }

    /// Login-page poll: has the pending connection been promoted?
    pub async fn check_connection(&self, pending_id: &str) -> Option<String> {
        self.pending_store
            .get(pending_id)
            .await
            .and_then(|cached| cached.payload)
            .and_then(|record| record.session_id)
    }

    /// Reconnect with a previously-approved signer: `get_public_key`
    /// directly; success iff the signer still whitelists our client key.
    pub async fn reconnect(&self, session_id: &str) -> Result<BunkerSession, SignerError> {
        let session = self
            .session(session_id)
            .await
            .ok_or(SignerError::SessionNotFound)?;
        let live = self.live_for(&session)?;
        let user_pubkey_hex = self.send_request(&live, "get_public_key", &[]).await?;
        let user_pubkey = PublicKey::from_hex(user_pubkey_hex.trim_matches('"'))?;
        if user_pubkey != session.user_pubkey {
            return Err(SignerError::UnexpectedResponse(
                "signer answered for a different user".into(),
            ));
        }
        Ok(session)
    }

    /// Remote `sign_event`, rate limited per session.
    pub async fn sign_event(
        &self,
        session_id: &str,
        template: &Template,
    ) -> Result<Event, SignerError> {
        let decision = self
            .rate_limiter
            .allow(
                &format!("sign:{session_id}"),
                self.config.sign_event_limit,
                self.config.rate_window,
            )
            .await;
        if !decision.allowed {
            return Err(SignerError::RateLimited);
        }

        let session = self
            .session(session_id)
            .await
            .ok_or(SignerError::SessionNotFound)?;
        if session.state != SessionState::Connected {
            return Err(SignerError::NotConnected);
        }
        let live = self.live_for(&session)?;

        let unsigned = template.to_unsigned_json(&session.user_pubkey);
        let params = [Value::from(unsigned.to_string())];
        let result = self.send_request(&live, "sign_event", &params).await?;

        let event = Event::from_json(&result)?;
        event.verify()?;
        if event.pubkey != session.user_pubkey {
            return Err(SignerError::UnexpectedResponse(
                "signed event has a foreign author".into(),
            ));
        }
        Ok(event)
    }

    pub async fn nip44_encrypt(
        &self,
        session_id: &str,
        counterparty: &PublicKey,
        plaintext: &str,
    ) -> Result<String, SignerError> {
        let session = self
            .session(session_id)
            .await
            .ok_or(SignerError::SessionNotFound)?;
        let live = self.live_for(&session)?;
        let params = [
            Value::from(counterparty.to_hex()),
            Value::from(plaintext),
        ];
        self.send_request(&live, "nip44_encrypt", &params).await
    }

    pub async fn nip44_decrypt(
        &self,
        session_id: &str,
        counterparty: &PublicKey,
        ciphertext: &str,
    ) -> Result<String, SignerError> {
        let session = self
            .session(session_id)
            .await
            .ok_or(SignerError::SessionNotFound)?;
        let live = self.live_for(&session)?;
        let params = [
            Value::from(counterparty.to_hex()),
            Value::from(ciphertext),
        ];
        self.send_request(&live, "nip44_decrypt", &params).await
    }

    /// Logout or TTL expiry: relay connections are torn down first, then
    /// the record goes away.
    pub async fn logout(&self, session_id: &str) {
        let live = self
            .live
            .lock()
            .expect("live sessions lock")
            .remove(session_id);
        if let Some(live) = live {
            for conn in &live.connections {
                conn.close().await;
            }
        }
        if let Some(mut session) = self.session(session_id).await {
            let _ = session.transition(SessionState::Closed);
        }
        self.sessions.delete(session_id).await;
    }

    /// The session's live half, rebuilt on demand (for example after a
    /// process restart with a still-valid session record).
    fn live_for(&self, session: &BunkerSession) -> Result<Arc<LiveSession>, SignerError> {
        let mut live_map = self.live.lock().expect("live sessions lock");
        if let Some(live) = live_map.get(&session.session_id) {
            return Ok(live.clone());
        }
        let live = self.build_live(session)?;
        live_map.insert(session.session_id.clone(), live.clone());
        Ok(live)
    }

    fn build_live(&self, session: &BunkerSession) -> Result<Arc<LiveSession>, SignerError> {
        let client_keys = session.client_keys()?;
        let pending = Arc::new(PendingTable::new());
        let mut connections = Vec::new();
        for relay in &session.relays {
            let conn = Arc::new(Nip46Connection::new(
                relay.clone(),
                self.relay_config.clone(),
                client_keys.clone(),
                Some(session.remote_signer_pubkey),
                pending.clone(),
                None,
                None,
            )?);
            Nip46Connection::spawn_keepalive(conn.clone());
            connections.push(conn);
        }
        Ok(Arc::new(LiveSession {
            connections,
            pending,
        }))
    }

    /// One RPC round: register the pending entry, then write through each
    /// relay in turn until one yields a response inside the request
    /// timeout. The pending entry never survives this function.
    async fn send_request(
        &self,
        live: &Arc<LiveSession>,
        method: &str,
        params: &[Value],
    ) -> Result<String, SignerError> {
        let request_id = crate::utils::random_hex(8);
        let mut rx = live.pending.register(&request_id);
        let deadline = Instant::now() + self.config.request_timeout;

        let total = live.connections.len().max(1);
        for (index, conn) in live.connections.iter().enumerate() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if let Err(e) = conn.clone().ensure_connected().await {
                tracing::debug!(relay = %conn.relay_url(), error = %e, "signer relay unavailable");
                continue;
            }
            if let Err(e) = conn.send_request_event(&request_id, method, params).await {
                tracing::debug!(relay = %conn.relay_url(), error = %e, "signer request write failed");
                continue;
            }

            // Budget slice: remaining time spread over the relays not yet
            // tried, so a silent relay cannot eat the whole timeout.
            let remaining = deadline - now;
            let slice = remaining / (total - index) as u32;
            match tokio::time::timeout(slice, &mut rx).await {
                Ok(Ok(Ok(result))) => {
                    return Ok(result);
                }
                Ok(Ok(Err(message))) => {
                    return Err(SignerError::Rejected(message));
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::debug!(relay = %conn.relay_url(), %method, "no reply inside slice, trying next relay");
                }
            }
        }

        live.pending.remove(&request_id);
        Err(SignerError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePlane, MemoryBackend};

    fn service() -> Arc<SignerService> {
        let cache = CachePlane::new(Arc::new(MemoryBackend::new()));
        // Unreachable test relays must fail fast, not consume the 10 s
        // production dial timeout.
        let relay_config = RelayConfig {
            connect_timeout: Duration::from_millis(50),
            ..RelayConfig::default()
        };
        let signer_config = SignerConfig {
            request_timeout: Duration::from_millis(200),
            ..SignerConfig::default()
        };
        SignerService::new(&cache, signer_config, relay_config)
    }

    async fn connected_session(service: &SignerService) -> BunkerSession {
        let client = Keys::generate();
        let signer = Keys::generate();
        let mut session = BunkerSession::new(
            &client,
            signer.public_key(),
            vec!["ws://127.0.0.1:9".to_string()],
            None,
        )
        .unwrap();
        session.transition(SessionState::Connected).unwrap();
        service.sessions.put(&session.session_id, session.clone()).await;
        session
    }

    #[tokio::test]
    async fn sign_event_rate_limit_is_ten_per_minute() {
        let service = service();
        let session = connected_session(&service).await;
        let template = Template::new(1, "hi", vec![]);

        // Exhaust the budget. Each attempt fails fast (relay is fake and
        // goes into backoff after the first dial), but still counts.
        for _ in 0..10 {
            let result = service.sign_event(&session.session_id, &template).await;
            assert!(!matches!(result, Err(SignerError::RateLimited)));
        }
        let result = service.sign_event(&session.session_id, &template).await;
        assert!(matches!(result, Err(SignerError::RateLimited)));
    }

    #[tokio::test]
    async fn login_rate_limit_is_per_ip() {
        let service = service();
        let uri = format!(
            "bunker://{}?relay=ws://127.0.0.1:9",
            Keys::generate().public_key().to_hex()
        );
        for _ in 0..5 {
            let result = service.login_with_bunker(&uri, "10.0.0.1").await;
            assert!(!matches!(result, Err(SignerError::RateLimited)));
        }
        assert!(matches!(
            service.login_with_bunker(&uri, "10.0.0.1").await,
            Err(SignerError::RateLimited)
        ));
        // A different IP still has budget.
        let result = service.login_with_bunker(&uri, "10.0.0.2").await;
        assert!(!matches!(result, Err(SignerError::RateLimited)));
    }

    #[tokio::test]
    async fn sign_event_requires_a_connected_session() {
        let service = service();
        let template = Template::new(1, "hi", vec![]);
        assert!(matches!(
            service.sign_event("missing", &template).await,
            Err(SignerError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn logout_tears_down_live_state_and_record() {
        let service = service();
        let session = connected_session(&service).await;
        // Materialize the live half.
        let _ = service.live_for(&session);
        assert!(service.live.lock().unwrap().contains_key(&session.session_id));

        service.logout(&session.session_id).await;
        assert!(!service.live.lock().unwrap().contains_key(&session.session_id));
        assert!(service.session(&session.session_id).await.is_none());
    }

    #[tokio::test]
    async fn pending_entries_do_not_leak_on_timeout() {
        let service = service();
        let session = connected_session(&service).await;
        let live = service.live_for(&session).unwrap();
        // The fake relay cannot answer; the request must time out quickly
        // because every connection fails to dial.
        let result = service.send_request(&live, "get_public_key", &[]).await;
        assert!(result.is_err());
        assert!(live.pending.is_empty());
    }

    #[tokio::test]
    async fn check_connection_reports_promotion() {
        let service = service();
        let keys = Keys::generate();
        let mut record = PendingConnection::new(&keys, vec![]);
        service
            .pending_store
            .put(&record.pending_id, record.clone())
            .await;
        assert_eq!(service.check_connection(&record.pending_id).await, None);

        record.session_id = Some("sess123".to_string());
        service
            .pending_store
            .put(&record.pending_id, record.clone())
            .await;
        assert_eq!(
            service.check_connection(&record.pending_id).await,
            Some("sess123".to_string())
        );
    }
}
