//! Persistent per-(session, relay) signer connection.
//!
//! Each connection keeps one WebSocket, one REQ for kind-24133 events
//! addressed to the client pubkey, a ping task, and a reconnect backoff
//! with the same shape as the relay pool's. Replies are routed by request
//! id through the session's pending-request table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::crypto::nip44::ConversationKey;
use crate::crypto::{nip04, nip44};
use crate::relays::health::RelayHealth;
use crate::relays::types::{RelayConfig, RelayError, RelayMessage};
use crate::signer::SignerError;
use crate::types::{Keys, PublicKey, Template, NOSTR_CONNECT};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How far back the REQ looks for responses on (re)connect.
const SUBSCRIBE_LOOKBACK_SECS: i64 = 10;

/// One reply per request id. The slot is single-use: a second delivery (or
/// a reply to a cancelled request) is dropped on the floor.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<FxHashMap<String, oneshot::Sender<Result<String, String>>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Result<String, String>> {
        let (tx, rx) = oneshot::channel();
        self.entries
            .lock()
            .expect("pending table lock")
            .insert(request_id.to_string(), tx);
        rx
    }

    /// Deliver a reply. Unknown ids (cancelled or duplicate) are discarded.
    pub fn complete(&self, request_id: &str, outcome: Result<String, String>) {
        let entry = self
            .entries
            .lock()
            .expect("pending table lock")
            .remove(request_id);
        match entry {
            Some(slot) => {
                if slot.send(outcome).is_err() {
                    tracing::debug!(request = %request_id, "reply slot already abandoned");
                }
            }
            None => {
                tracing::debug!(request = %request_id, "late reply for unknown request, discarded");
            }
        }
    }

    /// Cancellation path: the entry must not leak.
    pub fn remove(&self, request_id: &str) {
        self.entries
            .lock()
            .expect("pending table lock")
            .remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pending table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Invoked when a `nostrconnect://` listener sees the expected secret.
pub type DiscoveryHook = Arc<dyn Fn(PublicKey) + Send + Sync>;

pub struct Nip46Connection {
    relay_url: String,
    config: RelayConfig,
    client_keys: Keys,
    /// Known upfront for bunker sessions; discovered for nostrconnect.
    remote_pubkey: RwLock<Option<PublicKey>>,
    /// Cached once the counterparty is known.
    conversation: RwLock<Option<ConversationKey>>,
    /// Secret a nostrconnect listener expects back from the signer.
    expected_secret: Option<String>,
    discovery: Option<DiscoveryHook>,
    pending: Arc<PendingTable>,
    subscription_id: String,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    connected: std::sync::atomic::AtomicBool,
    dial_gate: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    backoff: Mutex<RelayHealth>,
}

impl Nip46Connection {
    pub fn new(
        relay_url: String,
        config: RelayConfig,
        client_keys: Keys,
        remote_pubkey: Option<PublicKey>,
        pending: Arc<PendingTable>,
        expected_secret: Option<String>,
        discovery: Option<DiscoveryHook>,
    ) -> Result<Self, SignerError> {
        let conversation = match &remote_pubkey {
            Some(pk) => Some(ConversationKey::derive(&client_keys.secret_key, pk)?),
            None => None,
        };
        Ok(Self {
            relay_url,
            config,
            client_keys,
            remote_pubkey: RwLock::new(remote_pubkey),
            conversation: RwLock::new(conversation),
            expected_secret,
            discovery,
            pending,
            subscription_id: crate::utils::random_sub_id(),
            sink: tokio::sync::Mutex::new(None),
            connected: std::sync::atomic::AtomicBool::new(false),
            dial_gate: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            backoff: Mutex::new(RelayHealth::default()),
        })
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn remote_pubkey(&self) -> Option<PublicKey> {
        *self.remote_pubkey.read().expect("remote pubkey lock")
    }

    fn in_backoff(&self) -> bool {
        self.backoff.lock().expect("backoff lock").in_backoff()
    }

    /// Dial, subscribe for responses, start reader and ping tasks.
    pub async fn ensure_connected(self: Arc<Self>) -> Result<(), SignerError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.in_backoff() {
            return Err(SignerError::Relay(RelayError::BackingOff));
        }
        let _gate = self.dial_gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let dial = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(self.relay_url.as_str()),
        );
        let stream = match dial.await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                self.backoff.lock().expect("backoff lock").record_failure();
                return Err(SignerError::Relay(RelayError::WebSocket(e.to_string())));
            }
            Err(_) => {
                self.backoff.lock().expect("backoff lock").record_failure();
                return Err(SignerError::Relay(RelayError::Timeout));
            }
        };

        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::Release);

        // REQ for kind 24133 addressed to us, with a short lookback so a
        // reconnect replays responses sent while we were away.
        let since = crate::utils::now() - SUBSCRIBE_LOOKBACK_SECS;
        let filter = serde_json::json!({
            "kinds": [NOSTR_CONNECT],
            "#p": [self.client_keys.public_key().to_hex()],
            "since": since,
        });
        let req = format!(r#"["REQ","{}",{}]"#, self.subscription_id, filter);
        self.send_text(&req).await?;

        self.backoff
            .lock()
            .expect("backoff lock")
            .record_success(0.0);
        Self::spawn_reader(self.clone(), source, epoch);
        Self::spawn_ping(self.clone(), epoch);
        tracing::debug!(relay = %self.relay_url, "signer connection open");
        Ok(())
    }

    /// Keep the connection alive across relay restarts. Used for
    /// `nostrconnect://` listeners and long-lived session connections.
    pub fn spawn_keepalive(conn: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                if Arc::strong_count(&conn) == 1 {
                    // Session dropped the connection; stop maintaining it.
                    break;
                }
                if !conn.is_connected() && !conn.in_backoff() {
                    if let Err(e) = conn.clone().ensure_connected().await {
                        tracing::debug!(relay = %conn.relay_url, error = %e, "signer reconnect failed");
                    }
                }
            }
        });
    }

    fn spawn_reader(conn: Arc<Self>, mut source: WsSource, epoch: u64) {
        tokio::spawn(async move {
            loop {
                let frame = tokio::time::timeout(conn.config.read_deadline, source.next()).await;
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => conn.handle_frame(&text),
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        let _ = conn.send_raw(Message::Pong(payload)).await;
                    }
                    Ok(Some(Ok(Message::Pong(_)))) => {}
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        tracing::debug!(relay = %conn.relay_url, error = %e, "signer read error");
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(relay = %conn.relay_url, "signer read deadline exceeded");
                        break;
                    }
                }
            }
            if conn.epoch.load(Ordering::SeqCst) == epoch {
                conn.connected.store(false, Ordering::Release);
                *conn.sink.lock().await = None;
                conn.backoff.lock().expect("backoff lock").record_failure();
            }
        });
    }

    fn spawn_ping(conn: Arc<Self>, epoch: u64) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conn.config.ping_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if conn.epoch.load(Ordering::SeqCst) != epoch || !conn.is_connected() {
                    break;
                }
                if conn.send_raw(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Route one frame from the relay. Crate-visible for loopback tests.
    pub(crate) fn handle_frame(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(relay = %self.relay_url, error = %e, "unparseable signer frame");
                return;
            }
        };
        let event = match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if subscription_id != self.subscription_id {
                    return;
                }
                event
            }
            RelayMessage::Eose { .. } => return,
            RelayMessage::Closed { message, .. } => {
                tracing::debug!(relay = %self.relay_url, %message, "signer subscription closed");
                return;
            }
            RelayMessage::Notice { message } => {
                tracing::info!(relay = %self.relay_url, notice = %message, "signer relay notice");
                return;
            }
            _ => return,
        };

        if event.verify().is_err() {
            tracing::warn!(relay = %self.relay_url, "dropping signer event with invalid signature");
            return;
        }
        if event.kind != NOSTR_CONNECT {
            return;
        }
        let ours = self.client_keys.public_key().to_hex();
        if !event.tag_values("p").any(|p| p == ours) {
            return;
        }

        let plaintext = match self.decrypt_from(&event.pubkey, &event.content) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::debug!(relay = %self.relay_url, error = %e, "signer payload decrypt failed");
                return;
            }
        };
        self.process_rpc_response(&event.pubkey, &plaintext);
    }

    /// NIP-44 first, NIP-04 as the legacy fallback. In discovery mode the
    /// counterparty is whoever authored the event.
    fn decrypt_from(&self, sender: &PublicKey, ciphertext: &str) -> Result<String, SignerError> {
        let conversation = match *self.conversation.read().expect("conversation lock") {
            Some(key) => key,
            None => ConversationKey::derive(&self.client_keys.secret_key, sender)?,
        };
        match nip44::decrypt(ciphertext, &conversation) {
            Ok(plaintext) => Ok(plaintext),
            Err(nip44_err) => {
                tracing::debug!(error = %nip44_err, "nip44 decrypt failed, trying nip04");
                nip04::decrypt(&self.client_keys.secret_key, sender, ciphertext)
                    .map_err(SignerError::Crypto)
            }
        }
    }

    fn process_rpc_response(&self, sender: &PublicKey, plaintext: &str) {
        let rpc: Value = match serde_json::from_str(plaintext) {
            Ok(rpc) => rpc,
            Err(e) => {
                tracing::debug!(error = %e, "signer body is not JSON");
                return;
            }
        };
        let request_id = rpc
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let error = rpc.get("error").and_then(Value::as_str).map(str::to_string);
        let result = rpc
            .get("result")
            .map(|v| match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            })
            .unwrap_or_default();

        // nostrconnect discovery: the signer introduces itself by echoing
        // the expected secret.
        if let (Some(expected), None) = (&self.expected_secret, self.remote_pubkey()) {
            if error.is_none() && &result == expected {
                tracing::info!(signer = %sender, "remote signer discovered");
                *self.remote_pubkey.write().expect("remote pubkey lock") = Some(*sender);
                if let Ok(key) = ConversationKey::derive(&self.client_keys.secret_key, sender) {
                    *self.conversation.write().expect("conversation lock") = Some(key);
                }
                if let Some(hook) = &self.discovery {
                    hook(*sender);
                }
                self.pending.complete(&request_id, Ok(result));
                return;
            }
        }

        match error {
            Some(message) => self.pending.complete(&request_id, Err(message)),
            None => self.pending.complete(&request_id, Ok(result)),
        }
    }

    /// Author, encrypt and send one request event. The caller has already
    /// registered the pending entry.
    pub async fn send_request_event(
        &self,
        request_id: &str,
        method: &str,
        params: &[Value],
    ) -> Result<(), SignerError> {
        let remote = self
            .remote_pubkey()
            .ok_or(SignerError::NotConnected)?;
        let conversation = self
            .conversation
            .read()
            .expect("conversation lock")
            .ok_or(SignerError::NotConnected)?;

        let body = serde_json::json!({
            "id": request_id,
            "method": method,
            "params": params,
        });
        let ciphertext = nip44::encrypt(&body.to_string(), &conversation)?;
        let event = Template::new(
            NOSTR_CONNECT,
            ciphertext,
            vec![vec!["p".to_string(), remote.to_hex()]],
        )
        .to_event(&self.client_keys)?;

        let frame = format!(r#"["EVENT",{}]"#, event.as_json());
        self.send_text(&frame).await
    }

    async fn send_text(&self, text: &str) -> Result<(), SignerError> {
        self.send_raw(Message::Text(text.to_string())).await
    }

    async fn send_raw(&self, message: Message) -> Result<(), SignerError> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or(SignerError::Relay(RelayError::ConnectionClosed))?;
        if let Err(e) = sink.send(message).await {
            tracing::debug!(relay = %self.relay_url, error = %e, "signer write failed");
            *guard = None;
            self.connected.store(false, Ordering::Release);
            self.backoff.lock().expect("backoff lock").record_failure();
            return Err(SignerError::Relay(RelayError::ConnectionClosed));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::Release);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn subscription_id_for_tests(&self) -> &str {
        &self.subscription_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Keys, TEXT_NOTE};

    fn connection(
        client: &Keys,
        remote: Option<PublicKey>,
        pending: Arc<PendingTable>,
        expected_secret: Option<String>,
        discovery: Option<DiscoveryHook>,
    ) -> Arc<Nip46Connection> {
        Arc::new(
            Nip46Connection::new(
                "wss://signer-relay.example".to_string(),
                RelayConfig::default(),
                client.clone(),
                remote,
                pending,
                expected_secret,
                discovery,
            )
            .unwrap(),
        )
    }

    fn signer_response_frame(
        signer: &Keys,
        client_pk: &PublicKey,
        sub_id: &str,
        body: &Value,
    ) -> String {
        let conversation =
            ConversationKey::derive(&signer.secret_key, client_pk).unwrap();
        let ciphertext = nip44::encrypt(&body.to_string(), &conversation).unwrap();
        let event = Template::new(
            NOSTR_CONNECT,
            ciphertext,
            vec![vec!["p".to_string(), client_pk.to_hex()]],
        )
        .to_event(signer)
        .unwrap();
        format!(r#"["EVENT","{}",{}]"#, sub_id, event.as_json())
    }

    #[tokio::test]
    async fn reply_is_routed_by_request_id_and_entry_removed() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let pending = Arc::new(PendingTable::new());
        let conn = connection(&client, Some(signer.public_key()), pending.clone(), None, None);

        let rx = pending.register("req-1");
        let body = serde_json::json!({"id": "req-1", "result": "ack"});
        let frame = signer_response_frame(
            &signer,
            &client.public_key(),
            conn.subscription_id_for_tests(),
            &body,
        );
        conn.handle_frame(&frame);

        assert_eq!(rx.await.unwrap(), Ok("ack".to_string()));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn error_bodies_deliver_the_signer_message() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let pending = Arc::new(PendingTable::new());
        let conn = connection(&client, Some(signer.public_key()), pending.clone(), None, None);

        let rx = pending.register("req-2");
        let body = serde_json::json!({"id": "req-2", "error": "user rejected"});
        let frame = signer_response_frame(
            &signer,
            &client.public_key(),
            conn.subscription_id_for_tests(),
            &body,
        );
        conn.handle_frame(&frame);
        assert_eq!(rx.await.unwrap(), Err("user rejected".to_string()));
    }

    #[tokio::test]
    async fn late_replies_to_cancelled_requests_are_discarded() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let pending = Arc::new(PendingTable::new());
        let conn = connection(&client, Some(signer.public_key()), pending.clone(), None, None);

        let rx = pending.register("req-3");
        pending.remove("req-3"); // cancellation
        drop(rx);

        let body = serde_json::json!({"id": "req-3", "result": "ack"});
        let frame = signer_response_frame(
            &signer,
            &client.public_key(),
            conn.subscription_id_for_tests(),
            &body,
        );
        conn.handle_frame(&frame);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn events_not_addressed_to_us_are_ignored() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let someone_else = Keys::generate();
        let pending = Arc::new(PendingTable::new());
        let conn = connection(&client, Some(signer.public_key()), pending.clone(), None, None);

        let rx = pending.register("req-4");
        let body = serde_json::json!({"id": "req-4", "result": "ack"});
        // Addressed to a different pubkey.
        let frame = signer_response_frame(
            &signer,
            &someone_else.public_key(),
            conn.subscription_id_for_tests(),
            &body,
        );
        conn.handle_frame(&frame);
        assert_eq!(pending.len(), 1);
        drop(rx);
    }

    #[tokio::test]
    async fn wrong_kind_events_are_ignored() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let pending = Arc::new(PendingTable::new());
        let conn = connection(&client, Some(signer.public_key()), pending.clone(), None, None);

        let _rx = pending.register("req-5");
        let event = Template::new(TEXT_NOTE, "not an rpc", vec![])
            .to_event(&signer)
            .unwrap();
        let frame = format!(
            r#"["EVENT","{}",{}]"#,
            conn.subscription_id_for_tests(),
            event.as_json()
        );
        conn.handle_frame(&frame);
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn nostrconnect_secret_discovers_the_signer() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let pending = Arc::new(PendingTable::new());
        let (hook_tx, hook_rx) = std::sync::mpsc::channel();
        let hook: DiscoveryHook = Arc::new(move |pk| {
            let _ = hook_tx.send(pk);
        });
        let conn = connection(
            &client,
            None,
            pending.clone(),
            Some("expected-secret".to_string()),
            Some(hook),
        );
        assert!(conn.remote_pubkey().is_none());

        let body = serde_json::json!({"id": "conn-1", "result": "expected-secret"});
        let frame = signer_response_frame(
            &signer,
            &client.public_key(),
            conn.subscription_id_for_tests(),
            &body,
        );
        conn.handle_frame(&frame);

        assert_eq!(conn.remote_pubkey(), Some(signer.public_key()));
        assert_eq!(hook_rx.try_recv().unwrap(), signer.public_key());
    }

    #[tokio::test]
    async fn wrong_secret_does_not_discover() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let pending = Arc::new(PendingTable::new());
        let conn = connection(
            &client,
            None,
            pending.clone(),
            Some("expected-secret".to_string()),
            None,
        );

        let body = serde_json::json!({"id": "conn-1", "result": "forged"});
        let frame = signer_response_frame(
            &signer,
            &client.public_key(),
            conn.subscription_id_for_tests(),
            &body,
        );
        conn.handle_frame(&frame);
        assert!(conn.remote_pubkey().is_none());
    }

    #[tokio::test]
    async fn nip04_fallback_decrypts_legacy_signers() {
        let client = Keys::generate();
        let signer = Keys::generate();
        let pending = Arc::new(PendingTable::new());
        let conn = connection(&client, Some(signer.public_key()), pending.clone(), None, None);

        let rx = pending.register("req-6");
        let body = serde_json::json!({"id": "req-6", "result": "legacy-ack"});
        let ciphertext =
            nip04::encrypt(&signer.secret_key, &client.public_key(), &body.to_string()).unwrap();
        let event = Template::new(
            NOSTR_CONNECT,
            ciphertext,
            vec![vec!["p".to_string(), client.public_key().to_hex()]],
        )
        .to_event(&signer)
        .unwrap();
        let frame = format!(
            r#"["EVENT","{}",{}]"#,
            conn.subscription_id_for_tests(),
            event.as_json()
        );
        conn.handle_frame(&frame);
        assert_eq!(rx.await.unwrap(), Ok("legacy-ack".to_string()));
    }
}
