//! A single relay connection: one WebSocket, one writer mutex, one reader
//! task, one ping task.
//!
//! Signature validation happens here, at ingress: no component above the
//! pool ever observes an unverified event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::health::HealthRegistry;
use super::mailbox::MailboxSender;
use super::types::{
    ClientMessage, OkResult, RelayConfig, RelayError, RelayMessage, SubscriptionUpdate,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

struct SubEntry {
    senders: Vec<MailboxSender<SubscriptionUpdate>>,
    started: Instant,
    /// Latency is sampled once, on the first EVENT or EOSE for the sub.
    first_response_seen: bool,
}

pub struct RelayConnection {
    url: String,
    config: RelayConfig,
    health: Arc<HealthRegistry>,
    status: RwLock<ConnectionStatus>,
    /// All outbound frames serialize through this one mutex.
    sink: tokio::sync::Mutex<Option<WsSink>>,
    subscriptions: Mutex<FxHashMap<String, SubEntry>>,
    pending_oks: Mutex<FxHashMap<String, Vec<oneshot::Sender<OkResult>>>>,
    /// Serializes dial attempts so concurrent callers share one socket.
    dial_gate: tokio::sync::Mutex<()>,
    /// Bumped on every dial; stale reader/ping tasks see the mismatch and
    /// stop without touching the new connection.
    epoch: AtomicU64,
}

impl RelayConnection {
    pub fn new(url: String, config: RelayConfig, health: Arc<HealthRegistry>) -> Self {
        Self {
            url,
            config,
            health,
            status: RwLock::new(ConnectionStatus::Disconnected),
            sink: tokio::sync::Mutex::new(None),
            subscriptions: Mutex::new(FxHashMap::default()),
            pending_oks: Mutex::new(FxHashMap::default()),
            dial_gate: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().expect("status lock")
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().expect("subscriptions lock").len()
    }

    /// Dial if necessary. Concurrent callers are serialized behind the dial
    /// gate; only the first one opens a socket.
    pub async fn ensure_connected(self: Arc<Self>) -> Result<(), RelayError> {
        if self.status().is_connected() {
            return Ok(());
        }
        let _gate = self.dial_gate.lock().await;
        if self.status().is_connected() {
            return Ok(());
        }

        *self.status.write().expect("status lock") = ConnectionStatus::Connecting;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let dial =
            tokio::time::timeout(self.config.connect_timeout, connect_async(self.url.as_str()));
        let stream = match dial.await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                *self.status.write().expect("status lock") = ConnectionStatus::Failed;
                self.health.record_failure(&self.url);
                return Err(RelayError::WebSocket(e.to_string()));
            }
            Err(_) => {
                *self.status.write().expect("status lock") = ConnectionStatus::Failed;
                self.health.record_failure(&self.url);
                return Err(RelayError::Timeout);
            }
        };

        let (sink, source) = stream.split();
        *self.sink.lock().await = Some(sink);
        *self.status.write().expect("status lock") = ConnectionStatus::Connected;

        Self::spawn_reader(self.clone(), source, epoch);
        Self::spawn_ping(self.clone(), epoch);

        tracing::debug!(relay = %self.url, "connected");
        Ok(())
    }

    fn spawn_reader(conn: Arc<Self>, mut source: WsSource, epoch: u64) {
        tokio::spawn(async move {
            loop {
                let frame = tokio::time::timeout(conn.config.read_deadline, source.next()).await;
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => conn.handle_frame(&text).await,
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        let _ = conn.send_raw(Message::Pong(payload)).await;
                    }
                    Ok(Some(Ok(Message::Pong(_)))) => {}
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        tracing::warn!(relay = %conn.url, "unexpected binary frame");
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        tracing::debug!(relay = %conn.url, "relay closed the connection");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        tracing::warn!(relay = %conn.url, error = %e, "websocket read error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(relay = %conn.url, "read deadline exceeded");
                        break;
                    }
                }
            }
            conn.teardown(epoch).await;
        });
    }

    fn spawn_ping(conn: Arc<Self>, epoch: u64) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conn.config.ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if conn.epoch.load(Ordering::SeqCst) != epoch || !conn.status().is_connected() {
                    break;
                }
                if conn.send_raw(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Route one inbound frame. Public within the crate so the routing
    /// logic is testable without a live socket.
    pub(crate) async fn handle_frame(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(relay = %self.url, error = %e, "malformed relay frame");
                return;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                // Verified once, here. Invalid events vanish.
                if let Err(e) = event.verify() {
                    tracing::warn!(relay = %self.url, error = %e, "dropping event with invalid signature");
                    return;
                }
                self.note_response(&subscription_id);
                let senders = {
                    let subs = self.subscriptions.lock().expect("subscriptions lock");
                    subs.get(&subscription_id)
                        .map(|entry| entry.senders.clone())
                        .unwrap_or_default()
                };
                for sender in senders {
                    if sender.send(SubscriptionUpdate::Event(event.clone())).is_some() {
                        tracing::debug!(relay = %self.url, sub = %subscription_id, "mailbox full, displaced oldest");
                    }
                }
            }
            RelayMessage::Eose { subscription_id } => {
                self.note_response(&subscription_id);
                let senders = {
                    let subs = self.subscriptions.lock().expect("subscriptions lock");
                    subs.get(&subscription_id)
                        .map(|entry| entry.senders.clone())
                        .unwrap_or_default()
                };
                for sender in senders {
                    sender.send(SubscriptionUpdate::Eose);
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let waiters = self
                    .pending_oks
                    .lock()
                    .expect("pending oks lock")
                    .remove(&event_id);
                if let Some(waiters) = waiters {
                    for waiter in waiters {
                        let _ = waiter.send(OkResult {
                            accepted,
                            message: message.clone(),
                        });
                    }
                } else {
                    tracing::debug!(relay = %self.url, event = %event_id, "OK for unknown publish");
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                let entry = self
                    .subscriptions
                    .lock()
                    .expect("subscriptions lock")
                    .remove(&subscription_id);
                if let Some(entry) = entry {
                    for sender in entry.senders {
                        sender.send(SubscriptionUpdate::Closed(message.clone()));
                        sender.close();
                    }
                }
            }
            RelayMessage::Notice { message } => {
                tracing::info!(relay = %self.url, notice = %message, "relay notice");
            }
            RelayMessage::Auth { .. } => {
                tracing::debug!(relay = %self.url, "AUTH challenge ignored");
            }
        }
    }

    fn note_response(&self, subscription_id: &str) {
        let mut subs = self.subscriptions.lock().expect("subscriptions lock");
        if let Some(entry) = subs.get_mut(subscription_id) {
            if !entry.first_response_seen {
                entry.first_response_seen = true;
                let elapsed_ms = entry.started.elapsed().as_secs_f64() * 1000.0;
                drop(subs);
                self.health.record_success(&self.url, elapsed_ms);
            }
        }
    }

    /// Register a mailbox and issue the REQ.
    pub async fn subscribe(
        &self,
        subscription_id: &str,
        filters: Vec<crate::types::Filter>,
        sender: MailboxSender<SubscriptionUpdate>,
    ) -> Result<(), RelayError> {
        {
            let mut subs = self.subscriptions.lock().expect("subscriptions lock");
            let entry = subs.entry(subscription_id.to_string()).or_insert(SubEntry {
                senders: Vec::new(),
                started: Instant::now(),
                first_response_seen: false,
            });
            entry.senders.push(sender);
            // Only the first requester for this (relay, sub id) sends REQ.
            if entry.senders.len() > 1 {
                return Ok(());
            }
        }
        let frame = ClientMessage::req(subscription_id, filters);
        if let Err(e) = self.send(frame).await {
            self.subscriptions
                .lock()
                .expect("subscriptions lock")
                .remove(subscription_id);
            return Err(e);
        }
        Ok(())
    }

    /// Send CLOSE and drop the mailbox record.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        let removed = self
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .remove(subscription_id);
        if let Some(entry) = removed {
            for sender in entry.senders {
                sender.close();
            }
            let _ = self.send(ClientMessage::close(subscription_id)).await;
        }
    }

    /// Register interest in the relay's OK for an event about to be sent.
    pub fn register_ok(&self, event_id: &str) -> oneshot::Receiver<OkResult> {
        let (tx, rx) = oneshot::channel();
        self.pending_oks
            .lock()
            .expect("pending oks lock")
            .entry(event_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn discard_ok(&self, event_id: &str) {
        self.pending_oks
            .lock()
            .expect("pending oks lock")
            .remove(event_id);
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        let json = message.to_json()?;
        self.send_raw(Message::Text(json)).await
    }

    async fn send_raw(&self, message: Message) -> Result<(), RelayError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(RelayError::ConnectionClosed)?;
        if let Err(e) = sink.send(message).await {
            tracing::warn!(relay = %self.url, error = %e, "write failed, marking connection failed");
            *guard = None;
            *self.status.write().expect("status lock") = ConnectionStatus::Failed;
            self.health.record_failure(&self.url);
            return Err(RelayError::ConnectionClosed);
        }
        Ok(())
    }

    /// Reader exit path: mark unhealthy, close every mailbox with the
    /// sentinel, fail pending OKs. A stale epoch means a newer connection
    /// already took over and nothing is touched.
    async fn teardown(&self, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        *self.status.write().expect("status lock") = ConnectionStatus::Failed;
        *self.sink.lock().await = None;
        self.health.record_failure(&self.url);

        let entries: Vec<SubEntry> = {
            let mut subs = self.subscriptions.lock().expect("subscriptions lock");
            subs.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            for sender in entry.senders {
                sender.close();
            }
        }
        // Dropping the oneshot senders delivers the failure to waiters.
        self.pending_oks.lock().expect("pending oks lock").clear();
        tracing::debug!(relay = %self.url, "connection torn down");
    }

    pub async fn close(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.status.write().expect("status lock") = ConnectionStatus::Closed;
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        let entries: Vec<SubEntry> = {
            let mut subs = self.subscriptions.lock().expect("subscriptions lock");
            subs.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            for sender in entry.senders {
                sender.close();
            }
        }
        self.pending_oks.lock().expect("pending oks lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relays::mailbox;
    use crate::types::{Keys, Template, TEXT_NOTE};

    fn test_connection() -> Arc<RelayConnection> {
        Arc::new(RelayConnection::new(
            "wss://relay.example.com".to_string(),
            RelayConfig::default(),
            Arc::new(HealthRegistry::new()),
        ))
    }

    fn register(conn: &RelayConnection, sub: &str) -> super::super::MailboxReceiver<SubscriptionUpdate> {
        let (tx, rx) = mailbox::mailbox(16);
        let mut subs = conn.subscriptions.lock().unwrap();
        subs.insert(
            sub.to_string(),
            SubEntry {
                senders: vec![tx],
                started: Instant::now(),
                first_response_seen: false,
            },
        );
        rx
    }

    #[tokio::test]
    async fn verified_events_are_routed_to_the_mailbox() {
        let conn = test_connection();
        let mut rx = register(&conn, "sub1");

        let keys = Keys::generate();
        let event = Template::new(TEXT_NOTE, "hello", vec![]).to_event(&keys).unwrap();
        let frame = format!(r#"["EVENT","sub1",{}]"#, event.as_json());
        conn.handle_frame(&frame).await;

        match rx.recv().await {
            Some(SubscriptionUpdate::Event(received)) => assert_eq!(received.id, event.id),
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_signature_is_dropped_at_ingress() {
        let conn = test_connection();
        let mut rx = register(&conn, "sub1");

        let keys = Keys::generate();
        let mut event = Template::new(TEXT_NOTE, "hello", vec![]).to_event(&keys).unwrap();
        event.content = "tampered".to_string();
        let frame = format!(r#"["EVENT","sub1",{}]"#, event.as_json());
        conn.handle_frame(&frame).await;

        // EOSE afterwards proves the event really was dropped, not delayed.
        conn.handle_frame(r#"["EOSE","sub1"]"#).await;
        assert!(matches!(rx.recv().await, Some(SubscriptionUpdate::Eose)));
    }

    #[tokio::test]
    async fn events_for_unknown_subscriptions_are_ignored() {
        let conn = test_connection();
        let mut rx = register(&conn, "sub1");

        let keys = Keys::generate();
        let event = Template::new(TEXT_NOTE, "stray", vec![]).to_event(&keys).unwrap();
        let frame = format!(r#"["EVENT","other",{}]"#, event.as_json());
        conn.handle_frame(&frame).await;
        conn.handle_frame(r#"["EOSE","sub1"]"#).await;
        assert!(matches!(rx.recv().await, Some(SubscriptionUpdate::Eose)));
    }

    #[tokio::test]
    async fn ok_frames_reach_registered_waiters() {
        let conn = test_connection();
        let rx = conn.register_ok("abc123");
        conn.handle_frame(r#"["OK","abc123",true,"stored"]"#).await;
        let result = rx.await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.message, "stored");
        // Entry is removed after completion.
        assert!(conn.pending_oks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_frame_tears_down_the_mailbox() {
        let conn = test_connection();
        let mut rx = register(&conn, "sub1");
        conn.handle_frame(r#"["CLOSED","sub1","rate limited"]"#).await;
        match rx.recv().await {
            Some(SubscriptionUpdate::Closed(reason)) => assert_eq!(reason, "rate limited"),
            other => panic!("unexpected update: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn first_response_records_health_once() {
        let conn = test_connection();
        let _rx = register(&conn, "sub1");
        conn.handle_frame(r#"["EOSE","sub1"]"#).await;
        conn.handle_frame(r#"["EOSE","sub1"]"#).await;
        let health = conn.health.get("wss://relay.example.com").unwrap();
        assert_eq!(health.response_count, 1);
    }

    #[tokio::test]
    async fn teardown_fails_pending_oks_and_closes_mailboxes() {
        let conn = test_connection();
        let mut rx = register(&conn, "sub1");
        let ok_rx = conn.register_ok("abc");
        let epoch = conn.epoch.load(Ordering::SeqCst);
        conn.teardown(epoch).await;

        assert!(ok_rx.await.is_err());
        assert!(rx.recv().await.is_none());
        assert!(conn.health.in_backoff("wss://relay.example.com"));
    }

    #[tokio::test]
    async fn stale_epoch_teardown_is_a_no_op() {
        let conn = test_connection();
        let _rx = register(&conn, "sub1");
        conn.epoch.store(5, Ordering::SeqCst);
        conn.teardown(4).await;
        assert_eq!(conn.subscription_count(), 1);
    }
}
