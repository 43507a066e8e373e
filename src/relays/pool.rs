//! The relay pool: at most one WebSocket per relay URL, shared by every
//! subscriber in the process.
//!
//! New subscribers attach a mailbox to the existing connection; the pool
//! never opens a second socket for the same URL even under concurrent
//! `subscribe` calls. While a relay's `backoff_until` is in the future,
//! `subscribe` returns immediately without dialing.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use super::connection::RelayConnection;
use super::health::HealthRegistry;
use super::mailbox::{mailbox, MailboxReceiver, MailboxSender};
use super::types::{ClientMessage, OkResult, RelayConfig, RelayError, SubscriptionUpdate};
use super::utils::{normalize_relay_url, validate_relay_url};
use crate::types::{Event, Filter};

pub struct RelayPool {
    // Read volume dominates: lookups on every subscribe/publish, inserts
    // only on first contact with a relay.
    connections: RwLock<FxHashMap<String, Arc<RelayConnection>>>,
    health: Arc<HealthRegistry>,
    config: RelayConfig,
}

impl RelayPool {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            connections: RwLock::new(FxHashMap::default()),
            health: Arc::new(HealthRegistry::new()),
            config,
        }
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.health.clone()
    }

    /// The single connection object for a URL. Creating the entry is
    /// synchronous under the write lock, so two racing callers always get
    /// the same `Arc`; dialing happens later behind the connection's own
    /// gate.
    fn connection_for(&self, normalized_url: &str) -> Arc<RelayConnection> {
        if let Some(conn) = self
            .connections
            .read()
            .expect("connections lock")
            .get(normalized_url)
        {
            return conn.clone();
        }
        let mut connections = self.connections.write().expect("connections lock");
        connections
            .entry(normalized_url.to_string())
            .or_insert_with(|| {
                Arc::new(RelayConnection::new(
                    normalized_url.to_string(),
                    self.config.clone(),
                    self.health.clone(),
                ))
            })
            .clone()
    }

    async fn ensure_connection(&self, url: &str) -> Result<Arc<RelayConnection>, RelayError> {
        validate_relay_url(url)?;
        let normalized = normalize_relay_url(url);
        if self.health.in_backoff(&normalized) {
            return Err(RelayError::BackingOff);
        }
        let conn = self.connection_for(&normalized);
        conn.clone().ensure_connected().await?;
        Ok(conn)
    }

    /// Attach one mailbox sender to a subscription on one relay.
    pub async fn subscribe_relay(
        &self,
        url: &str,
        subscription_id: &str,
        filters: Vec<Filter>,
        sender: MailboxSender<SubscriptionUpdate>,
    ) -> Result<(), RelayError> {
        let conn = self.ensure_connection(url).await?;
        conn.subscribe(subscription_id, filters, sender).await
    }

    /// Fan a subscription out to several relays into one mailbox. Returns
    /// the receiver plus how many relays actually accepted the REQ; relays
    /// in backoff or failing to dial are skipped.
    pub async fn subscribe(
        &self,
        urls: &[String],
        filters: Vec<Filter>,
    ) -> (String, MailboxReceiver<SubscriptionUpdate>, usize) {
        let subscription_id = crate::utils::random_sub_id();
        let (tx, rx) = mailbox(self.config.mailbox_capacity);

        let attempts = urls.iter().map(|url| {
            let filters = filters.clone();
            let sender = tx.clone();
            let sub_id = subscription_id.clone();
            async move {
                match self.subscribe_relay(url, &sub_id, filters, sender).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(relay = %url, error = %e, "skipping relay for subscription");
                        false
                    }
                }
            }
        });
        let results = futures::future::join_all(attempts).await;
        let attached = results.into_iter().filter(|ok| *ok).count();
        (subscription_id, rx, attached)
    }

    /// CLOSE a subscription on every relay it was sent to.
    pub async fn unsubscribe(&self, urls: &[String], subscription_id: &str) {
        for url in urls {
            let normalized = normalize_relay_url(url);
            let conn = self
                .connections
                .read()
                .expect("connections lock")
                .get(&normalized)
                .cloned();
            if let Some(conn) = conn {
                conn.unsubscribe(subscription_id).await;
            }
        }
    }

    /// Send an event to one relay and hand back the OK waiter.
    pub async fn publish_relay(
        &self,
        url: &str,
        event: &Event,
    ) -> Result<oneshot::Receiver<OkResult>, RelayError> {
        let conn = self.ensure_connection(url).await?;
        let ok_rx = conn.register_ok(&event.id.to_hex());
        if let Err(e) = conn.send(ClientMessage::event(event.clone())).await {
            conn.discard_ok(&event.id.to_hex());
            return Err(e);
        }
        Ok(ok_rx)
    }

    /// Relays ordered best-first for a query, per the health score.
    pub fn rank_relays(&self, urls: &[String]) -> Vec<String> {
        let normalized: Vec<String> = urls.iter().map(|u| normalize_relay_url(u)).collect();
        self.health.sort_relays_by_score(&normalized)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().expect("connections lock").len()
    }

    pub async fn shutdown(&self) {
        let connections: Vec<Arc<RelayConnection>> = {
            let mut map = self.connections.write().expect("connections lock");
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<RelayPool> {
        Arc::new(RelayPool::new(RelayConfig::default()))
    }

    #[tokio::test]
    async fn one_connection_object_per_url_under_contention() {
        let pool = pool();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.connection_for("wss://relay.example.com")
            }));
        }
        let mut connections = Vec::new();
        for handle in handles {
            connections.push(handle.await.unwrap());
        }
        assert_eq!(pool.connection_count(), 1);
        for pair in connections.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[tokio::test]
    async fn url_spellings_collapse_to_one_entry() {
        let pool = pool();
        let a = pool.connection_for(&normalize_relay_url("wss://relay.example.com"));
        let b = pool.connection_for(&normalize_relay_url("WSS://Relay.Example.Com/"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn backoff_gates_subscribe_without_dialing() {
        let pool = pool();
        pool.health().record_failure("wss://relay.example.com");
        let result = pool
            .subscribe_relay(
                "wss://relay.example.com",
                "sub1",
                vec![Filter::new().kind(1)],
                mailbox(8).0,
            )
            .await;
        assert!(matches!(result, Err(RelayError::BackingOff)));
        // The gate fired before any connection object was created.
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn invalid_urls_are_rejected_before_the_map() {
        let pool = pool();
        let result = pool
            .subscribe_relay("https://not-a-relay", "sub1", vec![], mailbox(8).0)
            .await;
        assert!(matches!(result, Err(RelayError::InvalidUrl(_))));
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn fanout_subscribe_skips_backed_off_relays() {
        let pool = pool();
        pool.health().record_failure("wss://a.example.com");
        pool.health().record_failure("wss://b.example.com");
        let urls = vec![
            "wss://a.example.com".to_string(),
            "wss://b.example.com".to_string(),
        ];
        let (_sub_id, _rx, attached) = pool.subscribe(&urls, vec![Filter::new().kind(1)]).await;
        assert_eq!(attached, 0);
    }
}
