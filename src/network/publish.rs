//! Publisher: parallel writes with per-relay OK accounting.
//!
//! Publication is best-effort: each relay answers (or fails) on its own,
//! and the caller gets the full per-relay ledger. The async variant powers
//! optimistic UI — it only calls back when *every* relay failed, so the
//! surface can roll the optimistic update back.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::stores::RelayList;
use crate::cache::Store;
use crate::relays::RelayPool;
use crate::types::{Event, PublicKey};

/// Global budget for collecting OK frames.
const OK_BUDGET: Duration = Duration::from_secs(15);

/// Outbox caps: mentioned recipients considered, read relays per recipient.
const MAX_RECIPIENTS: usize = 10;
const READ_RELAYS_PER_RECIPIENT: usize = 2;

/// Per-relay accounting for one publish call.
#[derive(Clone, Debug, Default)]
pub struct PublishOutcome {
    pub accepted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PublishOutcome {
    pub fn any_accepted(&self) -> bool {
        !self.accepted.is_empty()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.failed.last().map(|(_, err)| err.as_str())
    }
}

#[derive(Clone)]
pub struct Publisher {
    pool: Arc<RelayPool>,
    ok_budget: Duration,
}

impl Publisher {
    pub fn new(pool: Arc<RelayPool>) -> Self {
        Self {
            pool,
            ok_budget: OK_BUDGET,
        }
    }

    #[cfg(test)]
    pub fn with_budget(pool: Arc<RelayPool>, ok_budget: Duration) -> Self {
        Self { pool, ok_budget }
    }

    /// Write the event to every relay in parallel and wait (up to the OK
    /// budget) for each relay's verdict.
    pub async fn publish(&self, event: &Event, relays: &[String]) -> PublishOutcome {
        let attempts = relays.iter().map(|url| {
            let event = event.clone();
            async move {
                let verdict = self.publish_one(url, &event).await;
                (url.clone(), verdict)
            }
        });

        let mut outcome = PublishOutcome::default();
        for (url, verdict) in futures::future::join_all(attempts).await {
            match verdict {
                Ok(()) => outcome.accepted.push(url),
                Err(reason) => {
                    tracing::debug!(relay = %url, %reason, "publish failed");
                    outcome.failed.push((url, reason));
                }
            }
        }
        outcome
    }

    async fn publish_one(&self, url: &str, event: &Event) -> Result<(), String> {
        let ok_rx = self
            .pool
            .publish_relay(url, event)
            .await
            .map_err(|e| e.to_string())?;
        match tokio::time::timeout(self.ok_budget, ok_rx).await {
            Ok(Ok(ok)) if ok.accepted => Ok(()),
            Ok(Ok(ok)) => Err(if ok.message.is_empty() {
                "rejected".to_string()
            } else {
                ok.message
            }),
            Ok(Err(_)) => Err("connection lost before OK".to_string()),
            Err(_) => Err("timed out waiting for OK".to_string()),
        }
    }

    /// Fire-and-account variant: returns immediately, publishes under a
    /// detached deadline (the user's action lands even if their browser
    /// disconnects), and invokes `on_failure` iff every relay failed.
    pub fn publish_async<F>(&self, event: Event, relays: Vec<String>, on_failure: F)
    where
        F: FnOnce(String, String) + Send + 'static,
    {
        let publisher = self.clone();
        tokio::spawn(async move {
            let outcome = publisher.publish(&event, &relays).await;
            if !outcome.any_accepted() {
                let last_error = outcome
                    .last_error()
                    .unwrap_or("no relays available")
                    .to_string();
                tracing::warn!(event = %event.id, %last_error, "publish failed on every relay");
                on_failure(event.id.to_hex(), last_error);
            }
        });
    }

    /// Outbox-model relay selection: the author's NIP-65 write relays (or
    /// the configured publish set when none are known), plus up to two read
    /// relays per `p`-tagged recipient so mentions propagate to where the
    /// mentioned party listens. Duplicates collapse, order is preserved.
    pub async fn select_outbox_relays(
        &self,
        relay_lists: &Store<RelayList>,
        author: &PublicKey,
        event: &Event,
        configured_publish_relays: &[String],
    ) -> Vec<String> {
        let mut selected: Vec<String> = Vec::new();
        let mut push_unique = |url: &str, selected: &mut Vec<String>| {
            let normalized = crate::relays::utils::normalize_relay_url(url);
            if !selected.contains(&normalized) {
                selected.push(normalized);
            }
        };

        let author_writes = relay_lists
            .get(&author.to_hex())
            .await
            .and_then(|cached| cached.payload)
            .map(|list| list.write)
            .unwrap_or_default();
        if author_writes.is_empty() {
            for url in configured_publish_relays {
                push_unique(url, &mut selected);
            }
        } else {
            for url in &author_writes {
                push_unique(url, &mut selected);
            }
        }

        let recipients: Vec<String> = event
            .tag_values("p")
            .take(MAX_RECIPIENTS)
            .map(str::to_string)
            .collect();
        for recipient in recipients {
            let Some(list) = relay_lists
                .get(&recipient)
                .await
                .and_then(|cached| cached.payload)
            else {
                continue;
            };
            for url in list.read.iter().take(READ_RELAYS_PER_RECIPIENT) {
                push_unique(url, &mut selected);
            }
        }
        selected
    }
}
