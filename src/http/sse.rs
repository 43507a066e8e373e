//! SSE correction channel.
//!
//! When an optimistic update fails at publish time, the gateway emits a
//! server-sent event naming the DOM selector, the corrected fragment and
//! the action kind; the browser swaps the fragment in place. Fire and
//! forget: a missed event degrades to eventual consistency on the next
//! page load.

use std::convert::Infallible;
use std::sync::Mutex;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Correction {
    /// DOM selector of the fragment to replace.
    pub selector: String,
    /// Replacement markup.
    pub html: String,
    /// Action kind the correction reverses (post, react, …).
    pub action: String,
}

/// Per-session broadcast channels. Senders are created lazily and dropped
/// with the session.
#[derive(Default)]
pub struct CorrectionChannel {
    channels: Mutex<FxHashMap<String, broadcast::Sender<Correction>>>,
}

impl CorrectionChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Correction> {
        let mut channels = self.channels.lock().expect("sse channels lock");
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fire and forget: no subscriber, no delivery, no error.
    pub fn publish(&self, session_id: &str, correction: Correction) {
        let sender = {
            let channels = self.channels.lock().expect("sse channels lock");
            channels.get(session_id).cloned()
        };
        if let Some(sender) = sender {
            let delivered = sender.send(correction).is_ok();
            if !delivered {
                tracing::debug!(session = %session_id, "correction had no listeners");
            }
        }
    }

    pub fn drop_session(&self, session_id: &str) {
        self.channels
            .lock()
            .expect("sse channels lock")
            .remove(session_id);
    }
}

/// The `text/event-stream` response for one session.
pub fn sse_response(
    receiver: broadcast::Receiver<Correction>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(correction) => {
                    let event = SseEvent::default()
                        .event("correction")
                        .json_data(&correction)
                        .unwrap_or_default();
                    return Some((Ok(event), receiver));
                }
                // Lagged listeners skip ahead; missed corrections settle on
                // the next page load.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn corrections_reach_subscribers() {
        let channel = CorrectionChannel::new();
        let mut rx = channel.subscribe("sess1");
        channel.publish(
            "sess1",
            Correction {
                selector: "#note-abc .reactions".into(),
                html: "<span>0</span>".into(),
                action: "react".into(),
            },
        );
        let received = rx.recv().await.unwrap();
        assert_eq!(received.selector, "#note-abc .reactions");
        assert_eq!(received.action, "react");
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_a_no_op() {
        let channel = CorrectionChannel::new();
        channel.publish(
            "nobody",
            Correction {
                selector: "#x".into(),
                html: String::new(),
                action: "post".into(),
            },
        );
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let channel = CorrectionChannel::new();
        let mut rx_a = channel.subscribe("a");
        let _rx_b = channel.subscribe("b");
        channel.publish(
            "b",
            Correction {
                selector: "#y".into(),
                html: String::new(),
                action: "post".into(),
            },
        );
        assert!(matches!(
            rx_a.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
