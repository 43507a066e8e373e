//! Warm aggregator: an in-memory window of recent global events.
//!
//! Long-lived subscriptions to a configured relay set keep a ring of the
//! newest notes; matching filters are answered without a relay round trip.
//! Best-effort cache, not a system of record: anything it cannot answer
//! authoritatively returns `None` so the caller does a live fetch.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashSet;

use crate::relays::{RelayPool, SubscriptionUpdate};
use crate::types::{Event, EventId, Filter, Kind, TEXT_NOTE};

const DEFAULT_CAPACITY: usize = 500;
const RESUBSCRIBE_DELAY: std::time::Duration = std::time::Duration::from_secs(5);
const WARMUP_LIMIT: usize = 100;

pub struct Aggregator {
    relays: Vec<String>,
    kinds: Vec<Kind>,
    capacity: usize,
    // Ring ordered by created_at desc; `seen` mirrors it for O(1) dedup.
    ring: RwLock<VecDeque<Event>>,
    seen: RwLock<FxHashSet<EventId>>,
}

impl Aggregator {
    pub fn new(relays: Vec<String>) -> Self {
        Self::with_capacity(relays, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(relays: Vec<String>, capacity: usize) -> Self {
        Self {
            relays,
            kinds: vec![TEXT_NOTE],
            capacity: capacity.max(1),
            ring: RwLock::new(VecDeque::new()),
            seen: RwLock::new(FxHashSet::default()),
        }
    }

    /// Open one persistent subscription per configured relay. Each loop
    /// re-subscribes when its mailbox closes; the pool's backoff gate
    /// paces reconnection attempts.
    pub fn start(self: Arc<Self>, pool: Arc<RelayPool>) {
        for relay in self.relays.clone() {
            let aggregator = self.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                loop {
                    let filter = Filter {
                        kinds: Some(aggregator.kinds.clone()),
                        limit: Some(WARMUP_LIMIT),
                        ..Filter::default()
                    };
                    let (sub_id, mut rx, attached) =
                        pool.subscribe(std::slice::from_ref(&relay), vec![filter]).await;
                    if attached == 0 {
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                    tracing::debug!(relay = %relay, sub = %sub_id, "aggregator subscription open");
                    while let Some(update) = rx.recv().await {
                        if let SubscriptionUpdate::Event(event) = update {
                            aggregator.insert(event);
                        }
                    }
                    tracing::debug!(relay = %relay, "aggregator subscription lost");
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                }
            });
        }
    }

    /// Deduplicated insert, keeping the ring ordered newest-first and
    /// bounded by capacity.
    pub fn insert(&self, event: Event) {
        {
            let mut seen = self.seen.write().expect("seen lock");
            if !seen.insert(event.id) {
                return;
            }
        }
        let mut ring = self.ring.write().expect("ring lock");
        let position = ring
            .iter()
            .position(|existing| {
                (existing.created_at, existing.id) < (event.created_at, event.id)
            })
            .unwrap_or(ring.len());
        ring.insert(position, event);
        if ring.len() > self.capacity {
            if let Some(evicted) = ring.pop_back() {
                self.seen.write().expect("seen lock").remove(&evicted.id);
            }
        }
    }

    /// Serve a filter from the ring, or `None` to force a live fetch.
    ///
    /// The ring only answers author-less filters whose requested kinds are
    /// a subset of the aggregated kinds. Reply notes are excluded unless
    /// the filter asks for them by `#e`, matching the fan-out's timeline
    /// behaviour.
    pub fn get_events(&self, filter: &Filter) -> Option<Vec<Event>> {
        if filter.authors.is_some() {
            return None;
        }
        match &filter.kinds {
            Some(kinds) if kinds.iter().all(|k| self.kinds.contains(k)) => {}
            _ => return None,
        }

        let include_replies = filter.e_tags.is_some();
        let limit = filter.limit.unwrap_or(WARMUP_LIMIT);
        let ring = self.ring.read().expect("ring lock");
        let matching: Vec<Event> = ring
            .iter()
            .filter(|event| filter.matches(event))
            .filter(|event| include_replies || event.tag_value("e").is_none())
            .take(limit)
            .cloned()
            .collect();

        if matching.is_empty() {
            None
        } else {
            Some(matching)
        }
    }

    pub fn len(&self) -> usize {
        self.ring.read().expect("ring lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Keys, Template};

    fn note_at(keys: &Keys, created_at: i64, content: &str) -> Event {
        let mut template = Template::new(TEXT_NOTE, content, vec![]);
        template.created_at = Some(created_at);
        template.to_event(keys).unwrap()
    }

    fn aggregator() -> Aggregator {
        Aggregator::with_capacity(vec![], 3)
    }

    #[test]
    fn inserts_are_deduplicated_and_ordered() {
        let agg = aggregator();
        let keys = Keys::generate();
        let a = note_at(&keys, 100, "a");
        let b = note_at(&keys, 300, "b");
        let c = note_at(&keys, 200, "c");
        agg.insert(a.clone());
        agg.insert(b.clone());
        agg.insert(c.clone());
        agg.insert(a.clone());
        assert_eq!(agg.len(), 3);

        let events = agg.get_events(&Filter::new().kind(TEXT_NOTE)).unwrap();
        assert_eq!(
            events.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![b.id, c.id, a.id]
        );
    }

    #[test]
    fn capacity_evicts_the_oldest() {
        let agg = aggregator();
        let keys = Keys::generate();
        let oldest = note_at(&keys, 10, "oldest");
        agg.insert(oldest.clone());
        for t in 0..3 {
            agg.insert(note_at(&keys, 100 + t, "newer"));
        }
        assert_eq!(agg.len(), 3);
        let events = agg.get_events(&Filter::new().kind(TEXT_NOTE)).unwrap();
        assert!(events.iter().all(|e| e.id != oldest.id));
        // The evicted id may be aggregated again later.
        agg.insert(oldest.clone());
        assert_eq!(agg.len(), 3);
    }

    #[test]
    fn author_constrained_filters_force_live_fetch() {
        let agg = aggregator();
        let keys = Keys::generate();
        agg.insert(note_at(&keys, 100, "x"));
        let filter = Filter::new().kind(TEXT_NOTE).author(keys.public_key());
        assert!(agg.get_events(&filter).is_none());
    }

    #[test]
    fn foreign_kinds_force_live_fetch() {
        let agg = aggregator();
        let keys = Keys::generate();
        agg.insert(note_at(&keys, 100, "x"));
        assert!(agg.get_events(&Filter::new().kind(7)).is_none());
        assert!(agg.get_events(&Filter::new()).is_none());
    }

    #[test]
    fn replies_are_excluded_from_timeline_answers() {
        let agg = aggregator();
        let keys = Keys::generate();
        let mut reply_template = Template::new(
            TEXT_NOTE,
            "reply",
            vec![vec!["e".to_string(), "a".repeat(64)]],
        );
        reply_template.created_at = Some(200);
        agg.insert(reply_template.to_event(&keys).unwrap());
        let top_level = note_at(&keys, 100, "top level");
        agg.insert(top_level.clone());

        let events = agg.get_events(&Filter::new().kind(TEXT_NOTE)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, top_level.id);
    }

    #[test]
    fn empty_ring_forces_live_fetch() {
        let agg = aggregator();
        assert!(agg.get_events(&Filter::new().kind(TEXT_NOTE)).is_none());
    }
}
