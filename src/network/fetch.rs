//! Query fan-out: subscribe to N relays in parallel, merge, deduplicate,
//! sort, truncate.
//!
//! Termination: the earliest of a hard timeout, EOSE from every attached
//! relay, twice the requested limit collected, or the 500 ms grace window
//! that opens once `min(2, N)` relays have finished streaming.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::cache::stores::EventResult;
use crate::cache::CachePlane;
use crate::relays::{RelayPool, SubscriptionUpdate};
use crate::types::{Event, EventId, Filter, PublicKey, METADATA, REACTION};

const DEFAULT_LIMIT: usize = 100;
const GRACE_WINDOW: Duration = Duration::from_millis(500);
const PROFILE_BUDGET: Duration = Duration::from_millis(1500);
const REACTION_BUDGET: Duration = Duration::from_secs(3);

/// Fan-out front end over the relay pool, with the cache plane wired in.
#[derive(Clone)]
pub struct Fetcher {
    pool: Arc<RelayPool>,
    cache: CachePlane,
}

impl Fetcher {
    pub fn new(pool: Arc<RelayPool>, cache: CachePlane) -> Self {
        Self { pool, cache }
    }

    pub fn pool(&self) -> &Arc<RelayPool> {
        &self.pool
    }

    /// Fan a filter out to the given relays. Returns the merged events,
    /// sorted `(created_at desc, id desc)` and truncated to the filter's
    /// limit, plus whether every attached relay sent EOSE in time.
    pub async fn fetch(
        &self,
        relays: &[String],
        filter: Filter,
        timeout: Duration,
    ) -> (Vec<Event>, bool) {
        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT);
        let (sub_id, rx, attached) = self.pool.subscribe(relays, vec![filter]).await;
        if attached == 0 {
            return (Vec::new(), false);
        }

        let (events, all_eose) = collect_updates(rx, attached, limit, timeout).await;

        // Detached cleanup; the caller should not wait on CLOSE frames.
        {
            let pool = self.pool.clone();
            let relays = relays.to_vec();
            let sub_id = sub_id.clone();
            tokio::spawn(async move {
                pool.unsubscribe(&relays, &sub_id).await;
            });
        }

        let mut merged = events;
        sort_events(&mut merged);
        merged.truncate(limit);
        (merged, all_eose)
    }

    /// Cache-through variant. The TTL follows the filter shape: open-ended
    /// live feeds expire in seconds, fully-constrained by-id lookups keep
    /// their answer for minutes.
    pub async fn fetch_cached(
        &self,
        relays: &[String],
        filter: Filter,
        timeout: Duration,
    ) -> (Vec<Event>, bool) {
        let key = query_cache_key(&filter, relays);
        let store = self.cache.event_results();
        if let Some(cached) = store.get(&key).await {
            if let Some(result) = cached.payload {
                return (result.events, result.all_eose);
            }
        }

        let (events, all_eose) = self.fetch(relays, filter.clone(), timeout).await;
        store
            .put_with_ttl(
                &key,
                EventResult {
                    events: events.clone(),
                    all_eose,
                },
                query_cache_ttl(&filter),
            )
            .await;
        (events, all_eose)
    }

    /// Profile fan-out: the dedicated profile relay answers first inside a
    /// 1.5 s budget; the general set is consulted only for pubkeys it did
    /// not resolve. Results and authoritative absences are cached.
    pub async fn fetch_profiles(
        &self,
        pubkeys: &[PublicKey],
        profile_relays: &[String],
        general_relays: &[String],
    ) -> FxHashMap<PublicKey, crate::cache::stores::ProfileMetadata> {
        let store = self.cache.profiles();
        let mut resolved = FxHashMap::default();
        let mut missing: Vec<PublicKey> = Vec::new();

        let keys: Vec<String> = pubkeys.iter().map(|pk| pk.to_hex()).collect();
        for (pubkey, cached) in pubkeys.iter().zip(store.get_many(&keys).await) {
            match cached {
                Some(cached) if cached.not_found => {}
                Some(cached) => {
                    if let Some(profile) = cached.payload {
                        resolved.insert(*pubkey, profile);
                    }
                }
                None => missing.push(*pubkey),
            }
        }
        if missing.is_empty() {
            return resolved;
        }

        let mut unresolved = self
            .resolve_profiles(&missing, profile_relays, PROFILE_BUDGET, &mut resolved)
            .await;
        if !unresolved.is_empty() {
            unresolved = self
                .resolve_profiles(&unresolved, general_relays, PROFILE_BUDGET * 2, &mut resolved)
                .await;
        }
        for pubkey in unresolved {
            store.put_not_found(&pubkey.to_hex()).await;
        }
        resolved
    }

    async fn resolve_profiles(
        &self,
        pubkeys: &[PublicKey],
        relays: &[String],
        budget: Duration,
        resolved: &mut FxHashMap<PublicKey, crate::cache::stores::ProfileMetadata>,
    ) -> Vec<PublicKey> {
        if relays.is_empty() || pubkeys.is_empty() {
            return pubkeys.to_vec();
        }
        let filter = Filter::new()
            .kind(METADATA)
            .authors(pubkeys.iter().copied())
            .limit(pubkeys.len());
        let (events, _) = self.fetch(relays, filter, budget).await;

        let store = self.cache.profiles();
        for event in newest_per_author(events) {
            if let Some(profile) = crate::cache::stores::ProfileMetadata::from_event(&event) {
                store.put(&event.pubkey.to_hex(), profile.clone()).await;
                resolved.insert(event.pubkey, profile);
            }
        }
        pubkeys
            .iter()
            .filter(|pk| !resolved.contains_key(pk))
            .copied()
            .collect()
    }

    /// Reaction fan-out: `#e` constrained, 3 s budget.
    pub async fn fetch_reactions(
        &self,
        event_ids: &[EventId],
        relays: &[String],
    ) -> Vec<Event> {
        if event_ids.is_empty() {
            return Vec::new();
        }
        let mut filter = Filter::new().kind(REACTION);
        filter.e_tags = Some(event_ids.iter().map(|id| id.to_hex()).collect());
        let (events, _) = self.fetch(relays, filter, REACTION_BUDGET).await;
        events
    }

    /// NIP-65 relay lists for a set of pubkeys, cache-through.
    pub async fn fetch_relay_lists(
        &self,
        pubkeys: &[PublicKey],
        relays: &[String],
    ) -> FxHashMap<PublicKey, crate::cache::stores::RelayList> {
        let store = self.cache.relay_lists();
        let mut resolved = FxHashMap::default();
        let mut missing = Vec::new();
        for pubkey in pubkeys {
            match store.get(&pubkey.to_hex()).await {
                Some(cached) => {
                    if let Some(list) = cached.payload {
                        resolved.insert(*pubkey, list);
                    }
                }
                None => missing.push(*pubkey),
            }
        }
        if missing.is_empty() {
            return resolved;
        }

        let filter = Filter::new()
            .kind(crate::types::RELAY_LIST)
            .authors(missing.iter().copied())
            .limit(missing.len());
        let (events, _) = self.fetch(relays, filter, PROFILE_BUDGET * 2).await;
        for event in newest_per_author(events) {
            let list = crate::cache::stores::RelayList::from_event(&event);
            store.put(&event.pubkey.to_hex(), list.clone()).await;
            resolved.insert(event.pubkey, list);
        }
        for pubkey in missing {
            if !resolved.contains_key(&pubkey) {
                store.put_not_found(&pubkey.to_hex()).await;
            }
        }
        resolved
    }
}

/// Drain a fan-out mailbox until one of the termination conditions hits:
/// full EOSE, hard timeout, early exit at `2·limit` collected events, or
/// the end of the grace window that opens once `min(2, attached)` relays
/// have sent EOSE. The second value is true iff every attached relay sent
/// EOSE before the deadline.
pub(crate) async fn collect_updates(
    mut rx: crate::relays::MailboxReceiver<SubscriptionUpdate>,
    attached: usize,
    limit: usize,
    timeout: Duration,
) -> (Vec<Event>, bool) {
    let mut events: FxHashMap<EventId, Event> = FxHashMap::default();
    let mut eose_count = 0usize;
    let eose_threshold = attached.min(2);
    let deadline = Instant::now() + timeout;
    let mut grace_deadline: Option<Instant> = None;

    loop {
        let wake = grace_deadline.map(|g| g.min(deadline)).unwrap_or(deadline);
        match tokio::time::timeout_at(wake, rx.recv()).await {
            Ok(Some(SubscriptionUpdate::Event(event))) => {
                events.entry(event.id).or_insert(event);
                if events.len() >= 2 * limit {
                    break;
                }
            }
            Ok(Some(SubscriptionUpdate::Eose)) => {
                eose_count += 1;
                if eose_count >= attached {
                    break;
                }
                if eose_count >= eose_threshold && grace_deadline.is_none() {
                    grace_deadline = Some(Instant::now() + GRACE_WINDOW);
                }
            }
            Ok(Some(SubscriptionUpdate::Closed(reason))) => {
                tracing::debug!(%reason, "subscription closed by relay during fan-out");
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    (events.into_values().collect(), eose_count >= attached)
}

/// Total order for merged results: newest first, id descending as the
/// deterministic tie-break.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Replaceable events: keep only the newest per author.
fn newest_per_author(events: Vec<Event>) -> Vec<Event> {
    let mut newest: FxHashMap<PublicKey, Event> = FxHashMap::default();
    for event in events {
        match newest.get(&event.pubkey) {
            Some(existing) if existing.created_at >= event.created_at => {}
            _ => {
                newest.insert(event.pubkey, event);
            }
        }
    }
    newest.into_values().collect()
}

fn query_cache_key(filter: &Filter, relays: &[String]) -> String {
    let mut sorted_relays: Vec<&str> = relays.iter().map(String::as_str).collect();
    sorted_relays.sort_unstable();
    let mut hasher = Sha256::new();
    hasher.update(filter.as_json().as_bytes());
    hasher.update(sorted_relays.join(",").as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn query_cache_ttl(filter: &Filter) -> Duration {
    if filter.ids.is_some() {
        // By-id lookups are immutable; keep them for minutes.
        return Duration::from_secs(300);
    }
    let open_ended =
        filter.since.is_none() && filter.until.is_none() && filter.authors.is_none();
    if open_ended {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Keys, Template, TEXT_NOTE};

    fn note(keys: &Keys, created_at: i64, content: &str) -> Event {
        let mut template = Template::new(TEXT_NOTE, content, vec![]);
        template.created_at = Some(created_at);
        template.to_event(keys).unwrap()
    }

    #[test]
    fn sort_is_created_at_desc_then_id_desc() {
        let keys = Keys::generate();
        let older = note(&keys, 100, "older");
        let newer = note(&keys, 200, "newer");
        let mut tie_a = note(&keys, 150, "tie a");
        let mut tie_b = note(&keys, 150, "tie b");
        // Force a deterministic id ordering for the tie pair.
        if tie_a.id < tie_b.id {
            std::mem::swap(&mut tie_a, &mut tie_b);
        }

        let mut events = vec![older.clone(), tie_b.clone(), newer.clone(), tie_a.clone()];
        sort_events(&mut events);
        assert_eq!(events[0].id, newer.id);
        assert_eq!(events[1].id, tie_a.id);
        assert_eq!(events[2].id, tie_b.id);
        assert_eq!(events[3].id, older.id);
    }

    #[test]
    fn newest_per_author_keeps_latest() {
        let keys = Keys::generate();
        let old = note(&keys, 100, "old");
        let new = note(&keys, 200, "new");
        let kept = newest_per_author(vec![old, new.clone()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, new.id);
    }

    #[test]
    fn cache_key_is_stable_under_relay_order() {
        let filter = Filter::new().kind(1).limit(10);
        let a = query_cache_key(
            &filter,
            &["wss://a.example".to_string(), "wss://b.example".to_string()],
        );
        let b = query_cache_key(
            &filter,
            &["wss://b.example".to_string(), "wss://a.example".to_string()],
        );
        assert_eq!(a, b);

        let other = query_cache_key(&Filter::new().kind(2), &["wss://a.example".to_string()]);
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn fanout_deduplicates_repeated_events() {
        let keys = Keys::generate();
        let event = note(&keys, 100, "dup");
        let (tx, rx) = crate::relays::mailbox(64);
        // Three relays each deliver the same event twice.
        for _ in 0..3 {
            tx.send(SubscriptionUpdate::Event(event.clone()));
            tx.send(SubscriptionUpdate::Event(event.clone()));
            tx.send(SubscriptionUpdate::Eose);
        }
        let (events, all_eose) = collect_updates(rx, 3, 10, Duration::from_secs(5)).await;
        assert_eq!(events.len(), 1);
        assert!(all_eose);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_admits_late_events_within_500ms() {
        let keys = Keys::generate();
        let late = note(&keys, 300, "late");
        let (tx, rx) = crate::relays::mailbox(64);

        let feeder = tokio::spawn({
            let late = late.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                // Two of three relays finish streaming.
                tx.send(SubscriptionUpdate::Eose);
                tx.send(SubscriptionUpdate::Eose);
                tokio::time::sleep(Duration::from_millis(300)).await;
                // t = 400 ms: inside the grace window ending at 600 ms.
                tx.send(SubscriptionUpdate::Event(late.clone()));
                // The third relay never answers.
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });

        let (events, all_eose) = collect_updates(rx, 3, 10, Duration::from_secs(5)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, late.id);
        assert!(!all_eose);
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_rejects_events_after_600ms() {
        let keys = Keys::generate();
        let too_late = note(&keys, 300, "too late");
        let (tx, rx) = crate::relays::mailbox(64);

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(SubscriptionUpdate::Eose);
            tx.send(SubscriptionUpdate::Eose);
            // t = 700 ms: the grace window expired at 600 ms.
            tokio::time::sleep(Duration::from_millis(600)).await;
            tx.send(SubscriptionUpdate::Event(too_late));
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (events, all_eose) = collect_updates(rx, 3, 10, Duration::from_secs(5)).await;
        assert!(events.is_empty());
        assert!(!all_eose);
        feeder.abort();
    }

    #[tokio::test]
    async fn early_exit_at_twice_the_limit() {
        let keys = Keys::generate();
        let (tx, rx) = crate::relays::mailbox(64);
        for i in 0..10 {
            tx.send(SubscriptionUpdate::Event(note(&keys, 100 + i, &format!("n{i}"))));
        }
        // No EOSE at all: the early-exit path must fire on its own.
        let (events, all_eose) = collect_updates(rx, 3, 2, Duration::from_secs(5)).await;
        assert_eq!(events.len(), 4);
        assert!(!all_eose);
    }

    #[test]
    fn cache_ttl_follows_filter_shape() {
        let by_id = Filter::new().id(EventId([1u8; 32]));
        assert_eq!(query_cache_ttl(&by_id), Duration::from_secs(300));

        let live = Filter::new().kind(1).limit(50);
        assert_eq!(query_cache_ttl(&live), Duration::from_secs(30));

        let constrained = Filter::new().kind(1).since(100);
        assert_eq!(query_cache_ttl(&constrained), Duration::from_secs(60));
    }
}
