//! Read surface: timeline, thread, profile, notifications, search.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::cache::stores::ProfileMetadata;
use crate::http::error::MSG_INVALID;
use crate::http::render::{escape_html, event_card, page};
use crate::http::AppState;
use crate::types::nip19::{self, Nip19};
use crate::types::{Event, EventId, Filter, PublicKey, REACTION, REPOST, TEXT_NOTE};

use super::{require_session, wants_fragment};

const TIMELINE_LIMIT: usize = 50;

/// Resolve an identifier path segment: hex, `note1`, `nevent1`, `npub1` or
/// `nprofile1`.
fn resolve_event_id(input: &str) -> Option<EventId> {
    if input.len() == 64 {
        return EventId::from_hex(input).ok();
    }
    match nip19::decode(input).ok()? {
        Nip19::EventId(id) => Some(id),
        Nip19::Event(pointer) => Some(pointer.event_id),
        _ => None,
    }
}

fn resolve_pubkey(input: &str) -> Option<PublicKey> {
    if input.len() == 64 {
        return PublicKey::from_hex(input).ok();
    }
    match nip19::decode(input).ok()? {
        Nip19::Pubkey(pk) => Some(pk),
        Nip19::Profile(pointer) => Some(pointer.public_key),
        _ => None,
    }
}

async fn profiles_for(
    state: &AppState,
    events: &[Event],
) -> FxHashMap<PublicKey, ProfileMetadata> {
    let mut authors: Vec<PublicKey> = events.iter().map(|e| e.pubkey).collect();
    authors.sort_unstable();
    authors.dedup();
    state
        .fetcher
        .fetch_profiles(&authors, &state.config.profile_relays, &state.config.relays)
        .await
}

fn render_events(
    state: &AppState,
    events: &[Event],
    profiles: &FxHashMap<PublicKey, ProfileMetadata>,
) -> String {
    events
        .iter()
        .map(|event| event_card(event, profiles.get(&event.pubkey), state.config.extended_kinds))
        .collect::<Vec<_>>()
        .join("\n")
}

fn respond(headers: &HeaderMap, title: &str, body: String) -> Response {
    if wants_fragment(headers) {
        Html(body).into_response()
    } else {
        Html(page(title, &body)).into_response()
    }
}

/// The global feed: served from the warm aggregator when it can answer,
/// a relay fan-out otherwise. Muted content is dropped for signed-in
/// users.
pub async fn timeline(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let filter = Filter::new().kind(TEXT_NOTE).limit(TIMELINE_LIMIT);
    let mut events = match state.aggregator.get_events(&filter) {
        Some(events) => events,
        None => {
            let (events, _) = state
                .fetcher
                .fetch_cached(&state.config.relays, filter, state.config.fetch_timeout)
                .await;
            events
        }
    };

    if let Ok(session) = require_session(&state, &headers).await {
        events.retain(|event| !session.interactions.is_muted(event));
    }

    let profiles = profiles_for(&state, &events).await;
    let body = render_events(&state, &events, &profiles);
    respond(&headers, "Timeline", body)
}

/// A root note and its replies, replies sorted oldest-first under the
/// root.
pub async fn thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(root_id) = resolve_event_id(&id) else {
        return Html(page("Invalid", MSG_INVALID)).into_response();
    };

    let cache = state.cache.threads();
    let cache_key = root_id.to_hex();
    let events = match cache.get(&cache_key).await.and_then(|c| c.payload) {
        Some(events) => events,
        None => {
            let root_filter = Filter::new().id(root_id).limit(1);
            let reply_filter = Filter {
                kinds: Some(vec![TEXT_NOTE]),
                e_tags: Some(vec![root_id.to_hex()]),
                limit: Some(200),
                ..Filter::default()
            };
            let (roots, _) = state
                .fetcher
                .fetch_cached(&state.config.relays, root_filter, state.config.fetch_timeout)
                .await;
            let (replies, _) = state
                .fetcher
                .fetch_cached(&state.config.relays, reply_filter, state.config.fetch_timeout)
                .await;

            let mut events = roots;
            events.extend(replies);
            let mut seen = rustc_hash::FxHashSet::default();
            events.retain(|e| seen.insert(e.id));
            cache.put(&cache_key, events.clone()).await;
            events
        }
    };

    let (mut roots, mut replies): (Vec<Event>, Vec<Event>) =
        events.into_iter().partition(|e| e.id == root_id);
    replies.sort_by_key(|e| (e.created_at, e.id));

    let mut ordered = Vec::with_capacity(roots.len() + replies.len());
    ordered.append(&mut roots);
    ordered.extend(replies);

    let profiles = profiles_for(&state, &ordered).await;
    let body = render_events(&state, &ordered, &profiles);
    respond(&headers, "Thread", body)
}

/// A profile header plus the author's recent notes.
pub async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(pubkey) = resolve_pubkey(&id) else {
        return Html(page("Invalid", MSG_INVALID)).into_response();
    };

    let profiles = state
        .fetcher
        .fetch_profiles(
            std::slice::from_ref(&pubkey),
            &state.config.profile_relays,
            &state.config.relays,
        )
        .await;

    let filter = Filter::new().kind(TEXT_NOTE).author(pubkey).limit(20);
    let (events, _) = state
        .fetcher
        .fetch_cached(&state.config.relays, filter, state.config.fetch_timeout)
        .await;

    let header = match profiles.get(&pubkey) {
        Some(profile) => format!(
            "<header><h1>{}</h1><p>{}</p></header>",
            crate::http::render::display_name(&pubkey, Some(profile)),
            escape_html(profile.about.as_deref().unwrap_or_default()),
        ),
        None => format!(
            "<header><h1>{}</h1></header>",
            crate::http::render::display_name(&pubkey, None)
        ),
    };
    let body = format!("{header}\n{}", render_events(&state, &events, &profiles));
    respond(&headers, "Profile", body)
}

/// Mentions, reposts and reactions addressed to the signed-in user.
pub async fn notifications(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let session = match require_session(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    let filter = Filter {
        kinds: Some(vec![TEXT_NOTE, REPOST, REACTION]),
        p_tags: Some(vec![session.user_pubkey.to_hex()]),
        limit: Some(TIMELINE_LIMIT),
        ..Filter::default()
    };

    let user_key = session.user_pubkey.to_hex();
    let cache = state.cache.notifications();
    let events = match cache.get(&user_key).await.and_then(|c| c.payload) {
        Some(events) => events,
        None => {
            let (events, _) = state
                .fetcher
                .fetch(&state.config.relays, filter, state.config.fetch_timeout)
                .await;
            cache.put(&user_key, events.clone()).await;
            events
        }
    };

    // Record the read marker so unseen counts reset.
    state
        .cache
        .notification_seen()
        .put(&user_key, crate::utils::now())
        .await;

    let profiles = profiles_for(&state, &events).await;
    let body = render_events(&state, &events, &profiles);
    respond(&headers, "Notifications", body)
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Response {
    let term = query.q.trim();
    if term.is_empty() {
        return respond(
            &headers,
            "Search",
            "<form action=\"/search\"><input name=\"q\"><button>Search</button></form>".into(),
        );
    }

    let cache = state.cache.search_results();
    let events = match cache.get(term).await.and_then(|c| c.payload) {
        Some(events) => events,
        None => {
            let filter = Filter::new()
                .kind(TEXT_NOTE)
                .search(term)
                .limit(TIMELINE_LIMIT);
            let (events, _) = state
                .fetcher
                .fetch(&state.config.relays, filter, state.config.fetch_timeout)
                .await;
            cache.put(term, events.clone()).await;
            events
        }
    };

    let profiles = profiles_for(&state, &events).await;
    let body = format!(
        "<h1>Results for {}</h1>\n{}",
        escape_html(term),
        render_events(&state, &events, &profiles)
    );
    respond(&headers, "Search", body)
}
