//! Write surface: every mutation signs through the session's remote
//! signer, publishes through the outbox, answers optimistically, and
//! registers an SSE correction for total publish failure.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Form;
use serde::Deserialize;

use crate::http::error::{sanitize, MSG_INVALID};
use crate::http::render::escape_html;
use crate::http::sse::Correction;
use crate::http::AppState;
use crate::signer::BunkerSession;
use crate::types::{
    nip19, EventId, PublicKey, Template, BOOKMARK_LIST, CONTACT_LIST, MUTE_LIST, REACTION,
    REPORT, REPOST, TEXT_NOTE, ZAP_REQUEST,
};

use super::{check_csrf, require_session, wants_fragment};

/// Sign, select outbox relays, publish asynchronously, answer with the
/// optimistic fragment. On total publish failure the SSE channel carries
/// the corrected fragment for `selector`.
async fn sign_and_publish(
    state: &AppState,
    session: &BunkerSession,
    template: Template,
    action: &'static str,
    selector: String,
    optimistic_html: String,
    corrected_html: String,
    headers: &HeaderMap,
) -> Response {
    let event = match state.signer.sign_event(&session.session_id, &template).await {
        Ok(event) => event,
        Err(e) => {
            let message = sanitize(action, e);
            return super::error_fragment(message);
        }
    };

    let mut relays = state
        .publisher
        .select_outbox_relays(
            &state.cache.relay_lists(),
            &session.user_pubkey,
            &event,
            &state.config.publish_relays,
        )
        .await;
    if relays.is_empty() {
        relays = state.config.publish_relays.clone();
    }

    let corrections = state.corrections.clone();
    let session_id = session.session_id.clone();
    state.publisher.publish_async(event, relays, move |event_id, last_err| {
        tracing::warn!(event = %event_id, error = %last_err, "optimistic update rolled back");
        corrections.publish(
            &session_id,
            Correction {
                selector,
                html: corrected_html,
                action: action.to_string(),
            },
        );
    });

    if wants_fragment(headers) {
        Html(optimistic_html).into_response()
    } else {
        Redirect::to("/timeline").into_response()
    }
}

fn parse_event_id(input: &str) -> Result<EventId, Response> {
    if input.len() == 64 {
        return EventId::from_hex(input).map_err(|_| super::error_fragment(MSG_INVALID));
    }
    match nip19::decode(input) {
        Ok(nip19::Nip19::EventId(id)) => Ok(id),
        Ok(nip19::Nip19::Event(pointer)) => Ok(pointer.event_id),
        _ => Err(super::error_fragment(MSG_INVALID)),
    }
}

fn parse_pubkey(input: &str) -> Result<PublicKey, Response> {
    if input.len() == 64 {
        return PublicKey::from_hex(input).map_err(|_| super::error_fragment(MSG_INVALID));
    }
    match nip19::decode(input) {
        Ok(nip19::Nip19::Pubkey(pk)) => Ok(pk),
        Ok(nip19::Nip19::Profile(pointer)) => Ok(pointer.public_key),
        _ => Err(super::error_fragment(MSG_INVALID)),
    }
}

macro_rules! authed {
    ($state:expr, $headers:expr, $form:expr) => {{
        let session = match require_session(&$state, &$headers).await {
            Ok(session) => session,
            Err(response) => return response,
        };
        if let Err(response) = check_csrf(&session, &$form.csrf_token) {
            return response;
        }
        session
    }};
}

#[derive(Deserialize)]
pub struct PostForm {
    pub csrf_token: String,
    pub content: String,
}

pub async fn post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<PostForm>,
) -> Response {
    let session = authed!(state, headers, form);
    if form.content.trim().is_empty() {
        return super::error_fragment(MSG_INVALID);
    }
    let template = Template::new(TEXT_NOTE, form.content.trim(), vec![]);
    sign_and_publish(
        &state,
        &session,
        template,
        "post",
        "#composer".to_string(),
        format!("<p class=\"posted\">{}</p>", escape_html(form.content.trim())),
        "<p class=\"error\">Your note could not be published.</p>".to_string(),
        &headers,
    )
    .await
}

#[derive(Deserialize)]
pub struct ReplyForm {
    pub csrf_token: String,
    pub parent: String,
    pub parent_author: String,
    pub content: String,
}

pub async fn reply(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<ReplyForm>,
) -> Response {
    let session = authed!(state, headers, form);
    let parent = match parse_event_id(&form.parent) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let author = match parse_pubkey(&form.parent_author) {
        Ok(pk) => pk,
        Err(response) => return response,
    };
    if form.content.trim().is_empty() {
        return super::error_fragment(MSG_INVALID);
    }

    let tags = vec![
        vec!["e".into(), parent.to_hex(), String::new(), "reply".into()],
        vec!["p".into(), author.to_hex()],
    ];
    let template = Template::new(TEXT_NOTE, form.content.trim(), tags);
    sign_and_publish(
        &state,
        &session,
        template,
        "reply",
        format!("#note-{} .replies", parent.to_hex()),
        format!("<p class=\"posted\">{}</p>", escape_html(form.content.trim())),
        "<p class=\"error\">Your reply could not be published.</p>".to_string(),
        &headers,
    )
    .await
}

#[derive(Deserialize)]
pub struct TargetForm {
    pub csrf_token: String,
    pub id: String,
    pub author: String,
}

pub async fn react(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TargetForm>,
) -> Response {
    let mut session = authed!(state, headers, form);
    let target = match parse_event_id(&form.id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let author = match parse_pubkey(&form.author) {
        Ok(pk) => pk,
        Err(response) => return response,
    };

    let tags = vec![
        vec!["e".into(), target.to_hex()],
        vec!["p".into(), author.to_hex()],
    ];
    let template = Template::new(REACTION, "+", tags);

    session.interactions.reacted_events.insert(target.to_hex());
    state.signer.update_session(&session).await;

    sign_and_publish(
        &state,
        &session,
        template,
        "react",
        format!("#note-{} .reactions", target.to_hex()),
        "<span class=\"reacted\">♥</span>".to_string(),
        "<span class=\"reaction-failed\">♡</span>".to_string(),
        &headers,
    )
    .await
}

pub async fn repost(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TargetForm>,
) -> Response {
    let mut session = authed!(state, headers, form);
    let target = match parse_event_id(&form.id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let author = match parse_pubkey(&form.author) {
        Ok(pk) => pk,
        Err(response) => return response,
    };

    let tags = vec![
        vec!["e".into(), target.to_hex()],
        vec!["p".into(), author.to_hex()],
    ];
    let template = Template::new(REPOST, "", tags);

    session.interactions.reposted_events.insert(target.to_hex());
    state.signer.update_session(&session).await;

    sign_and_publish(
        &state,
        &session,
        template,
        "repost",
        format!("#note-{} .reposts", target.to_hex()),
        "<span class=\"reposted\">reposted</span>".to_string(),
        "<span class=\"repost-failed\">repost</span>".to_string(),
        &headers,
    )
    .await
}

#[derive(Deserialize)]
pub struct IdForm {
    pub csrf_token: String,
    pub id: String,
}

/// Bookmarks are a replaceable list: the new event carries every
/// bookmarked id the session knows about.
pub async fn bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<IdForm>,
) -> Response {
    let mut session = authed!(state, headers, form);
    let target = match parse_event_id(&form.id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    session.interactions.bookmarked_events.insert(target.to_hex());
    state.signer.update_session(&session).await;

    let mut ids: Vec<&String> = session.interactions.bookmarked_events.iter().collect();
    ids.sort();
    let tags: Vec<Vec<String>> = ids
        .into_iter()
        .map(|id| vec!["e".to_string(), id.clone()])
        .collect();
    let template = Template::new(BOOKMARK_LIST, "", tags);

    sign_and_publish(
        &state,
        &session,
        template,
        "bookmark",
        format!("#note-{} .bookmark", target.to_hex()),
        "<span class=\"bookmarked\">bookmarked</span>".to_string(),
        "<span class=\"bookmark-failed\">bookmark</span>".to_string(),
        &headers,
    )
    .await
}

#[derive(Deserialize)]
pub struct MuteForm {
    pub csrf_token: String,
    #[serde(default)]
    pub pubkey: Option<String>,
    #[serde(default)]
    pub word: Option<String>,
}

/// The mute list is replaceable too: pubkeys as `p` tags, words as
/// `word` tags.
pub async fn mute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<MuteForm>,
) -> Response {
    let mut session = authed!(state, headers, form);
    if let Some(pubkey) = form.pubkey.as_deref().filter(|p| !p.is_empty()) {
        match parse_pubkey(pubkey) {
            Ok(pk) => {
                session.interactions.muted_pubkeys.insert(pk.to_hex());
            }
            Err(response) => return response,
        }
    } else if let Some(word) = form.word.as_deref().filter(|w| !w.is_empty()) {
        session
            .interactions
            .muted_words
            .insert(word.trim().to_lowercase());
    } else {
        return super::error_fragment(MSG_INVALID);
    }
    state.signer.update_session(&session).await;

    let mut tags: Vec<Vec<String>> = Vec::new();
    let mut muted_pubkeys: Vec<&String> = session.interactions.muted_pubkeys.iter().collect();
    muted_pubkeys.sort();
    tags.extend(
        muted_pubkeys
            .into_iter()
            .map(|pk| vec!["p".to_string(), pk.clone()]),
    );
    let mut muted_words: Vec<&String> = session.interactions.muted_words.iter().collect();
    muted_words.sort();
    tags.extend(
        muted_words
            .into_iter()
            .map(|w| vec!["word".to_string(), w.clone()]),
    );
    let template = Template::new(MUTE_LIST, "", tags);

    sign_and_publish(
        &state,
        &session,
        template,
        "mute",
        "#mute-status".to_string(),
        "<span class=\"muted\">muted</span>".to_string(),
        "<span class=\"mute-failed\">mute</span>".to_string(),
        &headers,
    )
    .await
}

#[derive(Deserialize)]
pub struct FollowForm {
    pub csrf_token: String,
    pub pubkey: String,
}

/// The contact list is replaceable: one `p` tag per followed pubkey.
pub async fn follow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<FollowForm>,
) -> Response {
    let mut session = authed!(state, headers, form);
    let target = match parse_pubkey(&form.pubkey) {
        Ok(pk) => pk,
        Err(response) => return response,
    };

    session.interactions.followed_pubkeys.insert(target.to_hex());
    state.signer.update_session(&session).await;

    let mut followed: Vec<&String> = session.interactions.followed_pubkeys.iter().collect();
    followed.sort();
    let tags: Vec<Vec<String>> = followed
        .into_iter()
        .map(|pk| vec!["p".to_string(), pk.clone()])
        .collect();
    let template = Template::new(CONTACT_LIST, "", tags);

    sign_and_publish(
        &state,
        &session,
        template,
        "follow",
        format!("#follow-{}", target.to_hex()),
        "<span class=\"following\">following</span>".to_string(),
        "<span class=\"follow-failed\">follow</span>".to_string(),
        &headers,
    )
    .await
}

#[derive(Deserialize)]
pub struct QuoteForm {
    pub csrf_token: String,
    pub author: String,
    pub content: String,
}

pub async fn quote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Form(form): Form<QuoteForm>,
) -> Response {
    let session = authed!(state, headers, form);
    let target = match parse_event_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let author = match parse_pubkey(&form.author) {
        Ok(pk) => pk,
        Err(response) => return response,
    };

    let pointer = nip19::Nip19Event {
        event_id: target,
        relays: vec![],
        author: Some(author),
        kind: Some(TEXT_NOTE),
    };
    let nevent = match nip19::encode_nevent(&pointer) {
        Ok(nevent) => nevent,
        Err(_) => return super::error_fragment(MSG_INVALID),
    };

    let content = format!("{}\n\nnostr:{}", form.content.trim(), nevent);
    let tags = vec![
        vec!["q".into(), target.to_hex()],
        vec!["p".into(), author.to_hex()],
    ];
    let template = Template::new(TEXT_NOTE, content, tags);

    sign_and_publish(
        &state,
        &session,
        template,
        "quote",
        "#composer".to_string(),
        "<p class=\"posted\">Quoted.</p>".to_string(),
        "<p class=\"error\">Your quote could not be published.</p>".to_string(),
        &headers,
    )
    .await
}

#[derive(Deserialize)]
pub struct ReportForm {
    pub csrf_token: String,
    pub author: String,
    #[serde(default)]
    pub reason: String,
}

pub async fn report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Form(form): Form<ReportForm>,
) -> Response {
    let session = authed!(state, headers, form);
    let target = match parse_event_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let author = match parse_pubkey(&form.author) {
        Ok(pk) => pk,
        Err(response) => return response,
    };

    let tags = vec![
        vec!["e".into(), target.to_hex(), "other".into()],
        vec!["p".into(), author.to_hex()],
    ];
    let template = Template::new(REPORT, form.reason.trim(), tags);

    sign_and_publish(
        &state,
        &session,
        template,
        "report",
        format!("#note-{} .report", target.to_hex()),
        "<span class=\"reported\">reported</span>".to_string(),
        "<span class=\"report-failed\">report</span>".to_string(),
        &headers,
    )
    .await
}

#[derive(Deserialize)]
pub struct ZapForm {
    pub csrf_token: String,
    pub id: String,
    pub author: String,
    #[serde(default = "default_zap_amount")]
    pub amount_msat: u64,
}

fn default_zap_amount() -> u64 {
    21_000
}

/// Sign the kind-9734 zap request. Invoice retrieval and payment are the
/// wallet collaborator's side of the contract; the signed request is the
/// core's contribution.
pub async fn zap(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<ZapForm>,
) -> Response {
    let session = authed!(state, headers, form);
    let target = match parse_event_id(&form.id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let author = match parse_pubkey(&form.author) {
        Ok(pk) => pk,
        Err(response) => return response,
    };

    let relays_tag: Vec<String> = std::iter::once("relays".to_string())
        .chain(state.config.publish_relays.iter().cloned())
        .collect();
    let tags = vec![
        relays_tag,
        vec!["amount".into(), form.amount_msat.to_string()],
        vec!["e".into(), target.to_hex()],
        vec!["p".into(), author.to_hex()],
    ];
    let template = Template::new(ZAP_REQUEST, "", tags);

    match state.signer.sign_event(&session.session_id, &template).await {
        Ok(zap_request) => {
            tracing::debug!(event = %zap_request.id, "zap request signed");
            Html(format!(
                "<span class=\"zap-pending\" data-request=\"{}\">zap requested</span>",
                zap_request.id.to_hex()
            ))
            .into_response()
        }
        Err(e) => super::error_fragment(sanitize("zap", e)),
    }
}

#[derive(Deserialize)]
pub struct WalletForm {
    pub csrf_token: String,
}

/// NWC `get_balance` over the wallet descriptor attached to the session.
pub async fn wallet_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<WalletForm>,
) -> Response {
    let session = authed!(state, headers, form);
    let Some(wallet) = session.nwc.clone() else {
        return super::error_fragment(crate::http::error::MSG_NOT_CONNECTED);
    };

    let cache = state.cache.wallet_info();
    match crate::signer::nwc::get_balance(state.fetcher.pool(), &wallet).await {
        Ok(balance_msat) => {
            cache
                .put(
                    &session.session_id,
                    crate::cache::stores::WalletInfo {
                        methods: vec!["get_balance".to_string()],
                        alias: None,
                    },
                )
                .await;
            Html(format!(
                "<span class=\"balance\">{} sats</span>",
                balance_msat / 1000
            ))
            .into_response()
        }
        Err(e) => super::error_fragment(sanitize("wallet balance", e)),
    }
}
