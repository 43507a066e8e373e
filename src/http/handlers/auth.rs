//! Login, reconnect, logout, and the SSE correction stream.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Form;
use serde::Deserialize;

use crate::http::error::{sanitize, MSG_INVALID};
use crate::http::render::{escape_html, page};
use crate::http::session::{
    anon_cookie_header, clear_session_cookie_header, consume_anon_csrf, cookie_value,
    issue_anon_csrf, session_cookie_header, set_cookie, ANON_COOKIE, SESSION_COOKIE,
};
use crate::http::{sse, AppState};

use super::{check_csrf, client_ip, require_session};

/// Resolve the user's NIP-65 lists in the background and attach them to
/// the session record; the outbox and timeline paths pick them up from
/// the cache and session on later requests.
fn populate_relay_lists(state: &AppState, mut session: crate::signer::BunkerSession) {
    let fetcher = state.fetcher.clone();
    let signer = state.signer.clone();
    let relays = state.config.relays.clone();
    tokio::spawn(async move {
        let lists = fetcher
            .fetch_relay_lists(std::slice::from_ref(&session.user_pubkey), &relays)
            .await;
        if let Some(list) = lists.get(&session.user_pubkey) {
            session.read_relays = list.read.clone();
            session.write_relays = list.write.clone();
            signer.update_session(&session).await;
        }
    });
}

pub async fn login_page(State(state): State<AppState>) -> Response {
    let (anon_id, token) = issue_anon_csrf(&state.cache).await;
    let body = format!(
        "<h1>Sign in</h1>\
         <form method=\"post\" action=\"/login\">\
         <input type=\"hidden\" name=\"csrf_token\" value=\"{token}\">\
         <label>bunker:// URL <input name=\"bunker_url\" placeholder=\"bunker://…\"></label>\
         <button type=\"submit\">Connect</button>\
         </form>\
         <form method=\"post\" action=\"/login\">\
         <input type=\"hidden\" name=\"csrf_token\" value=\"{token}\">\
         <input type=\"hidden\" name=\"method\" value=\"nostrconnect\">\
         <button type=\"submit\">Show nostrconnect QR</button>\
         </form>",
    );
    let mut response = Html(page("Sign in", &body)).into_response();
    set_cookie(response.headers_mut(), anon_cookie_header(&anon_id));
    response
}

#[derive(Deserialize)]
pub struct LoginForm {
    pub csrf_token: String,
    #[serde(default)]
    pub bunker_url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

pub async fn login_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let Some(anon_id) = cookie_value(&headers, ANON_COOKIE) else {
        return (StatusCode::FORBIDDEN, Html(MSG_INVALID.to_string())).into_response();
    };
    if !consume_anon_csrf(&state.cache, &anon_id, &form.csrf_token).await {
        return (StatusCode::FORBIDDEN, Html(MSG_INVALID.to_string())).into_response();
    }
    let ip = client_ip(&headers);

    if form.method.as_deref() == Some("nostrconnect") {
        return match state.signer.clone().start_nostrconnect(&ip).await {
            Ok((uri, pending_id)) => {
                let body = format!(
                    "<h1>Approve in your signer</h1>\
                     <p><code>{}</code></p>\
                     <p><a href=\"/check-connection?pending={}\">I approved it</a></p>",
                    escape_html(&uri),
                    escape_html(&pending_id),
                );
                Html(page("Waiting for signer", &body)).into_response()
            }
            Err(e) => {
                let message = sanitize("nostrconnect start", e);
                (StatusCode::TOO_MANY_REQUESTS, Html(message.to_string())).into_response()
            }
        };
    }

    let Some(bunker_url) = form.bunker_url.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Html(MSG_INVALID.to_string())).into_response();
    };
    match state.signer.login_with_bunker(&bunker_url, &ip).await {
        Ok(session) => {
            populate_relay_lists(&state, session.clone());
            let mut response = Redirect::to("/timeline").into_response();
            set_cookie(
                response.headers_mut(),
                session_cookie_header(&session.session_id),
            );
            response
        }
        Err(e) => {
            let message = sanitize("bunker login", e);
            let body = format!("<p class=\"error\">{message}</p><a href=\"/login\">Try again</a>");
            (StatusCode::OK, Html(page("Sign in failed", &body))).into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct CheckConnectionQuery {
    pub pending: String,
}

/// Login-page poll: redirects with a fresh session cookie once the signer
/// has approved the pending connection.
pub async fn check_connection(
    State(state): State<AppState>,
    Query(query): Query<CheckConnectionQuery>,
) -> Response {
    match state.signer.check_connection(&query.pending).await {
        Some(session_id) => {
            if let Some(session) = state.signer.session(&session_id).await {
                populate_relay_lists(&state, session);
            }
            let mut response = Redirect::to("/timeline").into_response();
            set_cookie(response.headers_mut(), session_cookie_header(&session_id));
            response
        }
        None => Html(page(
            "Waiting",
            "<p>Not approved yet. Refresh after approving in your signer.</p>",
        ))
        .into_response(),
    }
}

#[derive(Deserialize)]
pub struct CsrfForm {
    pub csrf_token: String,
}

pub async fn reconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CsrfForm>,
) -> Response {
    let session = match require_session(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    if let Err(response) = check_csrf(&session, &form.csrf_token) {
        return response;
    }
    match state.signer.reconnect(&session.session_id).await {
        Ok(_) => Redirect::to("/timeline").into_response(),
        Err(e) => {
            let message = sanitize("reconnect", e);
            (StatusCode::OK, Html(message.to_string())).into_response()
        }
    }
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CsrfForm>,
) -> Response {
    let session = match require_session(&state, &headers).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    if let Err(response) = check_csrf(&session, &form.csrf_token) {
        return response;
    }
    state.signer.logout(&session.session_id).await;
    state.corrections.drop_session(&session.session_id);

    let mut response = Redirect::to("/login").into_response();
    set_cookie(response.headers_mut(), clear_session_cookie_header());
    response
}

/// The per-session SSE correction stream.
pub async fn corrections_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = cookie_value(&headers, SESSION_COOKIE) else {
        return (StatusCode::UNAUTHORIZED, Html(MSG_INVALID.to_string())).into_response();
    };
    if state.signer.session(&session_id).await.is_none() {
        return (StatusCode::UNAUTHORIZED, Html(MSG_INVALID.to_string())).into_response();
    }
    sse::sse_response(state.corrections.subscribe(&session_id)).into_response()
}
