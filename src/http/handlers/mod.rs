//! Request handlers.

pub mod auth;
pub mod read;
pub mod write;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};

use super::error::MSG_INVALID;
use super::session::{cookie_value, tokens_match, SESSION_COOKIE};
use super::AppState;
use crate::signer::BunkerSession;

/// Resolve the session cookie or bounce to the login page.
pub(crate) async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<BunkerSession, Response> {
    let session_id = cookie_value(headers, SESSION_COOKIE)
        .ok_or_else(|| Redirect::to("/login").into_response())?;
    state
        .signer
        .session(&session_id)
        .await
        .ok_or_else(|| Redirect::to("/login").into_response())
}

/// Every mutating endpoint checks the token against the session.
pub(crate) fn check_csrf(session: &BunkerSession, presented: &str) -> Result<(), Response> {
    if tokens_match(&session.csrf_token, presented) {
        Ok(())
    } else {
        tracing::warn!(session = %session.session_id, "CSRF token mismatch");
        Err((StatusCode::FORBIDDEN, Html(MSG_INVALID.to_string())).into_response())
    }
}

/// A single header signals a fragment request: only the updated
/// component's markup is returned.
pub(crate) fn wants_fragment(headers: &HeaderMap) -> bool {
    headers.contains_key("hx-request")
}

/// Best-effort client address for rate limiting.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "direct".to_string())
}

pub(crate) fn error_fragment(message: &'static str) -> Response {
    (
        StatusCode::OK,
        Html(format!("<span class=\"error\">{message}</span>")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn fragment_detection() {
        let mut headers = HeaderMap::new();
        assert!(!wants_fragment(&headers));
        headers.insert("hx-request", HeaderValue::from_static("true"));
        assert!(wants_fragment(&headers));
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "direct");
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.9");
    }
}
