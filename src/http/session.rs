//! Session cookies and CSRF binding.
//!
//! `nostr_session` (HttpOnly, SameSite=Lax, 24 h) carries the random
//! session id. `anon_session` (HttpOnly, SameSite=Strict, 5 min,
//! single-use) binds CSRF tokens on the login page before a session
//! exists.

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};

use crate::cache::stores::ANON_CSRF;
use crate::cache::CachePlane;

pub const SESSION_COOKIE: &str = "nostr_session";
pub const ANON_COOKIE: &str = "anon_session";

const SESSION_MAX_AGE_SECS: u64 = 24 * 3600;
const ANON_MAX_AGE_SECS: u64 = 300;

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

pub fn session_cookie_header(session_id: &str) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={SESSION_MAX_AGE_SECS}"
    ))
    .expect("cookie header")
}

pub fn anon_cookie_header(anon_id: &str) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{ANON_COOKIE}={anon_id}; Path=/; HttpOnly; SameSite=Strict; Max-Age={ANON_MAX_AGE_SECS}"
    ))
    .expect("cookie header")
}

pub fn clear_session_cookie_header() -> HeaderValue {
    HeaderValue::from_static("nostr_session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

pub fn set_cookie(headers: &mut HeaderMap, value: HeaderValue) {
    headers.append(SET_COOKIE, value);
}

/// Length-independent-ish token comparison; bails early only on length.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .bytes()
        .zip(presented.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Issue an anonymous CSRF binding for the login page: a fresh anon id
/// cookie plus a token stored under it.
pub async fn issue_anon_csrf(cache: &CachePlane) -> (String, String) {
    let anon_id = crate::utils::random_hex(16);
    let token = crate::utils::random_hex(32);
    cache
        .store::<String>(ANON_CSRF)
        .put(&anon_id, token.clone())
        .await;
    (anon_id, token)
}

/// Verify and consume (single-use) the anonymous CSRF token.
pub async fn consume_anon_csrf(cache: &CachePlane, anon_id: &str, presented: &str) -> bool {
    let store = cache.store::<String>(ANON_CSRF);
    let Some(cached) = store.get(anon_id).await else {
        return false;
    };
    store.delete(anon_id).await;
    cached
        .payload
        .is_some_and(|token| tokens_match(&token, presented))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use std::sync::Arc;

    fn cache() -> CachePlane {
        CachePlane::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn cookie_parsing_handles_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("other=1; nostr_session=abc123; theme=dark"),
        );
        assert_eq!(
            cookie_value(&headers, SESSION_COOKIE).as_deref(),
            Some("abc123")
        );
        assert_eq!(cookie_value(&headers, "theme").as_deref(), Some("dark"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn session_cookie_attributes() {
        let value = session_cookie_header("abc");
        let s = value.to_str().unwrap();
        assert!(s.contains("HttpOnly"));
        assert!(s.contains("SameSite=Lax"));
        assert!(s.contains("Max-Age=86400"));

        let anon = anon_cookie_header("xyz");
        let s = anon.to_str().unwrap();
        assert!(s.contains("SameSite=Strict"));
        assert!(s.contains("Max-Age=300"));
    }

    #[test]
    fn token_comparison() {
        assert!(tokens_match("abcdef", "abcdef"));
        assert!(!tokens_match("abcdef", "abcdeg"));
        assert!(!tokens_match("abcdef", "abcde"));
    }

    #[tokio::test]
    async fn anon_csrf_is_single_use() {
        let cache = cache();
        let (anon_id, token) = issue_anon_csrf(&cache).await;
        assert!(consume_anon_csrf(&cache, &anon_id, &token).await);
        // Second presentation fails: the binding was consumed.
        assert!(!consume_anon_csrf(&cache, &anon_id, &token).await);
    }

    #[tokio::test]
    async fn anon_csrf_rejects_wrong_token() {
        let cache = cache();
        let (anon_id, _token) = issue_anon_csrf(&cache).await;
        assert!(!consume_anon_csrf(&cache, &anon_id, "forged").await);
    }
}
