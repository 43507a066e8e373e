//! Relay URL validation and normalization.
//!
//! Every URL entering the pool goes through both, so the connection map is
//! keyed by a single canonical spelling per relay.

use url::Url;

use super::types::RelayError;

pub fn validate_relay_url(input: &str) -> Result<(), RelayError> {
    let parsed =
        Url::parse(input).map_err(|e| RelayError::InvalidUrl(format!("{input}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(RelayError::InvalidUrl(format!(
                "{input}: unsupported scheme {other}"
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(RelayError::InvalidUrl(format!("{input}: missing host")));
    }
    Ok(())
}

/// Lowercase scheme and host, strip a trailing slash on a bare path.
pub fn normalize_relay_url(input: &str) -> String {
    match Url::parse(input) {
        Ok(parsed) => {
            let mut normalized = parsed.to_string();
            if parsed.path() == "/" && normalized.ends_with('/') {
                normalized.pop();
            }
            normalized
        }
        Err(_) => input.trim_end_matches('/').to_string(),
    }
}
