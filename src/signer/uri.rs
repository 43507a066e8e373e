//! NIP-46 connection URIs.
//!
//! `bunker://<signer-pubkey>?relay=…&secret=…` is pasted by the user; the
//! gateway initiates. `nostrconnect://<client-pubkey>?relay=…&secret=…` is
//! displayed by the gateway (URL or QR); the signer initiates.

use url::Url;

use super::SignerError;
use crate::types::{Keys, PublicKey};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BunkerUri {
    pub signer_pubkey: PublicKey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

pub fn parse_bunker_uri(input: &str) -> Result<BunkerUri, SignerError> {
    let url = Url::parse(input).map_err(|e| SignerError::InvalidUri(e.to_string()))?;
    if url.scheme() != "bunker" {
        return Err(SignerError::InvalidUri(format!(
            "expected bunker:// scheme, got {}",
            url.scheme()
        )));
    }
    let signer_pubkey = url
        .host_str()
        .ok_or_else(|| SignerError::InvalidUri("missing signer pubkey".into()))
        .and_then(|host| {
            PublicKey::from_hex(host)
                .map_err(|_| SignerError::InvalidUri("signer pubkey is not 64-char hex".into()))
        })?;

    let mut relays = Vec::new();
    let mut secret = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "relay" => {
                crate::relays::utils::validate_relay_url(&value)?;
                relays.push(crate::relays::utils::normalize_relay_url(&value));
            }
            "secret" => secret = Some(value.into_owned()),
            _ => {}
        }
    }
    if relays.is_empty() {
        return Err(SignerError::InvalidUri("no relay hints".into()));
    }
    Ok(BunkerUri {
        signer_pubkey,
        relays,
        secret,
    })
}

/// Build the `nostrconnect://` URI the gateway shows while listening.
pub fn build_nostrconnect_uri(
    client_keys: &Keys,
    relays: &[String],
    secret: &str,
    app_name: &str,
) -> String {
    let mut uri = format!("nostrconnect://{}", client_keys.public_key().to_hex());
    let mut separator = '?';
    for relay in relays {
        uri.push(separator);
        uri.push_str("relay=");
        uri.push_str(&urlencode(relay));
        separator = '&';
    }
    uri.push(separator);
    uri.push_str("secret=");
    uri.push_str(&urlencode(secret));
    uri.push_str("&name=");
    uri.push_str(&urlencode(app_name));
    uri
}

/// Percent-encode the characters that matter inside a query value.
fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
