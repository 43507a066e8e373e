//! Gateway configuration: every tunable named in the design, with
//! defaults, overridable from the environment. Config-file loading is
//! intentionally absent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::Kind;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// General-purpose read relays.
    pub relays: Vec<String>,
    /// Default publish set when an author has no NIP-65 write list.
    pub publish_relays: Vec<String>,
    /// Known-good profile relay, tried first for kind-0 queries.
    pub profile_relays: Vec<String>,
    /// Relays feeding the warm aggregator.
    pub aggregator_relays: Vec<String>,
    /// Relays offered in nostrconnect:// URIs.
    pub signer_relays: Vec<String>,
    pub redis_url: Option<String>,
    /// Development mode persists the server keypair here; production keeps
    /// it ephemeral.
    pub dev_keypair_path: Option<PathBuf>,
    pub fetch_timeout: Duration,
    pub nip46_request_timeout: Duration,
    /// Which kind registry is active (see [`kinds`]).
    pub extended_kinds: bool,
    pub app_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let default_relays = vec![
            "wss://relay.damus.io".to_string(),
            "wss://nos.lol".to_string(),
            "wss://relay.nostr.band".to_string(),
        ];
        Self {
            listen_addr: "127.0.0.1:8080".parse().expect("static addr"),
            relays: default_relays.clone(),
            publish_relays: default_relays.clone(),
            profile_relays: vec!["wss://purplepag.es".to_string()],
            aggregator_relays: default_relays,
            signer_relays: vec!["wss://relay.nsec.app".to_string()],
            redis_url: None,
            dev_keypair_path: None,
            fetch_timeout: Duration::from_secs(5),
            nip46_request_timeout: Duration::from_secs(30),
            extended_kinds: true,
            app_name: "nostr-gateway".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `GATEWAY_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(listen) = std::env::var("GATEWAY_LISTEN") {
            if let Ok(addr) = listen.parse() {
                config.listen_addr = addr;
            }
        }
        if let Some(relays) = env_relay_list("GATEWAY_RELAYS") {
            config.relays = relays.clone();
            config.publish_relays = relays.clone();
            config.aggregator_relays = relays;
        }
        if let Some(relays) = env_relay_list("GATEWAY_PROFILE_RELAYS") {
            config.profile_relays = relays;
        }
        if let Some(relays) = env_relay_list("GATEWAY_SIGNER_RELAYS") {
            config.signer_relays = relays;
        }
        if let Ok(url) = std::env::var("GATEWAY_REDIS_URL") {
            if !url.is_empty() {
                config.redis_url = Some(url);
            }
        }
        if let Ok(path) = std::env::var("GATEWAY_DEV_KEYS") {
            if !path.is_empty() {
                config.dev_keypair_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(value) = std::env::var("GATEWAY_REDUCED_KINDS") {
            config.extended_kinds = value != "1";
        }
        config
    }
}

fn env_relay_list(name: &str) -> Option<Vec<String>> {
    let raw = std::env::var(name).ok()?;
    let relays: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if relays.is_empty() {
        None
    } else {
        Some(relays)
    }
}

/// The kind registries. Which one is active is an explicit configuration
/// decision (`GatewayConfig::extended_kinds`); kinds outside the active
/// set fall through to the generic renderer.
pub mod kinds {
    use super::Kind;
    use crate::types;

    /// The minimum set a timeline can render specifically.
    pub const REDUCED: &[Kind] = &[
        types::METADATA,
        types::TEXT_NOTE,
        types::CONTACT_LIST,
        types::REPOST,
        types::REACTION,
    ];

    /// The full set of specifically-rendered kinds.
    pub const EXTENDED: &[Kind] = &[
        types::METADATA,
        types::TEXT_NOTE,
        types::CONTACT_LIST,
        types::REPOST,
        types::REACTION,
        types::REPORT,
        types::ZAP_REQUEST,
        types::ZAP_RECEIPT,
        types::MUTE_LIST,
        types::RELAY_LIST,
        types::BOOKMARK_LIST,
        30023, // long-form article
    ];

    pub fn registry(extended: bool) -> &'static [Kind] {
        if extended {
            EXTENDED
        } else {
            REDUCED
        }
    }

    pub fn is_registered(kind: Kind, extended: bool) -> bool {
        registry(extended).contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = GatewayConfig::default();
        assert!(!config.relays.is_empty());
        assert!(!config.profile_relays.is_empty());
        assert!(config.redis_url.is_none());
        assert!(config.extended_kinds);
    }

    #[test]
    fn reduced_registry_is_a_subset_of_extended() {
        for kind in kinds::REDUCED {
            assert!(kinds::EXTENDED.contains(kind));
        }
        assert!(kinds::is_registered(1, false));
        assert!(!kinds::is_registered(30023, false));
        assert!(kinds::is_registered(30023, true));
        // Unknown kinds are unregistered in both sets.
        assert!(!kinds::is_registered(4242, true));
    }
}
