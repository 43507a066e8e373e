use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use nostr_gateway::cache::{backend_from_config, CachePlane};
use nostr_gateway::config::GatewayConfig;
use nostr_gateway::http::{router, sse::CorrectionChannel, AppState};
use nostr_gateway::network::{Aggregator, Fetcher, Publisher};
use nostr_gateway::relays::{RelayConfig, RelayPool};
use nostr_gateway::signer::nip46::SignerConfig;
use nostr_gateway::signer::{ServerIdentity, SignerService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nostr_gateway::logging::init();
    let config = Arc::new(GatewayConfig::from_env());

    let identity = match &config.dev_keypair_path {
        Some(path) => ServerIdentity::load_or_create(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerIdentity::ephemeral(),
    };
    tracing::info!(pubkey = %identity.keys.public_key(), "gateway identity ready");

    let backend = backend_from_config(config.redis_url.as_deref()).await;
    let cache = CachePlane::new(backend);

    let pool = Arc::new(RelayPool::new(RelayConfig::default()));
    let fetcher = Fetcher::new(pool.clone(), cache.clone());
    let publisher = Publisher::new(pool.clone());

    let aggregator = Arc::new(Aggregator::new(config.aggregator_relays.clone()));
    aggregator.clone().start(pool.clone());

    let signer = SignerService::new(
        &cache,
        SignerConfig {
            relays: config.signer_relays.clone(),
            app_name: config.app_name.clone(),
            request_timeout: config.nip46_request_timeout,
            ..SignerConfig::default()
        },
        RelayConfig::default(),
    );

    spawn_health_snapshots(pool.clone(), cache.clone());

    let state = AppState {
        config: config.clone(),
        cache,
        fetcher,
        aggregator,
        publisher,
        signer,
        corrections: Arc::new(CorrectionChannel::new()),
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(pool))
        .await
        .context("http server")?;
    Ok(())
}

/// Persist relay-health snapshots so scores survive a short restart.
fn spawn_health_snapshots(pool: Arc<RelayPool>, cache: CachePlane) {
    tokio::spawn(async move {
        let store = cache.store::<nostr_gateway::relays::RelayHealth>(
            nostr_gateway::cache::stores::RELAY_HEALTH,
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for (url, health) in pool.health().snapshot() {
                store.put(&url, health).await;
            }
        }
    });
}

async fn shutdown_signal(pool: Arc<RelayPool>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
    pool.shutdown().await;
}
