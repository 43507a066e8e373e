//! HTTP surface: routing, session/CSRF gates, SSE corrections, and the
//! thin handler layer between browsers and the core.

pub mod error;
pub mod handlers;
pub mod render;
pub mod session;
pub mod sse;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::cache::CachePlane;
use crate::config::GatewayConfig;
use crate::network::{Aggregator, Fetcher, Publisher};
use crate::signer::SignerService;
use sse::CorrectionChannel;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub cache: CachePlane,
    pub fetcher: Fetcher,
    pub aggregator: Arc<Aggregator>,
    pub publisher: Publisher,
    pub signer: Arc<SignerService>,
    pub corrections: Arc<CorrectionChannel>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::read::timeline))
        .route(
            "/login",
            get(handlers::auth::login_page).post(handlers::auth::login_submit),
        )
        .route("/check-connection", get(handlers::auth::check_connection))
        .route("/reconnect", post(handlers::auth::reconnect))
        .route("/logout", post(handlers::auth::logout))
        .route("/events", get(handlers::auth::corrections_stream))
        .route("/timeline", get(handlers::read::timeline))
        .route("/thread/:id", get(handlers::read::thread))
        .route("/profile/:id", get(handlers::read::profile))
        .route("/notifications", get(handlers::read::notifications))
        .route("/search", get(handlers::read::search))
        .route("/post", post(handlers::write::post))
        .route("/reply", post(handlers::write::reply))
        .route("/react", post(handlers::write::react))
        .route("/repost", post(handlers::write::repost))
        .route("/bookmark", post(handlers::write::bookmark))
        .route("/mute", post(handlers::write::mute))
        .route("/follow", post(handlers::write::follow))
        .route("/quote/:id", post(handlers::write::quote))
        .route("/report/:id", post(handlers::write::report))
        .route("/zap", post(handlers::write::zap))
        .route("/wallet/balance", post(handlers::write::wallet_balance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
