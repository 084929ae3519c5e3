//! Realtime voice relay library crate.
//!
//! Everything the binary and the integration tests need: the component
//! modules plus [`AppState`] and [`build_router`].

use std::sync::Arc;

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod tools;

use auth::CredentialStore;
use middleware::rate_limit::RateLimiter;
use middleware::usage::UsageLedger;
use proxy::frontend::ConnectionRegistry;
use proxy::pool::SessionPool;
use tools::ToolRegistryClient;

/// Shared application state passed to handlers.
///
/// The store, pool, and accountant are process-wide singletons with their
/// lifecycle tied to this struct: injected handles, not ambient globals,
/// so tests can assemble their own.
pub struct AppState {
    pub auth: Arc<dyn CredentialStore>,
    pub pool: Arc<SessionPool>,
    pub usage: Arc<UsageLedger>,
    pub limiter: Arc<RateLimiter>,
    pub tools: Option<Arc<ToolRegistryClient>>,
    pub connections: ConnectionRegistry,
    pub config: config::Config,
}

impl AppState {
    pub fn new(
        auth: Arc<dyn CredentialStore>,
        tools: Option<Arc<ToolRegistryClient>>,
        config: config::Config,
    ) -> Self {
        let minter = proxy::minter::TokenMinter::new(
            config.sessions_url(),
            config.upstream_api_key.clone(),
        );
        Self {
            auth,
            pool: Arc::new(SessionPool::new(config.pool_capacity, minter, config.clone())),
            usage: Arc::new(UsageLedger::new()),
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_capacity,
                config.rate_limit_capacity,
                std::time::Duration::from_secs(config.rate_limit_window_secs),
            )),
            tools,
            connections: ConnectionRegistry::new(),
            config,
        }
    }
}

/// The relay's full route table.
pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        // Liveness endpoints (no auth)
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(|| async { "ok" }))
        // Operator surfaces
        .route("/health", axum::routing::get(api::health_handler))
        .route("/metrics", axum::routing::get(api::metrics_handler))
        // The relay itself
        .route("/ws", axum::routing::get(proxy::frontend::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
