mod handlers;
mod middleware;

use crate::auth::{
    Corroboration, FastAuthGate, IdentityProvider, OAuthClient, TrustStore, TrustVerifier,
    TtlPolicy,
};
use crate::cache::{CacheError, ExpiringCache, MemoryCache, RedisCache};
use crate::cli::{format_bind_addr, AppConfig, CacheBackend, CacheConfig};
use anyhow::Context;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Path the provider redirects back to after authorization.
pub const CALLBACK_PATH: &str = "/oauth/success";

/// Shared request state. Built once at startup.
pub struct AppState {
    pub config: AppConfig,
    pub cache: Arc<dyn ExpiringCache>,
    pub gate: FastAuthGate,
    pub corroboration: Corroboration,
    pub provider: Arc<dyn IdentityProvider>,
    /// Absolute URL of [`CALLBACK_PATH`]
    pub callback_url: String,
}

impl AppState {
    /// Wire the gate, trust store and verifier over one shared cache handle.
    pub fn new(
        config: AppConfig,
        cache: Arc<dyn ExpiringCache>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        let fast_auth = &config.fast_auth;
        let trust = Arc::new(TrustStore::new(cache.clone(), fast_auth.trust.clone()));
        let verifier = TrustVerifier::new(cache.clone(), trust.clone(), &fast_auth.verifier);
        let corroboration = verifier.corroboration().clone();
        let gate = FastAuthGate::new(
            fast_auth.enabled,
            cache.clone(),
            trust,
            Arc::new(verifier),
            TtlPolicy::from_config(fast_auth),
        );
        let callback_url = format!("{}{}", config.server.base_url(), CALLBACK_PATH);

        Self {
            config,
            cache,
            gate,
            corroboration,
            provider,
            callback_url,
        }
    }
}

/// Construct the configured cache backend.
pub fn build_cache(config: &CacheConfig) -> Result<Arc<dyn ExpiringCache>, CacheError> {
    match config.backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryCache::new(config.max_capacity))),
        CacheBackend::Redis => Ok(Arc::new(RedisCache::connect(&config.redis)?)),
    }
}

/// All routes, with the API-key layer applied.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/oauth/begin", get(handlers::oauth_begin))
        .route(CALLBACK_PATH, get(handlers::oauth_success))
        .route("/api/corroborations", post(handlers::record_corroboration))
        .route("/health", get(handlers::health_check))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(config: AppConfig) -> anyhow::Result<()> {
    let cache = build_cache(&config.cache).context("Failed to initialize cache backend")?;
    match cache.ping().await {
        Ok(()) => info!("🗄️  Cache backend ready ({:?})", config.cache.backend),
        // Requests degrade to the full redirect until the backend comes back.
        Err(e) => warn!("⚠️  Cache backend not reachable yet: {}", e),
    }

    let provider = OAuthClient::new(config.provider.clone())
        .context("Failed to initialize identity provider client")?;

    if config.fast_auth.enabled {
        info!(
            "⚡ Fast login enabled (threshold {}, penalty {}, verify after {}s)",
            config.fast_auth.trust.threshold,
            config.fast_auth.verifier.penalty,
            config.fast_auth.verifier.delay_secs
        );
    } else {
        info!("Fast login disabled; every login goes through the provider");
    }

    let addr = format_bind_addr(&config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, cache, Arc::new(provider)));
    let app = build_router(state);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🚀 Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Handler failure, rendered as `{"message": ...}`.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    /// The identity provider refused or failed the call
    Provider(String),
    Unavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Provider(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(serde_json::json!({ "message": message }));
        (status, body).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Provider(msg) => write!(f, "Provider error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}
