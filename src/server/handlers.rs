use super::middleware::extract_client_ip;
use super::{AppError, AppState};
use crate::auth::{Direction, FastAuthDecision, Fingerprint, ProviderUser};
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header::LOCATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Deserialize)]
pub(crate) struct BeginParams {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Start a login: answer from the identity cache when the gate allows it,
/// otherwise redirect to the provider.
pub(crate) async fn oauth_begin(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BeginParams>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let address = extract_client_ip(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        &state.config.server.trusted_proxies,
    );

    match state
        .gate
        .decide_headers::<ProviderUser>(&address, &headers)
        .await
    {
        FastAuthDecision::Accept(user) => {
            Ok(Json(serde_json::json!({ "data": user, "fast": true })).into_response())
        }
        FastAuthDecision::Redirect(reason) => {
            debug!("Redirecting {} to provider ({})", address, reason.label());
            let direction = Direction {
                origin: address,
                redirect_uri: state.callback_url.clone(),
                scope: params.scope.unwrap_or_default(),
                state: params.state.unwrap_or_else(|| "STATE".to_string()),
            };
            let url = state
                .provider
                .authorize_url(&direction)
                .map_err(|e| AppError::Provider(e.to_string()))?;
            Ok((StatusCode::FOUND, [(LOCATION, url)]).into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SuccessParams {
    #[serde(default)]
    code: String,
}

/// Provider callback: exchange the code, fetch the profile, cache it for
/// later fast logins.
pub(crate) async fn oauth_success(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SuccessParams>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if params.code.is_empty() {
        return Err(AppError::BadRequest("code is empty".to_string()));
    }

    let grant = state
        .provider
        .exchange_code(&params.code)
        .await
        .map_err(|e| AppError::Provider(e.to_string()))?;
    let user = state
        .provider
        .fetch_user(&grant)
        .await
        .map_err(|e| AppError::Provider(e.to_string()))?;

    let address = extract_client_ip(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        &state.config.server.trusted_proxies,
    );
    let fingerprint = Fingerprint::from_headers(&headers);
    if let Err(e) = state
        .gate
        .remember(&address, fingerprint.as_ref(), &user)
        .await
    {
        // The login itself succeeded; only the next fast path is lost.
        warn!("Failed to cache identity {}: {}", user.openid, e);
    }

    Ok(Json(serde_json::json!({ "data": user, "fast": false })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CorroborationRequest {
    identifier: String,
}

/// Called by the provider-callback side whenever it independently sees an identity.
pub(crate) async fn record_corroboration(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CorroborationRequest>,
) -> Result<StatusCode, AppError> {
    if request.identifier.is_empty() {
        return Err(AppError::BadRequest("identifier is empty".to_string()));
    }

    state
        .corroboration
        .record(&request.identifier)
        .await
        .map_err(|e| {
            error!("Failed to record corroboration for {}: {}", request.identifier, e);
            AppError::Unavailable(e.to_string())
        })?;

    Ok(StatusCode::NO_CONTENT)
}

/// Health check endpoint
pub(crate) async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.ping().await {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "service": "trustgate",
            "fast_auth": state.gate.is_enabled(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "service": "trustgate",
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}
