use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use secrecy::ExposeSecret;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::AppState;

/// Constant-time string comparison to prevent timing side-channel attacks.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Address of the client a request is on behalf of.
///
/// Forwarding headers (first `X-Forwarded-For` entry, then `X-Real-IP`) are
/// only read when the socket peer is one of `trusted_proxies`. Any other peer
/// is the client itself.
pub(crate) fn extract_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &[IpAddr],
) -> String {
    let Some(peer) = peer.map(|addr| addr.ip()) else {
        return "unknown".to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

/// Extract API credential from request headers (Bearer token or x-api-key).
pub(crate) fn extract_api_credential(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
}

fn auth_error_response(message: &str) -> Response {
    let body = Json(serde_json::json!({ "message": message }));
    (StatusCode::UNAUTHORIZED, body).into_response()
}

/// Guards `/api/*` with `server.api_key`. Login and health routes are public;
/// with no key configured everything passes.
pub(crate) async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !request.uri().path().starts_with("/api/") {
        return next.run(request).await;
    }

    let api_key = state
        .config
        .server
        .api_key
        .as_ref()
        .map(|k| k.expose_secret().as_str())
        .unwrap_or("");
    if api_key.is_empty() {
        return next.run(request).await;
    }

    let authorized = matches!(
        extract_api_credential(request.headers()),
        Some(t) if constant_time_eq(t, api_key)
    );
    if authorized {
        next.run(request).await
    } else {
        auth_error_response(
            "Invalid or missing API key. Provide via Authorization: Bearer <key> or x-api-key header.",
        )
    }
}
