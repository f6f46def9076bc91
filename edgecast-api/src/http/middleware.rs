// HTTP middleware

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use edgecast_core::service::admin_auth::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use edgecast_core::service::{RateLimitCategory, RateLimitDecision};
use std::net::SocketAddr;

use super::{AppError, AppState};

/// Identity admission control keyed the request on
#[derive(Debug, Clone)]
pub struct ClientKey(pub String);

fn client_key(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ci| ci.0.ip().to_string())
}

fn rate_limit_headers(headers: &mut HeaderMap, limit: u32, decision: &RateLimitDecision) {
    let values = [
        ("x-ratelimit-limit", limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.timestamp().to_string()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// Fixed-window admission control for one route class.
///
/// Rate-limit headers are attached to every response, admitted or not.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    category: RateLimitCategory,
    mut request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request, state.config.server.trust_forwarded_for);
    let decision = state.rate_limiters.check(category, &key);
    let limit = state.rate_limiters.get(category).max_requests();

    if !decision.allowed {
        tracing::debug!(client = %key, class = %category, "Rate limit exceeded");
        let retry_after = decision.retry_after_seconds(Utc::now());
        let mut response = AppError::from(edgecast_core::Error::AdmissionDenied {
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        })
        .into_response();
        rate_limit_headers(response.headers_mut(), limit, &decision);
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
        return response;
    }

    request.extensions_mut().insert(ClientKey(key));
    let mut response = next.run(request).await;
    rate_limit_headers(response.headers_mut(), limit, &decision);
    response
}

/// Middleware factory for stream relays and relay allocation
pub async fn streaming_rate_limit(state: State<AppState>, request: Request, next: Next) -> Response {
    rate_limit_middleware(state, RateLimitCategory::Streaming, request, next).await
}

/// Middleware factory for catalog, asset and node reads
pub async fn catalog_rate_limit(state: State<AppState>, request: Request, next: Next) -> Response {
    rate_limit_middleware(state, RateLimitCategory::Catalog, request, next).await
}

/// Middleware factory for analytics ingestion
pub async fn analytics_rate_limit(state: State<AppState>, request: Request, next: Next) -> Response {
    rate_limit_middleware(state, RateLimitCategory::Analytics, request, next).await
}

/// Middleware factory for signed admin operations
pub async fn admin_rate_limit(state: State<AppState>, request: Request, next: Next) -> Response {
    rate_limit_middleware(state, RateLimitCategory::Admin, request, next).await
}

/// Verify the admin HMAC over `"{timestamp}.{body}"` before the handler runs.
///
/// The body is buffered for verification and handed on unchanged.
pub async fn admin_signature_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    let timestamp = header(TIMESTAMP_HEADER)
        .ok_or_else(|| AppError::unauthorized("Missing X-Admin-Timestamp header"))?;
    let signature = header(SIGNATURE_HEADER)
        .ok_or_else(|| AppError::unauthorized("Missing X-Admin-Signature header"))?;

    let bytes = axum::body::to_bytes(body, state.config.server.max_body_bytes)
        .await
        .map_err(|_| AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"))?;

    if let Err(e) = state.admin.verify(&timestamp, &signature, &bytes, Utc::now()) {
        tracing::warn!(path = %parts.uri.path(), error = %e, "Rejected admin request");
        return Err(e.into());
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}

/// Baseline response hardening headers
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-content-type-options") {
        headers.insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );
    }
    if !headers.contains_key("x-frame-options") {
        headers.insert(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        );
    }

    response
}
