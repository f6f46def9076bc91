//! Cached catalog endpoints

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use edgecast_core::cache::{etag_matches, CatalogCacheStats, CatalogType};
use serde::Serialize;

use crate::http::{admin_routes, middleware, AppError, AppResult, AppState};

pub fn create_catalog_router(state: &AppState) -> Router<AppState> {
    let reads = Router::new()
        .route("/cache/stats", get(cache_stats))
        .route("/cache/{kind}", get(get_catalog))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::catalog_rate_limit,
        ));

    let admin = admin_routes(
        state,
        Router::new().route("/cache/invalidate/{target}", post(invalidate)),
    );

    reads.merge(admin)
}

fn parse_kind(kind: &str) -> AppResult<CatalogType> {
    kind.parse()
        .map_err(|_| AppError::not_found(format!("Unknown catalog '{kind}'")))
}

/// Serve a catalog from cache, honoring `If-None-Match`
pub async fn get_catalog(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let kind = parse_kind(&kind)?;
    let (entry, status) = state.catalog.load(kind).await?;
    let now = Utc::now();

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|inm| etag_matches(inm, &entry.etag));

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        (
            [(header::CONTENT_TYPE, "application/json")],
            entry.data.clone(),
        )
            .into_response()
    };

    let headers = response.headers_mut();
    if let Ok(etag) = HeaderValue::from_str(&entry.etag) {
        headers.insert(header::ETAG, etag);
    }
    let cache_control = format!("public, max-age={}", entry.remaining_ttl_seconds(now));
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert("x-cache-status", HeaderValue::from_static(status.as_str()));
    headers.insert("x-cache-age", HeaderValue::from(entry.age_seconds(now)));

    Ok(response)
}

pub async fn cache_stats(State(state): State<AppState>) -> Json<CatalogCacheStats> {
    Json(state.catalog.cache().stats())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
    pub target: String,
    pub invalidated: usize,
}

/// Drop one catalog, or every catalog with `all`
pub async fn invalidate(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> AppResult<Json<InvalidateResponse>> {
    let cache = state.catalog.cache();
    let invalidated = if target == "all" {
        cache.invalidate_all()
    } else {
        usize::from(cache.invalidate(parse_kind(&target)?))
    };

    Ok(Json(InvalidateResponse {
        target,
        invalidated,
    }))
}
