//! Static asset endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::Engine;
use bytes::Bytes;
use edgecast_core::cache::{AssetCacheStats, AssetType, ByteRange, ChecksumReport, NewAsset, StaticAsset};
use edgecast_core::Error;
use serde::Deserialize;

use crate::http::{admin_routes, middleware, AppError, AppResult, AppState};

pub fn create_assets_router(state: &AppState) -> Router<AppState> {
    let reads = Router::new()
        .route("/assets", get(list_assets))
        .route("/assets/stats", get(asset_stats))
        .route("/assets/{id}", get(get_asset))
        .route("/assets/{id}/info", get(asset_info))
        .route("/assets/{id}/verify", post(verify_asset))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::catalog_rate_limit,
        ));

    let admin = admin_routes(
        state,
        Router::new()
            .route("/assets", post(upload_asset))
            .route("/assets/{id}", delete(delete_asset)),
    );

    reads.merge(admin)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub asset_type: Option<String>,
}

pub async fn list_assets(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<StaticAsset>>> {
    let filter = query
        .asset_type
        .as_deref()
        .map(str::parse::<AssetType>)
        .transpose()?;
    Ok(Json(state.assets.list(filter)))
}

pub async fn asset_stats(State(state): State<AppState>) -> Json<AssetCacheStats> {
    Json(state.assets.stats())
}

/// Serve asset bytes, whole or a single `Range`
pub async fn get_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let range = headers
        .get(header::RANGE)
        .map(|v| {
            v.to_str()
                .map_err(|_| Error::Validation("Range header is not valid ASCII".to_string()))
                .and_then(ByteRange::parse)
        })
        .transpose()?;

    let read = state.assets.read(&id, range)?;

    let mut response = read.data.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(&read.asset.mime_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", read.asset.sha256)) {
        headers.insert(header::ETAG, value);
    }
    if let Some((start, end)) = read.range {
        let content_range = format!("bytes {start}-{end}/{}", read.total_size);
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            headers.insert(header::CONTENT_RANGE, value);
        }
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    }

    Ok(response)
}

pub async fn asset_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<StaticAsset>> {
    state
        .assets
        .info(&id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Asset '{id}' not found")))
}

/// Recompute the checksum; a corrupted asset is reported as a server error
pub async fn verify_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ChecksumReport>> {
    let report = state
        .assets
        .verify_checksum(&id)
        .ok_or_else(|| AppError::not_found(format!("Asset '{id}' not found")))?;

    if !report.valid {
        return Err(Error::ChecksumMismatch {
            asset_id: id,
            expected: report.expected,
            actual: report.actual,
        }
        .into());
    }
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    /// Base64 payload
    pub data: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

pub async fn upload_asset(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> AppResult<(StatusCode, Json<StaticAsset>)> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.data.as_bytes())
        .map_err(|e| AppError::bad_request(format!("data is not valid base64: {e}")))?;

    let asset = state.assets.add(NewAsset {
        id: req.id,
        name: req.name,
        asset_type: req.asset_type,
        bytes: Bytes::from(bytes),
        mime_type: req.mime_type,
        version: req.version,
        metadata: req.metadata,
    })?;

    Ok((StatusCode::CREATED, Json(asset)))
}

pub async fn delete_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    if state.assets.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("Asset '{id}' not found")))
    }
}
