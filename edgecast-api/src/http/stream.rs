//! Stream relay endpoints
//!
//! Audio stations and TV channels are relayed byte for byte from their
//! configured upstream. A slot on this node is held for as long as the
//! response body is alive.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::Response,
    routing::get,
    Extension, Router,
};
use edgecast_core::service::StreamKind;
use edgecast_core::Error;

use crate::http::middleware::ClientKey;
use crate::http::{middleware, AppError, AppResult, AppState};

pub fn create_stream_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/stream/{id}", get(audio_stream))
        .route("/tv/stream/{channel_id}", get(tv_stream))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::streaming_rate_limit,
        ))
}

pub async fn audio_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(client): Extension<ClientKey>,
    headers: HeaderMap,
) -> AppResult<Response> {
    relay(&state, StreamKind::Audio, &id, &client.0, &headers).await
}

pub async fn tv_stream(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Extension(client): Extension<ClientKey>,
    headers: HeaderMap,
) -> AppResult<Response> {
    relay(&state, StreamKind::Tv, &channel_id, &client.0, &headers).await
}

async fn relay(
    state: &AppState,
    kind: StreamKind,
    source_id: &str,
    client_id: &str,
    headers: &HeaderMap,
) -> AppResult<Response> {
    let sources = match kind {
        StreamKind::Audio => &state.config.streams.stations,
        StreamKind::Tv => &state.config.streams.channels,
    };
    let url = sources
        .get(source_id)
        .ok_or_else(|| AppError::not_found(format!("Unknown {kind} stream '{source_id}'")))?;

    let guard = state
        .streams
        .register_stream_guarded(client_id, kind, source_id)
        .ok_or_else(|| {
            Error::CapacityExceeded(format!(
                "node {} is at its stream limit",
                state.streams.node_id()
            ))
        })?;

    let relayed = state.upstream.open(url, headers, guard).await?;

    let mut response = Response::new(Body::from_stream(relayed.body));
    *response.status_mut() = relayed.status;
    *response.headers_mut() = relayed.headers;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}
