//! Analytics ingestion endpoints

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use edgecast_core::service::{AnalyticsEvent, AnalyticsStats, IngestEvent, IngesterUpdate};
use serde::{Deserialize, Serialize};

use crate::http::{admin_routes, middleware, AppResult, AppState};

pub fn create_analytics_router(state: &AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/analytics/ingest", post(ingest))
        .route("/analytics/stats", get(stats))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::analytics_rate_limit,
        ));

    let admin = admin_routes(
        state,
        Router::new()
            .route("/analytics/flush", post(flush))
            .route("/analytics/configure", post(configure)),
    );

    public.merge(admin)
}

/// A single event or a `{"events": [...]}` batch
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Batch { events: Vec<IngestEvent> },
    Single(IngestEvent),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub accepted: usize,
    pub events: Vec<AnalyticsEvent>,
}

pub async fn ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> AppResult<(StatusCode, Json<IngestResponse>)> {
    let events = match req {
        IngestRequest::Batch { events } => state.analytics.ingest_batch(events)?,
        IngestRequest::Single(event) => vec![state.analytics.ingest(event)?],
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted: events.len(),
            events,
        }),
    ))
}

pub async fn stats(State(state): State<AppState>) -> Json<AnalyticsStats> {
    Json(state.analytics.stats())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushResponse {
    pub flushed: usize,
}

pub async fn flush(State(state): State<AppState>) -> Json<FlushResponse> {
    Json(FlushResponse {
        flushed: state.analytics.flush().len(),
    })
}

pub async fn configure(
    State(state): State<AppState>,
    Json(update): Json<IngesterUpdate>,
) -> AppResult<Json<AnalyticsStats>> {
    Ok(Json(state.analytics.configure(update)?))
}
