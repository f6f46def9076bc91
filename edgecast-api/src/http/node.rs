//! Node introspection

use axum::{extract::State, routing::get, Json, Router};
use edgecast_core::cache::{AssetCacheStats, CatalogCacheStats};
use edgecast_core::service::{AnalyticsStats, NodeInfo, StreamMetrics};
use edgecast_relay::RelayAggregateMetrics;
use serde::Serialize;

use crate::http::{middleware, AppState};

pub fn create_node_router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/node/info", get(node_info))
        .route("/node/metrics", get(node_metrics))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::catalog_rate_limit,
        ))
}

pub async fn node_info(State(state): State<AppState>) -> Json<NodeInfo> {
    Json(state.streams.node_info())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetricsResponse {
    pub node: NodeInfo,
    pub streams: StreamMetrics,
    pub relay: RelayAggregateMetrics,
    pub catalog: CatalogCacheStats,
    pub assets: AssetCacheStats,
    pub analytics: AnalyticsStats,
}

pub async fn node_metrics(State(state): State<AppState>) -> Json<NodeMetricsResponse> {
    Json(NodeMetricsResponse {
        node: state.streams.node_info(),
        streams: state.streams.metrics(),
        relay: state.relay.aggregate_metrics(),
        catalog: state.catalog.cache().stats(),
        assets: state.assets.stats(),
        analytics: state.analytics.stats(),
    })
}
