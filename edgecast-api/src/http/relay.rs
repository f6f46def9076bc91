//! Media relay allocation and fleet management

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use edgecast_core::config::RelayNodeConfig;
use edgecast_relay::{
    Allocation, ConnectionId, CredentialTarget, IceServer, NodeId, RelayNodeInfo, TurnCredentials,
};
use serde::{Deserialize, Serialize};

use crate::http::{admin_routes, middleware, AppError, AppResult, AppState};

pub fn create_relay_router(state: &AppState) -> Router<AppState> {
    let client = Router::new()
        .route("/relay/nodes", get(list_nodes))
        .route("/relay/allocate", post(allocate))
        .route("/relay/release", post(release))
        .route("/relay/credentials", post(credentials))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::streaming_rate_limit,
        ));

    let admin = admin_routes(
        state,
        Router::new()
            .route("/relay/nodes", post(register_node))
            .route("/relay/nodes/{id}", delete(remove_node))
            .route("/relay/nodes/{id}/report", post(report_sample)),
    );

    client.merge(admin)
}

#[derive(Debug, Deserialize)]
pub struct NodesQuery {
    pub region: Option<String>,
}

pub async fn list_nodes(
    State(state): State<AppState>,
    Query(query): Query<NodesQuery>,
) -> Json<Vec<RelayNodeInfo>> {
    Json(match query.region {
        Some(region) => state.relay.get_nodes_by_region(&region),
        None => state.relay.list_nodes(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    pub client_id: String,
    pub peer_id: String,
    pub region: Option<String>,
}

pub async fn allocate(
    State(state): State<AppState>,
    Json(req): Json<AllocateRequest>,
) -> AppResult<Json<Allocation>> {
    let allocation =
        state
            .relay
            .allocate_connection(&req.client_id, &req.peer_id, req.region.as_deref())?;
    Ok(Json(allocation))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub connection_id: String,
}

pub async fn release(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> AppResult<StatusCode> {
    if state
        .relay
        .release_connection(&ConnectionId::from(req.connection_id.as_str()))
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!(
            "Relay connection '{}' not found",
            req.connection_id
        )))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRequest {
    pub user_id: String,
    pub node_id: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsResponse {
    pub credentials: TurnCredentials,
    pub ice_servers: Vec<IceServer>,
}

/// Mint TURN credentials for a specific node or the best node in a region
pub async fn credentials(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> AppResult<Json<CredentialsResponse>> {
    let target = match (req.node_id, req.region) {
        (Some(node_id), _) => CredentialTarget::Node(NodeId::new(node_id)),
        (None, Some(region)) => CredentialTarget::Region(region),
        (None, None) => return Err(AppError::bad_request("nodeId or region is required")),
    };

    let credentials = state.relay.generate_credentials(&req.user_id, &target)?;
    Ok(Json(CredentialsResponse {
        ice_servers: state.relay.ice_servers(&credentials),
        credentials,
    }))
}

pub async fn register_node(
    State(state): State<AppState>,
    Json(node): Json<RelayNodeConfig>,
) -> AppResult<(StatusCode, Json<RelayNodeInfo>)> {
    let info = state.relay.register_node(&node)?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn remove_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    if state.relay.remove_node(&NodeId::new(id.as_str())) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("Relay node '{id}' not found")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleReport {
    pub latency_ms: f64,
    #[serde(default)]
    pub packet_loss: f64,
}

/// Fold an externally measured latency/loss sample into a node's averages
pub async fn report_sample(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<SampleReport>,
) -> AppResult<Json<RelayNodeInfo>> {
    if !report.latency_ms.is_finite()
        || report.latency_ms < 0.0
        || !(0.0..=1.0).contains(&report.packet_loss)
    {
        return Err(AppError::bad_request(
            "latencyMs must be non-negative and packetLoss within [0, 1]",
        ));
    }

    let info = state
        .relay
        .report_sample(&NodeId::new(id), report.latency_ms, report.packet_loss)?;
    Ok(Json(info))
}
