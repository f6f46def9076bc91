// Module: http
// HTTP/JSON surface of the edge node

pub mod analytics;
pub mod assets;
pub mod catalog;
pub mod error;
pub mod health;
pub mod middleware;
pub mod node;
pub mod relay;
pub mod stream;

use axum::{extract::DefaultBodyLimit, Router};
use edgecast_core::cache::{AssetCache, CatalogCache, CatalogLoader};
use edgecast_core::service::analytics::AnalyticsEvent;
use edgecast_core::service::{AdminVerifier, AnalyticsIngester, RateLimiters, StreamNode};
use edgecast_core::Config;
use edgecast_proxy::{HttpCatalogSource, UpstreamClient};
use edgecast_relay::RelayRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rate_limiters: Arc<RateLimiters>,
    pub catalog: Arc<CatalogLoader>,
    pub assets: Arc<AssetCache>,
    pub streams: Arc<StreamNode>,
    pub upstream: UpstreamClient,
    pub relay: Arc<RelayRegistry>,
    pub analytics: Arc<AnalyticsIngester>,
    pub admin: AdminVerifier,
}

impl AppState {
    /// Wire every service from configuration.
    ///
    /// Flushed analytics batches go to `sink_tx`; background loops are not
    /// started here.
    pub fn from_config(
        config: Config,
        node_id: impl Into<String>,
        sink_tx: mpsc::Sender<Vec<AnalyticsEvent>>,
    ) -> anyhow::Result<Self> {
        let node_id = node_id.into();
        let upstream = UpstreamClient::new(&config.node)?;

        let catalog_source = HttpCatalogSource::new(
            upstream.http().clone(),
            &config.catalog,
            Duration::from_millis(config.node.upstream_response_timeout_ms),
        );
        let catalog_cache = Arc::new(CatalogCache::new(Duration::from_secs(
            config.catalog.default_ttl_seconds,
        )));

        Ok(Self {
            rate_limiters: Arc::new(RateLimiters::new(&config.rate_limit)),
            catalog: Arc::new(CatalogLoader::new(catalog_cache, Arc::new(catalog_source))),
            assets: Arc::new(AssetCache::new(config.assets.max_bytes)),
            streams: Arc::new(StreamNode::new(node_id.clone(), &config.node)),
            upstream,
            relay: Arc::new(RelayRegistry::new(&config.relay)),
            analytics: Arc::new(AnalyticsIngester::new(
                node_id,
                config.node.region.clone(),
                &config.analytics,
                sink_tx,
            )),
            admin: AdminVerifier::new(&config.admin),
            config: Arc::new(config),
        })
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let max_body_bytes = state.config.server.max_body_bytes;

    Router::new()
        // Health and Prometheus exposition are never rate limited
        .merge(health::create_health_router())
        .merge(node::create_node_router(&state))
        .merge(catalog::create_catalog_router(&state))
        .merge(stream::create_stream_router(&state))
        .merge(assets::create_assets_router(&state))
        .merge(relay::create_relay_router(&state))
        .merge(analytics::create_analytics_router(&state))
        .layer(axum::middleware::from_fn(middleware::security_headers_middleware))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wrap admin routes: rate limiting runs first, then the HMAC check
pub(crate) fn admin_routes(state: &AppState, router: Router<AppState>) -> Router<AppState> {
    router
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admin_signature_middleware,
        ))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admin_rate_limit,
        ))
}
