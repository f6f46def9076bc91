use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use base64::Engine;
use chrono::Utc;
use edgecast_api::{create_router, AppState};
use edgecast_core::config::{RateLimitRule, RelayNodeConfig};
use edgecast_core::service::admin_auth::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use edgecast_core::service::analytics::{sink_channel, AnalyticsEvent};
use edgecast_core::Config;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> Config {
    let mut config = Config::default();
    config.node.node_id = "edge-test".to_string();
    config.node.region = "eu".to_string();
    config.node.upstream_response_timeout_ms = 2_000;
    config.relay.shared_secret = "relay_secret_0123456789abcdefghijklmn".to_string();
    config.admin.secret = "admin_secret_0123456789abcdefghijklmn".to_string();
    config
}

struct TestApp {
    router: Router,
    state: AppState,
    _sink_rx: mpsc::Receiver<Vec<AnalyticsEvent>>,
}

impl TestApp {
    fn new(config: Config) -> Self {
        let (tx, rx) = sink_channel(16);
        let state = AppState::from_config(config, "edge-test", tx).unwrap();
        Self {
            router: create_router(state.clone()),
            state,
            _sink_rx: rx,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_json(&self, uri: &str, body: Value) -> Response {
        self.send(
            Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    fn signed(&self, method: Method, uri: &str, body: &str) -> Request<Body> {
        let ts = Utc::now().timestamp();
        let signature = self.state.admin.sign(ts, body.as_bytes()).unwrap();
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, ts.to_string())
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_health_and_metrics() {
    let app = TestApp::new(test_config());

    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(body_bytes(response).await, b"OK");

    let response = app.get("/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

#[tokio::test]
async fn test_node_info_and_metrics() {
    let app = TestApp::new(test_config());

    let response = app.get("/node/info").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-limit"));
    let info = body_json(response).await;
    assert_eq!(info["nodeId"], "edge-test");
    assert_eq!(info["region"], "eu");
    assert_eq!(info["healthy"], true);

    let metrics = body_json(app.get("/node/metrics").await).await;
    assert_eq!(metrics["streams"]["activeStreams"], 0);
    assert_eq!(metrics["relay"]["totalNodes"], 0);
    assert!(metrics["catalog"]["hits"].is_number());
    assert!(metrics["assets"]["maxBytes"].is_number());
    assert!(metrics["analytics"]["batchSize"].is_number());
}

#[tokio::test]
async fn test_catalog_miss_then_not_modified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/radio.json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"stations": [{"id": "jazz"}]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config();
    config.catalog.radio_url = Some(format!("{}/radio.json", server.uri()));
    let app = TestApp::new(config);

    let response = app.get("/cache/radio").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache-status"], "MISS");
    assert!(response.headers()[header::CACHE_CONTROL]
        .to_str()
        .unwrap()
        .starts_with("public, max-age="));
    let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(body_json(response).await["stations"][0]["id"], "jazz");

    let response = app
        .send(
            Request::get("/cache/radio")
                .header(header::IF_NONE_MATCH, &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()["x-cache-status"], "HIT");
    assert_eq!(response.headers()[header::ETAG], etag.as_str());

    let stats = body_json(app.get("/cache/stats").await).await;
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["misses"], 1);
}

#[tokio::test]
async fn test_unknown_catalog_is_not_found() {
    let app = TestApp::new(test_config());
    assert_eq!(app.get("/cache/podcasts").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unreachable_catalog_source_is_bad_gateway() {
    let mut config = test_config();
    config.catalog.tv_url = Some("http://127.0.0.1:1/tv.json".to_string());
    let app = TestApp::new(config);

    assert_eq!(app.get("/cache/tv").await.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_rate_limit_rejects_with_headers() {
    let mut config = test_config();
    config.rate_limit.catalog = RateLimitRule::new(2, 60);
    let app = TestApp::new(config);

    for remaining in ["1", "0"] {
        let response = app.get("/node/info").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
    }

    let response = app.get("/node/info").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert!(response.headers().contains_key("x-ratelimit-reset"));
    assert_eq!(body_json(response).await["status"], 429);

    // Other classes keep their own windows
    assert_eq!(app.get("/analytics/stats").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_routes_require_signature() {
    let app = TestApp::new(test_config());

    let unsigned = app.post_json("/cache/invalidate/all", json!({})).await;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let mut forged = app.signed(Method::POST, "/cache/invalidate/all", "{}");
    forged
        .headers_mut()
        .insert(SIGNATURE_HEADER, "00".repeat(32).parse().unwrap());
    assert_eq!(app.send(forged).await.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(app.signed(Method::POST, "/cache/invalidate/all", "{}"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["target"], "all");
}

#[tokio::test]
async fn test_stale_admin_timestamp_rejected() {
    let app = TestApp::new(test_config());
    let ts = Utc::now().timestamp() - 3_600;
    let signature = app.state.admin.sign(ts, b"").unwrap();

    let response = app
        .send(
            Request::post("/analytics/flush")
                .header(TIMESTAMP_HEADER, ts.to_string())
                .header(SIGNATURE_HEADER, signature)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

fn upload_body(id: &str, data: &[u8]) -> String {
    json!({
        "id": id,
        "name": "Player SDK",
        "type": "sdk",
        "data": base64::engine::general_purpose::STANDARD.encode(data),
        "mimeType": "application/javascript",
        "version": "1.2.0",
    })
    .to_string()
}

#[tokio::test]
async fn test_asset_lifecycle() {
    let app = TestApp::new(test_config());

    let response = app
        .send(app.signed(Method::POST, "/assets", &upload_body("sdk-js", b"hello world")))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let asset = body_json(response).await;
    assert_eq!(asset["sizeBytes"], 11);
    assert_eq!(asset["type"], "sdk");

    let response = app.get("/assets/sdk-js").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/javascript"
    );
    assert_eq!(body_bytes(response).await, b"hello world");

    let response = app
        .send(
            Request::get("/assets/sdk-js")
                .header(header::RANGE, "bytes=0-4")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-4/11");
    assert_eq!(body_bytes(response).await, b"hello");

    let response = app
        .send(
            Request::get("/assets/sdk-js")
                .header(header::RANGE, "bytes=8-2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    let info = body_json(app.get("/assets/sdk-js/info").await).await;
    assert_eq!(info["version"], "1.2.0");

    let listed = body_json(app.get("/assets?type=sdk").await).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let listed = body_json(app.get("/assets?type=game").await).await;
    assert!(listed.as_array().unwrap().is_empty());
    assert_eq!(
        app.get("/assets?type=font").await.status(),
        StatusCode::BAD_REQUEST
    );

    let response = app.post_json("/assets/sdk-js/verify", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["valid"], true);

    let response = app
        .send(app.signed(Method::DELETE, "/assets/sdk-js", ""))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.get("/assets/sdk-js").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        app.post_json("/assets/sdk-js/verify", json!({})).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_oversized_asset_rejected() {
    let mut config = test_config();
    config.assets.max_bytes = 8;
    let app = TestApp::new(config);

    let response = app
        .send(app.signed(Method::POST, "/assets", &upload_body("big", b"0123456789")))
        .await;
    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(app.get("/assets/big/info").await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_stream_is_not_found() {
    let app = TestApp::new(test_config());
    assert_eq!(app.get("/stream/nope").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.get("/tv/stream/nope").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.state.streams.metrics().total_streams, 0);
}

#[tokio::test]
async fn test_stream_relay() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jazz"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/mpeg")
                .set_body_bytes(vec![7u8; 2048]),
        )
        .mount(&server)
        .await;

    let mut config = test_config();
    config
        .streams
        .stations
        .insert("jazz".to_string(), format!("{}/jazz", server.uri()));
    let app = TestApp::new(config);

    let response = app.get("/stream/jazz").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(app.state.streams.active_streams(), 1);

    assert_eq!(body_bytes(response).await.len(), 2048);
    assert_eq!(app.state.streams.active_streams(), 0);
    assert_eq!(app.state.streams.metrics().total_bytes_served, 2048);
}

#[tokio::test]
async fn test_stream_capacity_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.node.max_streams = 1;
    config
        .streams
        .channels
        .insert("news".to_string(), server.uri());
    let app = TestApp::new(config);

    let held = app.get("/tv/stream/news").await;
    assert_eq!(held.status(), StatusCode::OK);

    let rejected = app.get("/tv/stream/news").await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);

    drop(held);
    assert_eq!(app.get("/tv/stream/news").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_upstream_error_is_bad_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config();
    config
        .streams
        .stations
        .insert("broken".to_string(), server.uri());
    let app = TestApp::new(config);

    assert_eq!(app.get("/stream/broken").await.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(app.state.streams.active_streams(), 0);
}

fn relay_node(id: &str, region: &str, capacity: u32) -> RelayNodeConfig {
    RelayNodeConfig {
        id: id.to_string(),
        region: region.to_string(),
        capacity,
        host: format!("{id}.relay.example.com"),
        port: 3478,
        protocols: vec!["udp".to_string()],
    }
}

#[tokio::test]
async fn test_relay_allocate_and_release() {
    let mut config = test_config();
    config.relay.nodes = vec![relay_node("eu-1", "eu", 1), relay_node("us-1", "us", 1)];
    let app = TestApp::new(config);

    let response = app
        .post_json(
            "/relay/allocate",
            json!({"clientId": "c1", "peerId": "p1", "region": "us"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let allocation = body_json(response).await;
    assert_eq!(allocation["node"]["id"], "us-1");
    assert!(allocation["credentials"]["username"]
        .as_str()
        .unwrap()
        .ends_with(":c1"));
    assert_eq!(allocation["iceServers"].as_array().unwrap().len(), 2);

    // us-1 is full, falls back to eu
    let second = body_json(
        app.post_json(
            "/relay/allocate",
            json!({"clientId": "c2", "peerId": "p2", "region": "us"}),
        )
        .await,
    )
    .await;
    assert_eq!(second["node"]["id"], "eu-1");

    let exhausted = app
        .post_json("/relay/allocate", json!({"clientId": "c3", "peerId": "p3"}))
        .await;
    assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = app
        .post_json(
            "/relay/release",
            json!({"connectionId": allocation["connectionId"]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app
        .post_json(
            "/relay/release",
            json!({"connectionId": allocation["connectionId"]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let nodes = body_json(app.get("/relay/nodes?region=us").await).await;
    assert_eq!(nodes[0]["activeConnections"], 0);
}

#[tokio::test]
async fn test_relay_credentials_need_target() {
    let mut config = test_config();
    config.relay.nodes = vec![relay_node("eu-1", "eu", 10)];
    let app = TestApp::new(config);

    let response = app
        .post_json("/relay/credentials", json!({"userId": "u1"}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json("/relay/credentials", json!({"userId": "u1", "nodeId": "eu-1"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body["credentials"]["urls"][0],
        "turn:eu-1.relay.example.com:3478?transport=udp"
    );

    let response = app
        .post_json("/relay/credentials", json!({"userId": "u1", "nodeId": "ap-9"}))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_relay_fleet_admin() {
    let app = TestApp::new(test_config());

    let body = serde_json::to_string(&relay_node("ap-1", "ap", 50)).unwrap();
    let response = app.send(app.signed(Method::POST, "/relay/nodes", &body)).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let report = json!({"latencyMs": 40.0, "packetLoss": 0.01}).to_string();
    let response = app
        .send(app.signed(Method::POST, "/relay/nodes/ap-1/report", &report))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["latencyMs"], 40.0);

    let bad = json!({"latencyMs": 10.0, "packetLoss": 2.0}).to_string();
    let response = app
        .send(app.signed(Method::POST, "/relay/nodes/ap-1/report", &bad))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(app.signed(Method::DELETE, "/relay/nodes/ap-1", ""))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(body_json(app.get("/relay/nodes").await)
        .await
        .as_array()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_analytics_ingest_and_stats() {
    let app = TestApp::new(test_config());

    let response = app
        .post_json(
            "/analytics/ingest",
            json!({"type": "stream_start", "actorId": "User-1", "metadata": {"station": "jazz"}}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["accepted"], 1);
    assert_eq!(body["events"][0]["originNodeId"], "edge-test");
    assert_ne!(body["events"][0]["anonymizedActor"], "User-1");

    let response = app
        .post_json(
            "/analytics/ingest",
            json!({"events": [
                {"type": "search", "actorId": "u2"},
                {"type": "navigation", "actorId": "u3"},
            ]}),
        )
        .await;
    assert_eq!(body_json(response).await["accepted"], 2);

    let response = app
        .post_json(
            "/analytics/ingest",
            json!({"type": "purchase", "actorId": "u4"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let stats = body_json(app.get("/analytics/stats").await).await;
    assert_eq!(stats["eventsReceived"], 3);
    assert_eq!(stats["eventsBuffered"], 3);
    assert_eq!(stats["eventsRejected"], 1);

    let response = app
        .send(app.signed(Method::POST, "/analytics/flush", ""))
        .await;
    assert_eq!(body_json(response).await["flushed"], 3);
}

#[tokio::test]
async fn test_analytics_configure() {
    let app = TestApp::new(test_config());

    let update = json!({"batchSize": 5, "flushIntervalMs": 500}).to_string();
    let response = app
        .send(app.signed(Method::POST, "/analytics/configure", &update))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["batchSize"], 5);
    assert_eq!(stats["flushIntervalMs"], 500);

    let zero = json!({"batchSize": 0}).to_string();
    let response = app
        .send(app.signed(Method::POST, "/analytics/configure", &zero))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
