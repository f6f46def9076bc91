//! Byte-for-byte relay of upstream media streams
//!
//! The returned body stream owns the [`StreamGuard`] for its registration, so
//! the stream is deregistered however the relay ends: upstream EOF, upstream
//! error, idle timeout, or the client going away and the body being dropped.
//! A relay whose registration was pruned as stale, or whose node is shutting
//! down, ends with an error so the upstream connection is released.

use bytes::Bytes;
use edgecast_core::config::NodeConfig;
use edgecast_core::service::StreamGuard;
use edgecast_core::{Error, Result};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

/// Response headers that describe the hop, not the payload
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-encoding",
    "content-length",
];

/// Client headers worth passing upstream
const FORWARDED_CLIENT_HEADERS: &[&str] = &["user-agent", "icy-metadata", "accept"];

pub type RelayBody = BoxStream<'static, std::result::Result<Bytes, io::Error>>;

/// An upstream stream ready to be written to the client
pub struct RelayedStream {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RelayBody,
}

impl std::fmt::Debug for RelayedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    response_timeout: Duration,
    idle_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &NodeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.upstream_connect_timeout_ms))
            .user_agent(concat!("edgecast/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;

        Ok(Self {
            client,
            response_timeout: Duration::from_millis(config.upstream_response_timeout_ms),
            idle_timeout: Duration::from_millis(config.upstream_idle_timeout_ms),
        })
    }

    #[must_use]
    pub const fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Open `url` and relay it under `guard`.
    ///
    /// On any failure the guard is dropped before the error is returned.
    pub async fn open(
        &self,
        url: &str,
        client_headers: &HeaderMap,
        guard: StreamGuard,
    ) -> Result<RelayedStream> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::Internal(format!("invalid upstream url '{url}': {e}")))?;

        let mut request = self.client.get(parsed);
        for (name, value) in client_headers {
            if FORWARDED_CLIENT_HEADERS.contains(&name.as_str()) {
                request = request.header(name, value);
            }
        }

        let response = match tokio::time::timeout(self.response_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(stream_id = guard.id(), error = %e, "Upstream request failed");
                return Err(Error::UpstreamUnavailable(format!("upstream request failed: {e}")));
            }
            Err(_) => {
                warn!(
                    stream_id = guard.id(),
                    timeout_ms = self.response_timeout.as_millis() as u64,
                    "Upstream response timed out"
                );
                return Err(Error::UpstreamUnavailable(
                    "upstream response timed out".to_string(),
                ));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(stream_id = guard.id(), %status, "Upstream returned error status");
            return Err(Error::UpstreamUnavailable(format!(
                "upstream returned {status}"
            )));
        }

        let mut headers = response.headers().clone();
        for name in HOP_HEADERS {
            headers.remove(*name);
        }

        debug!(stream_id = guard.id(), %status, "Upstream stream opened");

        Ok(RelayedStream {
            status,
            headers,
            body: relay_body(response.bytes_stream().boxed(), guard, self.idle_timeout),
        })
    }
}

struct RelayState {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    guard: StreamGuard,
    idle_timeout: Duration,
    finished: bool,
}

fn relay_body(
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    guard: StreamGuard,
    idle_timeout: Duration,
) -> RelayBody {
    let state = RelayState {
        upstream,
        guard,
        idle_timeout,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        let next = tokio::select! {
            biased;
            () = state.guard.shutdown_requested() => None,
            next = tokio::time::timeout(state.idle_timeout, state.upstream.next()) => Some(next),
        };
        let Some(next) = next else {
            debug!(stream_id = state.guard.id(), "Node shutting down, closing relay");
            state.finished = true;
            return Some((
                Err(io::Error::new(io::ErrorKind::Interrupted, "node shutting down")),
                state,
            ));
        };

        match next {
            Ok(Some(Ok(chunk))) => {
                if !state.guard.record_bytes(chunk.len() as u64) {
                    warn!(stream_id = state.guard.id(), "Stream pruned as stale, closing relay");
                    state.finished = true;
                    return Some((
                        Err(io::Error::new(io::ErrorKind::TimedOut, "stream pruned as stale")),
                        state,
                    ));
                }
                Some((Ok(chunk), state))
            }
            Ok(Some(Err(e))) => {
                warn!(stream_id = state.guard.id(), error = %e, "Upstream stream broke");
                state.finished = true;
                Some((Err(io::Error::other(e)), state))
            }
            Ok(None) => {
                debug!(stream_id = state.guard.id(), "Upstream stream finished");
                None
            }
            Err(_) => {
                warn!(stream_id = state.guard.id(), "Upstream stream idle, closing relay");
                state.finished = true;
                Some((
                    Err(io::Error::new(io::ErrorKind::TimedOut, "upstream idle timeout")),
                    state,
                ))
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgecast_core::service::{StreamKind, StreamNode};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup(response_timeout_ms: u64) -> (Arc<StreamNode>, UpstreamClient) {
        let config = NodeConfig {
            max_streams: 1,
            upstream_connect_timeout_ms: 500,
            upstream_response_timeout_ms: response_timeout_ms,
            upstream_idle_timeout_ms: 1_000,
            ..NodeConfig::default()
        };
        (
            Arc::new(StreamNode::new("edge-test", &config)),
            UpstreamClient::new(&config).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_relays_bytes_and_releases_slot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jazz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mpeg")
                    .set_body_bytes(vec![1u8; 4096]),
            )
            .mount(&server)
            .await;

        let (node, client) = setup(2_000);
        let guard = node
            .register_stream_guarded("client-1", StreamKind::Audio, "jazz")
            .unwrap();

        let relayed = client
            .open(&format!("{}/jazz", server.uri()), &HeaderMap::new(), guard)
            .await
            .unwrap();
        assert_eq!(relayed.headers["content-type"], "audio/mpeg");
        assert!(!node.can_accept_stream());

        let chunks: Vec<_> = relayed.body.collect().await;
        let total: usize = chunks.iter().map(|c| c.as_ref().unwrap().len()).sum();
        assert_eq!(total, 4096);

        assert_eq!(node.active_streams(), 0);
        assert_eq!(node.metrics().total_bytes_served, 4096);
    }

    #[tokio::test]
    async fn test_error_status_deregisters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (node, client) = setup(2_000);
        let guard = node
            .register_stream_guarded("client-1", StreamKind::Tv, "news")
            .unwrap();

        let err = client
            .open(&server.uri(), &HeaderMap::new(), guard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
        assert_eq!(node.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_response_timeout_deregisters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let (node, client) = setup(100);
        let guard = node
            .register_stream_guarded("client-1", StreamKind::Audio, "slow")
            .unwrap();

        let err = client
            .open(&server.uri(), &HeaderMap::new(), guard)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable(_)));
        assert!(node.can_accept_stream());
    }

    #[tokio::test]
    async fn test_dropped_body_releases_slot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 128]))
            .mount(&server)
            .await;

        let (node, client) = setup(2_000);
        let guard = node
            .register_stream_guarded("client-1", StreamKind::Audio, "jazz")
            .unwrap();
        let relayed = client
            .open(&server.uri(), &HeaderMap::new(), guard)
            .await
            .unwrap();

        // Client hung up before reading anything
        drop(relayed);
        assert_eq!(node.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_stale_pruned_stream_stops_relaying() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
            .mount(&server)
            .await;

        let (node, client) = setup(2_000);
        let guard = node
            .register_stream_guarded("client-1", StreamKind::Audio, "jazz")
            .unwrap();
        let relayed = client
            .open(&server.uri(), &HeaderMap::new(), guard)
            .await
            .unwrap();

        let pruned = node.sweep_stale_at(chrono::Utc::now() + chrono::Duration::hours(1));
        assert_eq!(pruned.len(), 1);
        // The freed slot is taken by someone else
        let _second = node
            .register_stream_guarded("client-2", StreamKind::Audio, "jazz")
            .unwrap();

        let chunks: Vec<_> = relayed.body.collect().await;
        assert_eq!(chunks.len(), 1);
        let err = chunks[0].as_ref().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(node.metrics().total_bytes_served, 0);
        assert_eq!(node.active_streams(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_relay() {
        let (node, _) = setup(2_000);
        let guard = node
            .register_stream_guarded("client-1", StreamKind::Tv, "news")
            .unwrap();
        // Upstream that never sends and never ends
        let body = relay_body(
            stream::pending().boxed(),
            guard,
            Duration::from_secs(3600),
        );

        node.shutdown();
        let chunks: Vec<_> = tokio::time::timeout(Duration::from_secs(1), body.collect())
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].as_ref().unwrap_err().kind(),
            io::ErrorKind::Interrupted
        );
        assert_eq!(node.active_streams(), 0);
    }
}
