//! Analytics sink that posts flushed batches to a collector

use async_trait::async_trait;
use edgecast_core::service::analytics::{AnalyticsEvent, AnalyticsSink};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpAnalyticsSink {
    client: reqwest::Client,
    url: url::Url,
    timeout: Duration,
}

impl HttpAnalyticsSink {
    pub fn new(client: reqwest::Client, url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| anyhow::anyhow!("Invalid analytics sink url '{url}': {e}"))?;
        Ok(Self {
            client,
            url,
            timeout,
        })
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalyticsSink {
    async fn write(&self, batch: &[AnalyticsEvent]) -> anyhow::Result<()> {
        self.client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&serde_json::json!({ "events": batch }))
            .send()
            .await?
            .error_for_status()?;

        debug!(events = batch.len(), url = %self.url, "Analytics batch delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use edgecast_core::service::analytics::EventType;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> AnalyticsEvent {
        AnalyticsEvent {
            id: "evt-1".to_string(),
            event_type: EventType::Search,
            anonymized_actor: "ab".repeat(32),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
            origin_node_id: "edge-1".to_string(),
            region: "eu".to_string(),
        }
    }

    #[tokio::test]
    async fn test_posts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(body_partial_json(
                serde_json::json!({"events": [{"id": "evt-1", "type": "search"}]}),
            ))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpAnalyticsSink::new(
            reqwest::Client::new(),
            &format!("{}/ingest", server.uri()),
            Duration::from_secs(2),
        )
        .unwrap();
        sink.write(&[event()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_collector_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink =
            HttpAnalyticsSink::new(reqwest::Client::new(), &server.uri(), Duration::from_secs(2))
                .unwrap();
        assert!(sink.write(&[event()]).await.is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(HttpAnalyticsSink::new(reqwest::Client::new(), "not a url", Duration::from_secs(1))
            .is_err());
    }
}
