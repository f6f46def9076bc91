//! Catalog source backed by upstream HTTP directories

use async_trait::async_trait;
use edgecast_core::cache::{CatalogSource, CatalogType};
use edgecast_core::config::CatalogConfig;
use edgecast_core::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Fetches each catalog as JSON from its configured URL
#[derive(Debug, Clone)]
pub struct HttpCatalogSource {
    client: reqwest::Client,
    urls: HashMap<CatalogType, String>,
    timeout: Duration,
}

impl HttpCatalogSource {
    #[must_use]
    pub fn new(client: reqwest::Client, config: &CatalogConfig, timeout: Duration) -> Self {
        let urls = [
            (CatalogType::Radio, &config.radio_url),
            (CatalogType::Tv, &config.tv_url),
            (CatalogType::Apps, &config.apps_url),
        ]
        .into_iter()
        .filter_map(|(kind, url)| url.clone().map(|url| (kind, url)))
        .collect();

        Self {
            client,
            urls,
            timeout,
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn build(&self, kind: CatalogType) -> Result<serde_json::Value> {
        let url = self
            .urls
            .get(&kind)
            .ok_or_else(|| Error::NotFound(format!("catalog '{kind}' has no configured source")))?;

        debug!(catalog = %kind, %url, "Rebuilding catalog from upstream");

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(catalog = %kind, error = %e, "Catalog source request failed");
                Error::UpstreamUnavailable(format!("catalog source for '{kind}' failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(catalog = %kind, %status, "Catalog source returned error status");
            return Err(Error::UpstreamUnavailable(format!(
                "catalog source for '{kind}' returned {status}"
            )));
        }

        response.json::<serde_json::Value>().await.map_err(|e| {
            Error::UpstreamUnavailable(format!("catalog source for '{kind}' sent invalid JSON: {e}"))
        })
    }
}
