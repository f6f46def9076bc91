use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Edge node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub node: NodeConfig,
    pub rate_limit: RateLimitConfig,
    pub catalog: CatalogConfig,
    pub assets: AssetsConfig,
    pub streams: StreamsConfig,
    pub relay: RelayConfig,
    pub analytics: AnalyticsConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Upper bound on buffered request bodies (asset uploads, admin payloads)
    pub max_body_bytes: usize,
    /// Key admission control on `X-Forwarded-For` instead of the socket address.
    /// Only enable behind a proxy that sets the header.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            max_body_bytes: 64 * 1024 * 1024,
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Identity and stream capacity of this edge node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Empty means "derive from hostname at startup"
    pub node_id: String,
    pub region: String,
    pub max_streams: usize,
    pub stream_stale_seconds: u64,
    pub stream_sweep_interval_seconds: u64,
    pub upstream_connect_timeout_ms: u64,
    pub upstream_response_timeout_ms: u64,
    pub upstream_idle_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            region: "default".to_string(),
            max_streams: 100,
            stream_stale_seconds: 300,
            stream_sweep_interval_seconds: 60,
            upstream_connect_timeout_ms: 5_000,
            upstream_response_timeout_ms: 10_000,
            upstream_idle_timeout_ms: 30_000,
        }
    }
}

impl NodeConfig {
    #[must_use]
    pub const fn stream_stale_after(&self) -> Duration {
        Duration::from_secs(self.stream_stale_seconds)
    }

    #[must_use]
    pub const fn stream_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stream_sweep_interval_seconds)
    }
}

/// One admission window: at most `max_requests` per `window_seconds` per client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RateLimitRule {
    #[must_use]
    pub const fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Independent limits per route class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Stream relays and relay allocation - moderate, each request is long-lived
    pub streaming: RateLimitRule,
    /// Catalog, asset and node introspection reads - relaxed
    pub catalog: RateLimitRule,
    /// Analytics ingestion - high volume, bounded by batching
    pub analytics: RateLimitRule,
    /// Signed admin operations - strict to slow down signature brute force
    pub admin: RateLimitRule,
    pub sweep_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            streaming: RateLimitRule::new(30, 60),
            catalog: RateLimitRule::new(120, 60),
            analytics: RateLimitRule::new(300, 60),
            admin: RateLimitRule::new(20, 60),
            sweep_interval_seconds: 60,
        }
    }
}

/// Upstream directory sources for cached catalogs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub default_ttl_seconds: u64,
    pub radio_url: Option<String>,
    pub tv_url: Option<String>,
    pub apps_url: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            radio_url: None,
            tv_url: None,
            apps_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub max_bytes: u64,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Upstream URLs for proxied streams
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Radio/audio station id -> upstream URL
    pub stations: HashMap<String, String>,
    /// Live TV channel id -> upstream URL
    pub channels: HashMap<String, String>,
}

/// Static description of a relay node loaded at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayNodeConfig {
    pub id: String,
    pub region: String,
    pub capacity: u32,
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    #[serde(default = "default_relay_protocols")]
    pub protocols: Vec<String>,
}

const fn default_relay_port() -> u16 {
    3478
}

fn default_relay_protocols() -> Vec<String> {
    vec!["udp".to_string(), "tcp".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Shared with every relay (coturn `static-auth-secret`)
    pub shared_secret: String,
    pub credential_ttl_seconds: u64,
    pub stun_urls: Vec<String>,
    pub health_interval_seconds: u64,
    pub probe_timeout_ms: u64,
    /// EWMA smoothing factor for latency and loss samples
    pub ewma_alpha: f64,
    /// Nodes at or above this load are reported unhealthy
    pub unhealthy_load: f64,
    pub nodes: Vec<RelayNodeConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            credential_ttl_seconds: 86400,
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            health_interval_seconds: 15,
            probe_timeout_ms: 2_000,
            ewma_alpha: 0.3,
            unhealthy_load: 0.95,
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Downstream collector; flushed batches are only logged when unset
    pub sink_url: Option<String>,
    /// Flushed batches waiting for the sink
    pub sink_queue: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 10_000,
            sink_url: None,
            sink_queue: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub secret: String,
    pub max_skew_seconds: i64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            max_skew_seconds: 300,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // EDGECAST_NODE__MAX_STREAMS, EDGECAST_RELAY__SHARED_SECRET, ...
        builder = builder.add_source(
            Environment::with_prefix("EDGECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration for values the node cannot run with.
    ///
    /// Every problem is reported, not just the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.node.max_streams == 0 {
            errors.push("node.max_streams must be at least 1".to_string());
        }
        if self.node.stream_sweep_interval_seconds == 0 {
            errors.push("node.stream_sweep_interval_seconds must be non-zero".to_string());
        }

        for (name, rule) in [
            ("streaming", self.rate_limit.streaming),
            ("catalog", self.rate_limit.catalog),
            ("analytics", self.rate_limit.analytics),
            ("admin", self.rate_limit.admin),
        ] {
            if rule.max_requests == 0 || rule.window_seconds == 0 {
                errors.push(format!(
                    "rate_limit.{name} needs non-zero max_requests and window_seconds"
                ));
            }
        }
        if self.rate_limit.sweep_interval_seconds == 0 {
            errors.push("rate_limit.sweep_interval_seconds must be non-zero".to_string());
        }

        if self.catalog.default_ttl_seconds == 0 {
            errors.push("catalog.default_ttl_seconds must be non-zero".to_string());
        }
        if self.assets.max_bytes == 0 {
            errors.push("assets.max_bytes must be non-zero".to_string());
        }

        if self.relay.shared_secret.len() < 32 {
            errors.push("relay.shared_secret should be at least 32 characters".to_string());
        }
        if self.relay.credential_ttl_seconds < 60 {
            errors.push("relay.credential_ttl_seconds should be at least 60 seconds".to_string());
        }
        if !(self.relay.ewma_alpha > 0.0 && self.relay.ewma_alpha <= 1.0) {
            errors.push("relay.ewma_alpha must be in (0, 1]".to_string());
        }
        for node in &self.relay.nodes {
            if node.id.is_empty() || node.capacity == 0 {
                errors.push(format!(
                    "relay node '{}' needs an id and a non-zero capacity",
                    node.id
                ));
            }
        }

        if self.analytics.batch_size == 0 || self.analytics.flush_interval_ms == 0 {
            errors.push("analytics.batch_size and flush_interval_ms must be non-zero".to_string());
        }
        if self.analytics.sink_queue == 0 {
            errors.push("analytics.sink_queue must be non-zero".to_string());
        }

        if self.admin.secret.len() < 32 {
            errors.push("admin.secret should be at least 32 characters".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
