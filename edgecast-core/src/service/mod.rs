pub mod admin_auth;
pub mod analytics;
pub mod rate_limit;
pub mod stream_node;

pub use admin_auth::AdminVerifier;
pub use analytics::{
    AnalyticsEvent, AnalyticsIngester, AnalyticsSink, AnalyticsStats, EventType, IngestEvent,
    IngesterUpdate, LogSink,
};
pub use rate_limit::{RateLimitCategory, RateLimitDecision, RateLimiter, RateLimiters};
pub use stream_node::{NodeInfo, StreamGuard, StreamKind, StreamMetrics, StreamNode, StreamSession};
