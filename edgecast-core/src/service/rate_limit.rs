//! Fixed-window admission control
//!
//! A window opens on the first request from a client key and lasts `window`.
//! Every request inside the window is counted, including rejected ones, so a
//! burst cannot reset its own window and `remaining` stays accurate.
//! A background sweep drops windows that have ended, independent of traffic.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{RateLimitConfig, RateLimitRule};

/// Per-client window state
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds until the window resets, at least 1 when denied
    #[must_use]
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> u64 {
        let secs = (self.reset_at - now).num_seconds().max(0).unsigned_abs();
        if self.allowed {
            secs
        } else {
            secs.max(1)
        }
    }
}

/// Fixed-window rate limiter for one route class
pub struct RateLimiter {
    windows: DashMap<String, RateLimitEntry>,
    max_requests: u32,
    window: chrono::Duration,
    cancel_token: CancellationToken,
}

impl RateLimiter {
    #[must_use]
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests: rule.max_requests,
            window: chrono::Duration::seconds(
                i64::try_from(rule.window_seconds).unwrap_or(i64::MAX / 1000),
            ),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Count a request from `key` and decide whether it is admitted
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Utc::now())
    }

    /// [`check`](Self::check) against an explicit clock reading
    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> RateLimitDecision {
        // The entry guard holds the shard lock, so read-modify-write is atomic per key
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                window_start: now,
            });

        if now - entry.window_start >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);

        RateLimitDecision {
            allowed: entry.count <= self.max_requests,
            remaining: self.max_requests.saturating_sub(entry.count),
            reset_at: entry.window_start + self.window,
        }
    }

    /// Remove windows that ended before `now`. Returns how many were dropped.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, entry| now - entry.window_start < self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked client windows
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    #[must_use]
    pub const fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Start the periodic sweep. Stops on [`shutdown`](Self::shutdown).
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            timer.tick().await;
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => return,
                    _ = timer.tick() => {
                        let removed = limiter.sweep_at(Utc::now());
                        if removed > 0 {
                            debug!(removed, remaining = limiter.tracked_keys(), "Swept expired rate limit windows");
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

/// Route classes with independently configured limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitCategory {
    Streaming,
    Catalog,
    Analytics,
    Admin,
}

impl RateLimitCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Catalog => "catalog",
            Self::Analytics => "analytics",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One limiter per route class
pub struct RateLimiters {
    streaming: Arc<RateLimiter>,
    catalog: Arc<RateLimiter>,
    analytics: Arc<RateLimiter>,
    admin: Arc<RateLimiter>,
}

impl RateLimiters {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            streaming: Arc::new(RateLimiter::new(config.streaming)),
            catalog: Arc::new(RateLimiter::new(config.catalog)),
            analytics: Arc::new(RateLimiter::new(config.analytics)),
            admin: Arc::new(RateLimiter::new(config.admin)),
        }
    }

    #[must_use]
    pub fn get(&self, category: RateLimitCategory) -> &Arc<RateLimiter> {
        match category {
            RateLimitCategory::Streaming => &self.streaming,
            RateLimitCategory::Catalog => &self.catalog,
            RateLimitCategory::Analytics => &self.analytics,
            RateLimitCategory::Admin => &self.admin,
        }
    }

    pub fn check(&self, category: RateLimitCategory, key: &str) -> RateLimitDecision {
        let decision = self.get(category).check(key);
        if !decision.allowed {
            crate::metrics::admission::REJECTED
                .with_label_values(&[category.as_str()])
                .inc();
        }
        decision
    }

    fn all(&self) -> [&Arc<RateLimiter>; 4] {
        [&self.streaming, &self.catalog, &self.analytics, &self.admin]
    }

    /// Start one sweeper per class
    pub fn start_sweepers(&self, every: Duration) -> Vec<tokio::task::JoinHandle<()>> {
        info!(interval_secs = every.as_secs(), "Starting rate limit sweepers");
        self.all()
            .into_iter()
            .map(|limiter| limiter.start_sweeper(every))
            .collect()
    }

    pub fn shutdown(&self) {
        for limiter in self.all() {
            limiter.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_seconds: u64) -> RateLimiter {
        RateLimiter::new(RateLimitRule::new(max_requests, window_seconds))
    }

    #[test]
    fn test_allows_up_to_max_then_denies() {
        let limiter = limiter(3, 60);
        let now = Utc::now();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_at("10.0.0.1", now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.check_at("10.0.0.1", now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_rejected_requests_do_not_reset_window() {
        let limiter = limiter(1, 60);
        let start = Utc::now();

        assert!(limiter.check_at("k", start).allowed);
        for i in 1..10 {
            let decision = limiter.check_at("k", start + chrono::Duration::seconds(i));
            assert!(!decision.allowed);
            assert_eq!(decision.reset_at, start + chrono::Duration::seconds(60));
        }
    }

    #[test]
    fn test_window_reopens_after_expiry() {
        let limiter = limiter(1, 10);
        let start = Utc::now();

        assert!(limiter.check_at("k", start).allowed);
        assert!(!limiter.check_at("k", start + chrono::Duration::seconds(9)).allowed);

        let reopened = limiter.check_at("k", start + chrono::Duration::seconds(10));
        assert!(reopened.allowed);
        assert_eq!(
            reopened.reset_at,
            start + chrono::Duration::seconds(20)
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        let now = Utc::now();

        assert!(limiter.check_at("a", now).allowed);
        assert!(limiter.check_at("b", now).allowed);
        assert!(!limiter.check_at("a", now).allowed);
    }

    #[test]
    fn test_sweep_removes_only_expired_windows() {
        let limiter = limiter(5, 10);
        let start = Utc::now();

        limiter.check_at("old", start);
        limiter.check_at("new", start + chrono::Duration::seconds(8));

        let removed = limiter.sweep_at(start + chrono::Duration::seconds(12));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_retry_after_seconds() {
        let now = Utc::now();
        let denied = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: now,
        };
        assert_eq!(denied.retry_after_seconds(now), 1);

        let later = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: now + chrono::Duration::seconds(42),
        };
        assert_eq!(later.retry_after_seconds(now), 42);
    }

    #[test]
    fn test_categories_use_their_own_rules() {
        let config = RateLimitConfig {
            admin: RateLimitRule::new(1, 60),
            catalog: RateLimitRule::new(5, 60),
            ..RateLimitConfig::default()
        };
        let limiters = RateLimiters::new(&config);

        assert!(limiters.check(RateLimitCategory::Admin, "ip").allowed);
        assert!(!limiters.check(RateLimitCategory::Admin, "ip").allowed);
        assert!(limiters.check(RateLimitCategory::Catalog, "ip").allowed);
        assert_eq!(limiters.get(RateLimitCategory::Catalog).max_requests(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_until_shutdown() {
        let limiter = Arc::new(limiter(5, 1));
        limiter.check_at("k", Utc::now() - chrono::Duration::seconds(5));

        let handle = limiter.start_sweeper(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(limiter.tracked_keys(), 0);

        limiter.shutdown();
        handle.await.unwrap();
    }
}
