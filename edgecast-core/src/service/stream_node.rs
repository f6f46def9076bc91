//! Stream proxy node accounting
//!
//! Tracks the upstream-to-client relays this node is serving, enforces the
//! concurrent stream capacity and prunes registrations that stopped moving
//! bytes without being ended.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::metrics::streams::{ACTIVE_STREAMS, BYTES_RELAYED, STALE_PRUNED};

/// A node is reported healthy below this stream load
const HEALTHY_LOAD: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Radio and other audio stations
    Audio,
    /// Live TV channels
    Tv,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Tv => f.write_str("tv"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    pub internal_id: String,
    pub client_id: String,
    pub kind: StreamKind,
    pub source_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_served: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub region: String,
    pub max_streams: usize,
    pub active_streams: usize,
    pub load: f64,
    pub healthy: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetrics {
    pub active_streams: usize,
    pub max_streams: usize,
    pub total_streams: u64,
    pub rejected_streams: u64,
    pub stale_pruned: u64,
    pub total_bytes_served: u64,
    pub streams: Vec<StreamSession>,
}

pub struct StreamNode {
    node_id: String,
    region: String,
    max_streams: usize,
    stale_after: chrono::Duration,
    sessions: Mutex<HashMap<String, StreamSession>>,
    total_streams: AtomicU64,
    rejected_streams: AtomicU64,
    stale_pruned: AtomicU64,
    total_bytes: AtomicU64,
    started_at: DateTime<Utc>,
    cancel_token: CancellationToken,
}

impl StreamNode {
    #[must_use]
    pub fn new(node_id: impl Into<String>, config: &NodeConfig) -> Self {
        Self {
            node_id: node_id.into(),
            region: config.region.clone(),
            max_streams: config.max_streams,
            stale_after: chrono::Duration::from_std(config.stream_stale_after())
                .unwrap_or(chrono::Duration::MAX),
            sessions: Mutex::new(HashMap::new()),
            total_streams: AtomicU64::new(0),
            rejected_streams: AtomicU64::new(0),
            stale_pruned: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            started_at: Utc::now(),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether one more stream fits right now. Advisory only; use
    /// [`register_stream`](Self::register_stream) to actually claim a slot.
    pub fn can_accept_stream(&self) -> bool {
        self.sessions.lock().len() < self.max_streams
    }

    /// Claim a stream slot. Returns `false` at capacity or if the id is taken.
    ///
    /// Capacity check and insertion happen under one lock.
    pub fn register_stream(
        &self,
        internal_id: &str,
        client_id: &str,
        kind: StreamKind,
        source_id: &str,
    ) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.max_streams || sessions.contains_key(internal_id) {
            let active = sessions.len();
            drop(sessions);
            self.rejected_streams.fetch_add(1, Ordering::Relaxed);
            warn!(
                node_id = %self.node_id,
                stream_id = %internal_id,
                active,
                max_streams = self.max_streams,
                "Stream registration rejected"
            );
            return false;
        }

        let now = Utc::now();
        sessions.insert(
            internal_id.to_string(),
            StreamSession {
                internal_id: internal_id.to_string(),
                client_id: client_id.to_string(),
                kind,
                source_id: source_id.to_string(),
                start_time: now,
                last_activity: now,
                bytes_served: 0,
            },
        );
        let active = sessions.len();
        drop(sessions);

        self.total_streams.fetch_add(1, Ordering::Relaxed);
        ACTIVE_STREAMS.set(i64::try_from(active).unwrap_or(i64::MAX));
        info!(
            node_id = %self.node_id,
            stream_id = %internal_id,
            %kind,
            source_id,
            active,
            "Stream registered"
        );
        true
    }

    /// Register under a fresh id and return a guard that ends the stream on drop
    pub fn register_stream_guarded(
        self: &Arc<Self>,
        client_id: &str,
        kind: StreamKind,
        source_id: &str,
    ) -> Option<StreamGuard> {
        let internal_id = uuid::Uuid::new_v4().to_string();
        self.register_stream(&internal_id, client_id, kind, source_id)
            .then(|| StreamGuard {
                node: Arc::clone(self),
                internal_id,
            })
    }

    /// Account relayed bytes. Returns `false` if the stream is no longer registered.
    pub fn update_stream_bytes(&self, internal_id: &str, bytes: u64) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(internal_id) else {
            return false;
        };
        session.bytes_served = session.bytes_served.saturating_add(bytes);
        session.last_activity = Utc::now();
        drop(sessions);

        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        BYTES_RELAYED.inc_by(bytes);
        true
    }

    /// End a stream, returning its final accounting if it was still registered
    pub fn end_stream(&self, internal_id: &str) -> Option<StreamSession> {
        let mut sessions = self.sessions.lock();
        let session = sessions.remove(internal_id)?;
        let active = sessions.len();
        drop(sessions);

        ACTIVE_STREAMS.set(i64::try_from(active).unwrap_or(i64::MAX));
        info!(
            node_id = %self.node_id,
            stream_id = %internal_id,
            bytes_served = session.bytes_served,
            duration_secs = (Utc::now() - session.start_time).num_seconds(),
            "Stream ended"
        );
        Some(session)
    }

    /// Remove streams with no activity for longer than the stale threshold
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        let stale: Vec<String> = sessions
            .values()
            .filter(|s| now - s.last_activity > self.stale_after)
            .map(|s| s.internal_id.clone())
            .collect();
        for id in &stale {
            sessions.remove(id);
        }
        let active = sessions.len();
        drop(sessions);

        if !stale.is_empty() {
            let pruned = stale.len() as u64;
            self.stale_pruned.fetch_add(pruned, Ordering::Relaxed);
            STALE_PRUNED.inc_by(pruned);
            ACTIVE_STREAMS.set(i64::try_from(active).unwrap_or(i64::MAX));
            warn!(node_id = %self.node_id, pruned, active, "Pruned stale streams");
        }
        stale
    }

    pub fn active_streams(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn load(&self) -> f64 {
        if self.max_streams == 0 {
            return 1.0;
        }
        self.active_streams() as f64 / self.max_streams as f64
    }

    pub fn node_info(&self) -> NodeInfo {
        let active_streams = self.active_streams();
        let load = if self.max_streams == 0 {
            1.0
        } else {
            active_streams as f64 / self.max_streams as f64
        };
        NodeInfo {
            node_id: self.node_id.clone(),
            region: self.region.clone(),
            max_streams: self.max_streams,
            active_streams,
            load,
            healthy: load < HEALTHY_LOAD,
            started_at: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    pub fn metrics(&self) -> StreamMetrics {
        let mut streams: Vec<StreamSession> = self.sessions.lock().values().cloned().collect();
        streams.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        StreamMetrics {
            active_streams: streams.len(),
            max_streams: self.max_streams,
            total_streams: self.total_streams.load(Ordering::Relaxed),
            rejected_streams: self.rejected_streams.load(Ordering::Relaxed),
            stale_pruned: self.stale_pruned.load(Ordering::Relaxed),
            total_bytes_served: self.total_bytes.load(Ordering::Relaxed),
            streams,
        }
    }

    /// Start the staleness sweep. Stops on [`shutdown`](Self::shutdown).
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        let cancel_token = self.cancel_token.clone();

        info!(
            node_id = %self.node_id,
            interval_secs = every.as_secs(),
            "Starting stream staleness sweep"
        );

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            timer.tick().await;
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        debug!("Stream sweep stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        node.sweep_stale_at(Utc::now());
                    }
                }
            }
        })
    }

    /// Stop the sweep and signal every open relay to close
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

/// Owned registration of one relayed stream.
///
/// Dropping the guard ends the stream, whichever way the relay terminated.
pub struct StreamGuard {
    node: Arc<StreamNode>,
    internal_id: String,
}

impl StreamGuard {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.internal_id
    }

    /// Account relayed bytes. `false` means the stream was pruned and the
    /// relay must stop.
    pub fn record_bytes(&self, bytes: u64) -> bool {
        self.node.update_stream_bytes(&self.internal_id, bytes)
    }

    /// Resolves once the node is shutting down
    pub async fn shutdown_requested(&self) {
        self.node.cancel_token.cancelled().await;
    }
}

impl fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamGuard")
            .field("internal_id", &self.internal_id)
            .finish()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.node.end_stream(&self.internal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(max_streams: usize) -> Arc<StreamNode> {
        let config = NodeConfig {
            max_streams,
            stream_stale_seconds: 60,
            ..NodeConfig::default()
        };
        Arc::new(StreamNode::new("edge-test", &config))
    }

    #[test]
    fn test_capacity_one_rejects_second_registration() {
        let node = node(1);
        assert!(node.can_accept_stream());
        assert!(node.register_stream("s1", "c1", StreamKind::Audio, "jazz"));
        assert!(!node.can_accept_stream());
        assert!(!node.register_stream("s2", "c2", StreamKind::Audio, "jazz"));

        node.end_stream("s1");
        assert!(node.register_stream("s2", "c2", StreamKind::Audio, "jazz"));
        assert_eq!(node.metrics().rejected_streams, 1);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let node = node(5);
        assert!(node.register_stream("s1", "c1", StreamKind::Tv, "news"));
        assert!(!node.register_stream("s1", "c2", StreamKind::Tv, "news"));
        assert_eq!(node.active_streams(), 1);
    }

    #[test]
    fn test_concurrent_registration_never_exceeds_capacity() {
        let node = node(4);
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let node = Arc::clone(&node);
                std::thread::spawn(move || {
                    node.register_stream(&format!("s{i}"), "c", StreamKind::Audio, "src")
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 4);
        assert_eq!(node.active_streams(), 4);
    }

    #[test]
    fn test_bytes_accounting() {
        let node = node(2);
        node.register_stream("s1", "c1", StreamKind::Audio, "jazz");
        assert!(node.update_stream_bytes("s1", 100));
        assert!(node.update_stream_bytes("s1", 50));
        assert!(!node.update_stream_bytes("missing", 10));

        let ended = node.end_stream("s1").unwrap();
        assert_eq!(ended.bytes_served, 150);
        assert_eq!(node.metrics().total_bytes_served, 150);
        assert!(node.end_stream("s1").is_none());
    }

    #[test]
    fn test_sweep_prunes_only_idle_streams() {
        let node = node(5);
        node.register_stream("idle", "c1", StreamKind::Audio, "a");
        node.register_stream("busy", "c2", StreamKind::Audio, "b");

        let later = Utc::now() + chrono::Duration::seconds(61);
        {
            let mut sessions = node.sessions.lock();
            if let Some(busy) = sessions.get_mut("busy") {
                busy.last_activity = later;
            }
        }

        let pruned = node.sweep_stale_at(later);
        assert_eq!(pruned, vec!["idle".to_string()]);
        assert_eq!(node.active_streams(), 1);
        assert_eq!(node.metrics().stale_pruned, 1);
    }

    #[test]
    fn test_guard_ends_stream_on_drop() {
        let node = node(1);
        let guard = node
            .register_stream_guarded("c1", StreamKind::Tv, "news")
            .unwrap();
        assert!(guard.record_bytes(42));
        assert!(node
            .register_stream_guarded("c2", StreamKind::Tv, "news")
            .is_none());

        drop(guard);
        assert_eq!(node.active_streams(), 0);
        assert!(node.register_stream_guarded("c2", StreamKind::Tv, "news").is_some());
    }

    #[test]
    fn test_node_info_load_and_health() {
        let node = node(2);
        node.register_stream("s1", "c1", StreamKind::Audio, "a");
        let info = node.node_info();
        assert_eq!(info.node_id, "edge-test");
        assert!((info.load - 0.5).abs() < f64::EPSILON);
        assert!(info.healthy);

        node.register_stream("s2", "c2", StreamKind::Audio, "a");
        assert!(!node.node_info().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_shutdown() {
        let node = node(1);
        let handle = node.start_sweeper(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        node.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_sees_shutdown() {
        let node = node(1);
        let guard = node
            .register_stream_guarded("c1", StreamKind::Audio, "jazz")
            .unwrap();
        node.shutdown();
        tokio::time::timeout(Duration::from_secs(1), guard.shutdown_requested())
            .await
            .unwrap();
    }
}
