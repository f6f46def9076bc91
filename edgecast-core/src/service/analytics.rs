//! Analytics ingestion with actor anonymization and batched flushing
//!
//! Actor ids are hashed at the ingest boundary; the raw value never reaches the
//! buffer. The buffer flushes when it reaches `batch_size` or when the flush
//! timer fires, and every flush restarts the timer. Flushed batches are handed
//! to a sink consumer over a bounded channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AnalyticsConfig;
use crate::metrics::analytics::{EVENTS_FLUSHED, EVENTS_INGESTED};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StreamStart,
    StreamEnd,
    AppLaunch,
    Search,
    Navigation,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StreamStart => "stream_start",
            Self::StreamEnd => "stream_end",
            Self::AppLaunch => "app_launch",
            Self::Search => "search",
            Self::Navigation => "navigation",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stream_start" => Ok(Self::StreamStart),
            "stream_end" => Ok(Self::StreamEnd),
            "app_launch" => Ok(Self::AppLaunch),
            "search" => Ok(Self::Search),
            "navigation" => Ok(Self::Navigation),
            other => Err(Error::Validation(format!("unknown event type '{other}'"))),
        }
    }
}

/// Event as submitted by a client. The type stays a string until validated.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub actor_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Event after validation and anonymization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub anonymized_actor: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub origin_node_id: String,
    pub region: String,
}

/// One-way hash of an actor id; case-insensitive
#[must_use]
pub fn anonymize_actor(actor_id: &str) -> String {
    hex::encode(Sha256::digest(actor_id.to_lowercase().as_bytes()))
}

/// Live-tunable flush settings
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngesterUpdate {
    pub flush_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsStats {
    pub events_received: u64,
    pub events_buffered: usize,
    pub total_events_written: u64,
    pub flush_count: u64,
    pub events_rejected: u64,
    pub events_dropped: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

/// Destination for flushed batches
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn write(&self, batch: &[AnalyticsEvent]) -> anyhow::Result<()>;
}

/// Sink that only logs batch summaries
pub struct LogSink;

#[async_trait]
impl AnalyticsSink for LogSink {
    async fn write(&self, batch: &[AnalyticsEvent]) -> anyhow::Result<()> {
        info!(events = batch.len(), "Analytics batch flushed");
        Ok(())
    }
}

/// Bounded queue between the ingester and its sink consumer
#[must_use]
pub fn sink_channel(
    capacity: usize,
) -> (
    mpsc::Sender<Vec<AnalyticsEvent>>,
    mpsc::Receiver<Vec<AnalyticsEvent>>,
) {
    mpsc::channel(capacity.max(1))
}

/// Drive `sink` with flushed batches until `cancel_token` fires.
///
/// Batches already queued at cancellation are still written.
pub fn spawn_sink_consumer(
    mut rx: mpsc::Receiver<Vec<AnalyticsEvent>>,
    sink: Arc<dyn AnalyticsSink>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                batch = rx.recv() => {
                    let Some(batch) = batch else { return };
                    write_batch(sink.as_ref(), &batch).await;
                }
                () = cancel_token.cancelled() => {
                    while let Ok(batch) = rx.try_recv() {
                        write_batch(sink.as_ref(), &batch).await;
                    }
                    debug!("Analytics sink consumer stopped");
                    return;
                }
            }
        }
    })
}

async fn write_batch(sink: &dyn AnalyticsSink, batch: &[AnalyticsEvent]) {
    if let Err(e) = sink.write(batch).await {
        error!(error = %e, events = batch.len(), "Analytics sink write failed");
    }
}

pub struct AnalyticsIngester {
    origin_node_id: String,
    region: String,
    buffer: Mutex<Vec<AnalyticsEvent>>,
    batch_size: AtomicUsize,
    interval_tx: watch::Sender<Duration>,
    flushed: Notify,
    sink_tx: mpsc::Sender<Vec<AnalyticsEvent>>,
    events_received: AtomicU64,
    total_events_written: AtomicU64,
    flush_count: AtomicU64,
    events_rejected: AtomicU64,
    events_dropped: AtomicU64,
    last_flush_at: Mutex<Option<DateTime<Utc>>>,
    cancel_token: CancellationToken,
}

impl AnalyticsIngester {
    #[must_use]
    pub fn new(
        origin_node_id: impl Into<String>,
        region: impl Into<String>,
        config: &AnalyticsConfig,
        sink_tx: mpsc::Sender<Vec<AnalyticsEvent>>,
    ) -> Self {
        let (interval_tx, _) = watch::channel(Duration::from_millis(config.flush_interval_ms));
        Self {
            origin_node_id: origin_node_id.into(),
            region: region.into(),
            buffer: Mutex::new(Vec::with_capacity(config.batch_size)),
            batch_size: AtomicUsize::new(config.batch_size),
            interval_tx,
            flushed: Notify::new(),
            sink_tx,
            events_received: AtomicU64::new(0),
            total_events_written: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            last_flush_at: Mutex::new(None),
            cancel_token: CancellationToken::new(),
        }
    }

    fn prepare(&self, event: IngestEvent) -> Result<AnalyticsEvent> {
        let event_type = event.event_type.parse::<EventType>()?;
        if event.actor_id.trim().is_empty() {
            return Err(Error::Validation("actorId must not be empty".to_string()));
        }

        Ok(AnalyticsEvent {
            id: event
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            event_type,
            anonymized_actor: anonymize_actor(&event.actor_id),
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
            metadata: event.metadata,
            origin_node_id: self.origin_node_id.clone(),
            region: self.region.clone(),
        })
    }

    /// Validate, anonymize and buffer one event
    pub fn ingest(&self, event: IngestEvent) -> Result<AnalyticsEvent> {
        self.ingest_batch(vec![event])
            .map(|mut events| events.remove(0))
    }

    /// Buffer a batch. One invalid event rejects the whole batch.
    pub fn ingest_batch(&self, events: Vec<IngestEvent>) -> Result<Vec<AnalyticsEvent>> {
        let count = events.len() as u64;
        let prepared = match events
            .into_iter()
            .map(|event| self.prepare(event))
            .collect::<Result<Vec<_>>>()
        {
            Ok(prepared) => prepared,
            Err(e) => {
                self.events_rejected.fetch_add(count, Ordering::Relaxed);
                debug!(error = %e, events = count, "Analytics ingest rejected");
                return Err(e);
            }
        };

        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.extend(prepared.iter().cloned());
            buffer.len() >= self.batch_size.load(Ordering::Relaxed)
        };

        self.events_received.fetch_add(count, Ordering::Relaxed);
        EVENTS_INGESTED.inc_by(count);

        if should_flush {
            self.flush();
        }
        Ok(prepared)
    }

    /// Empty the buffer into the sink queue and restart the flush timer
    pub fn flush(&self) -> Vec<AnalyticsEvent> {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return batch;
        }

        let count = batch.len() as u64;
        self.total_events_written.fetch_add(count, Ordering::Relaxed);
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        *self.last_flush_at.lock() = Some(Utc::now());
        EVENTS_FLUSHED.inc_by(count);
        self.flushed.notify_one();

        match self.sink_tx.try_send(batch.clone()) {
            Ok(()) => debug!(events = count, "Analytics batch queued for sink"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.events_dropped.fetch_add(count, Ordering::Relaxed);
                warn!(events = count, "Analytics sink queue full, batch dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.events_dropped.fetch_add(count, Ordering::Relaxed);
                warn!(events = count, "Analytics sink closed, batch dropped");
            }
        }
        batch
    }

    /// Change batch size and/or flush cadence without touching buffered events
    pub fn configure(&self, update: IngesterUpdate) -> Result<AnalyticsStats> {
        if update.batch_size == Some(0) || update.flush_interval_ms == Some(0) {
            return Err(Error::Validation(
                "batchSize and flushIntervalMs must be non-zero".to_string(),
            ));
        }

        if let Some(batch_size) = update.batch_size {
            self.batch_size.store(batch_size, Ordering::Relaxed);
        }
        if let Some(ms) = update.flush_interval_ms {
            self.interval_tx.send_replace(Duration::from_millis(ms));
        }
        info!(
            batch_size = self.batch_size.load(Ordering::Relaxed),
            flush_interval_ms = self.flush_interval().as_millis() as u64,
            "Analytics ingester reconfigured"
        );

        if self.buffer.lock().len() >= self.batch_size.load(Ordering::Relaxed) {
            self.flush();
        }
        Ok(self.stats())
    }

    fn flush_interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    pub fn stats(&self) -> AnalyticsStats {
        AnalyticsStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_buffered: self.buffer.lock().len(),
            total_events_written: self.total_events_written.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            last_flush_at: *self.last_flush_at.lock(),
            batch_size: self.batch_size.load(Ordering::Relaxed),
            flush_interval_ms: u64::try_from(self.flush_interval().as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Start the flush timer. Stops on [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let ingester = Arc::clone(self);
        let cancel_token = self.cancel_token.clone();
        let mut interval_rx = self.interval_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let period = *interval_rx.borrow_and_update();
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        debug!("Analytics flush timer stopped");
                        return;
                    }
                    () = tokio::time::sleep(period) => {
                        ingester.flush();
                    }
                    // A flush from elsewhere restarts the period
                    () = ingester.flushed.notified() => {}
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            return;
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
