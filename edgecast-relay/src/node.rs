//! Live state of a single relay node
//!
//! Latency and packet loss are smoothed with an exponentially weighted moving
//! average; the first sample seeds the average directly.

use chrono::{DateTime, Utc};
use edgecast_core::config::RelayNodeConfig;
use serde::Serialize;

use crate::types::NodeId;

/// Weight of load in the allocation score
pub const LOAD_WEIGHT: f64 = 0.7;
/// Weight of latency (in seconds) in the allocation score
pub const LATENCY_WEIGHT: f64 = 0.3;

/// `alpha * sample + (1 - alpha) * previous`
#[must_use]
pub fn ewma(previous: f64, sample: f64, alpha: f64) -> f64 {
    alpha.mul_add(sample, (1.0 - alpha) * previous)
}

/// Allocation score, lower is better
#[must_use]
pub fn score(load: f64, latency_ms: f64) -> f64 {
    LOAD_WEIGHT.mul_add(load, LATENCY_WEIGHT * (latency_ms / 1000.0))
}

#[derive(Debug, Clone)]
pub struct RelayNode {
    pub id: NodeId,
    pub region: String,
    pub capacity: u32,
    pub host: String,
    pub port: u16,
    pub protocols: Vec<String>,
    pub active_connections: u32,
    pub latency_ms: f64,
    pub packet_loss_rate: f64,
    pub healthy: bool,
    pub samples: u64,
    pub last_sample_at: Option<DateTime<Utc>>,
}

/// Snapshot returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayNodeInfo {
    pub id: NodeId,
    pub region: String,
    pub capacity: u32,
    pub active_connections: u32,
    pub load: f64,
    pub latency_ms: f64,
    pub packet_loss_rate: f64,
    pub healthy: bool,
    pub protocols: Vec<String>,
    pub host: String,
    pub port: u16,
    pub last_sample_at: Option<DateTime<Utc>>,
}

impl RelayNode {
    #[must_use]
    pub fn from_config(config: &RelayNodeConfig) -> Self {
        Self {
            id: NodeId::new(config.id.clone()),
            region: config.region.clone(),
            capacity: config.capacity,
            host: config.host.clone(),
            port: config.port,
            protocols: config.protocols.clone(),
            active_connections: 0,
            latency_ms: 0.0,
            packet_loss_rate: 0.0,
            healthy: config.capacity > 0,
            samples: 0,
            last_sample_at: None,
        }
    }

    /// Fraction of capacity in use; a zero-capacity node counts as fully loaded
    #[must_use]
    pub fn load(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        f64::from(self.active_connections) / f64::from(self.capacity)
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.active_connections >= self.capacity
    }

    #[must_use]
    pub fn score(&self) -> f64 {
        score(self.load(), self.latency_ms)
    }

    /// Fold a latency/loss sample into the moving averages
    pub fn record_sample(&mut self, latency_ms: f64, packet_loss: f64, alpha: f64) {
        let packet_loss = packet_loss.clamp(0.0, 1.0);
        let latency_ms = latency_ms.max(0.0);
        if self.samples == 0 {
            self.latency_ms = latency_ms;
            self.packet_loss_rate = packet_loss;
        } else {
            self.latency_ms = ewma(self.latency_ms, latency_ms, alpha);
            self.packet_loss_rate = ewma(self.packet_loss_rate, packet_loss, alpha);
        }
        self.samples += 1;
        self.last_sample_at = Some(Utc::now());
    }

    /// `healthy = load < unhealthy_load`
    pub fn recompute_health(&mut self, unhealthy_load: f64) -> bool {
        self.healthy = self.load() < unhealthy_load;
        self.healthy
    }

    /// `turn:` URLs, one per advertised transport
    #[must_use]
    pub fn turn_urls(&self) -> Vec<String> {
        self.protocols
            .iter()
            .map(|proto| format!("turn:{}:{}?transport={proto}", self.host, self.port))
            .collect()
    }

    #[must_use]
    pub fn info(&self) -> RelayNodeInfo {
        RelayNodeInfo {
            id: self.id.clone(),
            region: self.region.clone(),
            capacity: self.capacity,
            active_connections: self.active_connections,
            load: self.load(),
            latency_ms: self.latency_ms,
            packet_loss_rate: self.packet_loss_rate,
            healthy: self.healthy,
            protocols: self.protocols.clone(),
            host: self.host.clone(),
            port: self.port,
            last_sample_at: self.last_sample_at,
        }
    }
}
