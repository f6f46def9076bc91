//! Media relay registry
//!
//! This module provides:
//! - Region-grouped relay node table with live load and latency
//! - Best-node selection and atomic connection allocation
//! - TURN credential minting for allocated sessions
//! - Periodic health probing and recomputation
//! - Fleet-wide snapshot metrics

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use edgecast_core::config::{RelayConfig, RelayNodeConfig};
use edgecast_core::metrics::relay::ALLOCATIONS;
use edgecast_core::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::{TurnCredentialService, TurnCredentials};
use crate::node::{RelayNode, RelayNodeInfo};
use crate::probe::NodeProbe;
use crate::types::{ConnectionId, NodeId};

/// One allocated relay session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConnection {
    pub id: ConnectionId,
    pub node_id: NodeId,
    pub client_id: String,
    pub peer_id: String,
    pub allocated_at: DateTime<Utc>,
}

/// WebRTC `RTCIceServer` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub connection_id: ConnectionId,
    pub node: RelayNodeInfo,
    pub credentials: TurnCredentials,
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionMetrics {
    pub nodes: usize,
    pub healthy_nodes: usize,
    pub capacity: u64,
    pub active_connections: u64,
    pub average_latency_ms: f64,
}

/// Snapshot of the fleet, computed from live node state
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayAggregateMetrics {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub total_capacity: u64,
    pub active_connections: u64,
    pub tracked_connections: usize,
    pub average_load: f64,
    pub average_latency_ms: f64,
    pub average_packet_loss: f64,
    pub regions: BTreeMap<String, RegionMetrics>,
}

/// Where credentials should point
#[derive(Debug, Clone)]
pub enum CredentialTarget {
    Node(NodeId),
    Region(String),
}

fn lowest_score<'a>(candidates: impl Iterator<Item = &'a RelayNode>) -> Option<&'a RelayNode> {
    candidates.min_by(|a, b| {
        a.score()
            .total_cmp(&b.score())
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Healthy, non-full node with the lowest score; preferred region first,
/// then any region. Ties go to the lowest id.
fn select_best<'a>(
    nodes: impl Iterator<Item = &'a RelayNode> + Clone,
    preferred_region: Option<&str>,
) -> Option<&'a RelayNode> {
    let eligible = nodes.filter(|n| n.healthy && !n.is_full());

    if let Some(region) = preferred_region {
        if let Some(node) = lowest_score(eligible.clone().filter(|n| n.region == region)) {
            return Some(node);
        }
    }
    lowest_score(eligible)
}

pub struct RelayRegistry {
    nodes: RwLock<HashMap<NodeId, RelayNode>>,
    connections: DashMap<ConnectionId, RelayConnection>,
    credentials: TurnCredentialService,
    stun_urls: Vec<String>,
    ewma_alpha: f64,
    unhealthy_load: f64,
    health_interval: Duration,
    probe_timeout: Duration,
    cancel_token: CancellationToken,
}

impl RelayRegistry {
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        let registry = Self {
            nodes: RwLock::new(HashMap::new()),
            connections: DashMap::new(),
            credentials: TurnCredentialService::new(
                config.shared_secret.clone(),
                Duration::from_secs(config.credential_ttl_seconds),
            ),
            stun_urls: config.stun_urls.clone(),
            ewma_alpha: config.ewma_alpha,
            unhealthy_load: config.unhealthy_load,
            health_interval: Duration::from_secs(config.health_interval_seconds),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            cancel_token: CancellationToken::new(),
        };

        for node in &config.nodes {
            if let Err(e) = registry.register_node(node) {
                warn!(node_id = %node.id, error = %e, "Skipping invalid relay node");
            }
        }
        registry
    }

    #[must_use]
    pub const fn credential_service(&self) -> &TurnCredentialService {
        &self.credentials
    }

    /// Add a node, or update its static description if already known.
    /// Live counters and averages survive an update.
    pub fn register_node(&self, config: &RelayNodeConfig) -> Result<RelayNodeInfo> {
        if config.id.is_empty() || config.host.is_empty() {
            return Err(Error::Validation("relay node needs an id and a host".to_string()));
        }
        if config.capacity == 0 {
            return Err(Error::Validation(format!(
                "relay node '{}' needs a non-zero capacity",
                config.id
            )));
        }

        let mut node = RelayNode::from_config(config);
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&node.id) {
            node.active_connections = existing.active_connections;
            node.latency_ms = existing.latency_ms;
            node.packet_loss_rate = existing.packet_loss_rate;
            node.samples = existing.samples;
            node.last_sample_at = existing.last_sample_at;
        }
        node.recompute_health(self.unhealthy_load);
        let info = node.info();
        nodes.insert(node.id.clone(), node);
        let total = nodes.len();
        drop(nodes);

        info!(
            node_id = %info.id,
            region = %info.region,
            capacity = info.capacity,
            total_nodes = total,
            "Relay node registered"
        );
        Ok(info)
    }

    /// Remove a node and forget its connections
    pub fn remove_node(&self, node_id: &NodeId) -> bool {
        let removed = self.nodes.write().remove(node_id).is_some();
        if removed {
            self.connections.retain(|_, conn| &conn.node_id != node_id);
            info!(node_id = %node_id, "Relay node removed");
        }
        removed
    }

    #[must_use]
    pub fn get_node(&self, node_id: &NodeId) -> Option<RelayNodeInfo> {
        self.nodes.read().get(node_id).map(RelayNode::info)
    }

    #[must_use]
    pub fn get_nodes_by_region(&self, region: &str) -> Vec<RelayNodeInfo> {
        let mut nodes: Vec<RelayNodeInfo> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.region == region)
            .map(RelayNode::info)
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    #[must_use]
    pub fn list_nodes(&self) -> Vec<RelayNodeInfo> {
        let mut nodes: Vec<RelayNodeInfo> =
            self.nodes.read().values().map(RelayNode::info).collect();
        nodes.sort_by(|a, b| (&a.region, &a.id).cmp(&(&b.region, &b.id)));
        nodes
    }

    /// Best node for a new session, without reserving it
    #[must_use]
    pub fn allocate_best_node(&self, preferred_region: Option<&str>) -> Option<RelayNodeInfo> {
        let nodes = self.nodes.read();
        select_best(nodes.values(), preferred_region).map(RelayNode::info)
    }

    /// Select a node and claim one of its slots under the same write lock
    pub fn allocate_connection(
        &self,
        client_id: &str,
        peer_id: &str,
        preferred_region: Option<&str>,
    ) -> Result<Allocation> {
        if client_id.is_empty() || peer_id.is_empty() {
            return Err(Error::Validation("clientId and peerId are required".to_string()));
        }

        let node = {
            let mut nodes = self.nodes.write();
            let best_id = select_best(nodes.values(), preferred_region).map(|n| n.id.clone());
            let Some(best_id) = best_id else {
                drop(nodes);
                ALLOCATIONS.with_label_values(&["exhausted"]).inc();
                warn!(
                    client_id,
                    region = preferred_region.unwrap_or("any"),
                    "No relay node available"
                );
                return Err(Error::CapacityExceeded(
                    "no healthy relay node with free capacity".to_string(),
                ));
            };
            let node = nodes
                .get_mut(&best_id)
                .ok_or_else(|| Error::Internal("selected relay node vanished".to_string()))?;
            node.active_connections += 1;
            node.recompute_health(self.unhealthy_load);
            node.clone()
        };

        let credentials = match self
            .credentials
            .generate_credentials(client_id, node.turn_urls())
        {
            Ok(credentials) => credentials,
            Err(e) => {
                self.decrement(&node.id);
                return Err(e);
            }
        };

        let connection_id = ConnectionId::generate();
        self.connections.insert(
            connection_id.clone(),
            RelayConnection {
                id: connection_id.clone(),
                node_id: node.id.clone(),
                client_id: client_id.to_string(),
                peer_id: peer_id.to_string(),
                allocated_at: Utc::now(),
            },
        );
        ALLOCATIONS.with_label_values(&["allocated"]).inc();

        info!(
            connection_id = %connection_id,
            node_id = %node.id,
            region = %node.region,
            active = node.active_connections,
            capacity = node.capacity,
            "Relay connection allocated"
        );

        Ok(Allocation {
            connection_id,
            ice_servers: self.ice_servers(&credentials),
            node: node.info(),
            credentials,
        })
    }

    fn decrement(&self, node_id: &NodeId) {
        if let Some(node) = self.nodes.write().get_mut(node_id) {
            node.active_connections = node.active_connections.saturating_sub(1);
            node.recompute_health(self.unhealthy_load);
        }
    }

    /// Release an allocated session. Returns `false` for unknown ids.
    pub fn release_connection(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return false;
        };
        self.decrement(&connection.node_id);
        debug!(
            connection_id = %connection_id,
            node_id = %connection.node_id,
            "Relay connection released"
        );
        true
    }

    #[must_use]
    pub fn ice_servers(&self, credentials: &TurnCredentials) -> Vec<IceServer> {
        let mut servers = Vec::with_capacity(2);
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !credentials.urls.is_empty() {
            servers.push(IceServer {
                urls: credentials.urls.clone(),
                username: Some(credentials.username.clone()),
                credential: Some(credentials.credential.clone()),
            });
        }
        servers
    }

    /// Mint credentials for a node, or for the best node in a region
    pub fn generate_credentials(
        &self,
        user_id: &str,
        target: &CredentialTarget,
    ) -> Result<TurnCredentials> {
        let urls = {
            let nodes = self.nodes.read();
            let node = match target {
                CredentialTarget::Node(id) => nodes
                    .get(id)
                    .ok_or_else(|| Error::NotFound(format!("relay node '{id}'")))?,
                CredentialTarget::Region(region) => select_best(nodes.values(), Some(region.as_str()))
                    .ok_or_else(|| {
                        Error::CapacityExceeded(
                            "no healthy relay node with free capacity".to_string(),
                        )
                    })?,
            };
            node.turn_urls()
        };
        self.credentials.generate_credentials(user_id, urls)
    }

    /// Fold an externally reported sample into a node's averages
    pub fn report_sample(
        &self,
        node_id: &NodeId,
        latency_ms: f64,
        packet_loss: f64,
    ) -> Result<RelayNodeInfo> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("relay node '{node_id}'")))?;
        node.record_sample(latency_ms, packet_loss, self.ewma_alpha);
        node.recompute_health(self.unhealthy_load);
        Ok(node.info())
    }

    /// Recompute health for every node; returns the healthy count
    pub fn recompute_health(&self) -> usize {
        let mut nodes = self.nodes.write();
        nodes
            .values_mut()
            .map(|n| n.recompute_health(self.unhealthy_load))
            .filter(|healthy| *healthy)
            .count()
    }

    /// Probe every node once and fold the results in.
    ///
    /// A failed probe counts as full packet loss with a latency sample equal
    /// to the probe timeout.
    pub async fn run_health_check(&self, probe: &dyn NodeProbe) {
        let targets: Vec<(NodeId, String, u16)> = self
            .nodes
            .read()
            .values()
            .map(|n| (n.id.clone(), n.host.clone(), n.port))
            .collect();

        let results = futures::future::join_all(targets.into_iter().map(
            |(id, host, port)| async move {
                let result = probe.probe(&host, port).await;
                (id, result)
            },
        ))
        .await;

        let timeout_ms = self.probe_timeout.as_secs_f64() * 1000.0;
        let mut nodes = self.nodes.write();
        for (id, result) in results {
            let Some(node) = nodes.get_mut(&id) else {
                continue;
            };
            match result {
                Ok(rtt) => node.record_sample(rtt.as_secs_f64() * 1000.0, 0.0, self.ewma_alpha),
                Err(e) => {
                    debug!(node_id = %id, error = %e, "Relay probe failed");
                    node.record_sample(timeout_ms, 1.0, self.ewma_alpha);
                }
            }
        }
        let healthy = nodes
            .values_mut()
            .map(|n| n.recompute_health(self.unhealthy_load))
            .filter(|h| *h)
            .count();
        let total = nodes.len();
        drop(nodes);

        debug!(healthy, total, "Relay health check complete");
    }

    /// Start the periodic health loop. Stops on [`shutdown`](Self::shutdown).
    pub fn start_health_monitor(
        self: &Arc<Self>,
        probe: Arc<dyn NodeProbe>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let cancel_token = self.cancel_token.clone();
        let every = self.health_interval;

        info!(interval_secs = every.as_secs(), "Starting relay health monitor");

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        debug!("Relay health monitor stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        registry.run_health_check(probe.as_ref()).await;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn aggregate_metrics(&self) -> RelayAggregateMetrics {
        let nodes = self.nodes.read();
        let mut metrics = RelayAggregateMetrics {
            total_nodes: nodes.len(),
            tracked_connections: self.connections.len(),
            ..RelayAggregateMetrics::default()
        };

        let mut load_sum = 0.0;
        let mut latency_sum = 0.0;
        let mut loss_sum = 0.0;
        for node in nodes.values() {
            load_sum += node.load();
            latency_sum += node.latency_ms;
            loss_sum += node.packet_loss_rate;
            metrics.total_capacity += u64::from(node.capacity);
            metrics.active_connections += u64::from(node.active_connections);
            if node.healthy {
                metrics.healthy_nodes += 1;
            }

            let region = metrics.regions.entry(node.region.clone()).or_default();
            region.nodes += 1;
            region.capacity += u64::from(node.capacity);
            region.active_connections += u64::from(node.active_connections);
            region.average_latency_ms += node.latency_ms;
            if node.healthy {
                region.healthy_nodes += 1;
            }
        }
        drop(nodes);

        if metrics.total_nodes > 0 {
            let n = metrics.total_nodes as f64;
            metrics.average_load = load_sum / n;
            metrics.average_latency_ms = latency_sum / n;
            metrics.average_packet_loss = loss_sum / n;
        }
        for region in metrics.regions.values_mut() {
            region.average_latency_ms /= region.nodes as f64;
        }
        metrics
    }
}
