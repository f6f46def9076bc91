//! Reachability probes for relay nodes

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Measures round-trip latency to a relay endpoint
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, host: &str, port: u16) -> anyhow::Result<Duration>;
}

/// Times a TCP connect to the relay's listening port
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl NodeProbe for TcpProbe {
    async fn probe(&self, host: &str, port: u16) -> anyhow::Result<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(anyhow::anyhow!("connect to {host}:{port} failed: {e}")),
            Err(_) => Err(anyhow::anyhow!(
                "connect to {host}:{port} timed out after {:?}",
                self.timeout
            )),
        }
    }
}
