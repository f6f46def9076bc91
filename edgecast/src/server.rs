//! Edge node server lifecycle
//!
//! Starts the background loops, serves HTTP until a shutdown signal, then
//! stops every loop and hands the last analytics batch to the sink.

use std::future::{Future, IntoFuture};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edgecast_api::{create_router, AppState};
use edgecast_core::service::analytics::{sink_channel, spawn_sink_consumer};
use edgecast_core::service::{AnalyticsEvent, AnalyticsSink, LogSink};
use edgecast_core::Config;
use edgecast_proxy::HttpAnalyticsSink;
use edgecast_relay::{NodeProbe, TcpProbe};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long the sink consumer gets to drain after the final flush
const SINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long open connections get to finish after a shutdown signal
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

pub struct EdgeServer {
    state: AppState,
    sink: Arc<dyn AnalyticsSink>,
    sink_rx: mpsc::Receiver<Vec<AnalyticsEvent>>,
}

impl EdgeServer {
    pub fn new(config: Config, node_id: String) -> anyhow::Result<Self> {
        let (sink_tx, sink_rx) = sink_channel(config.analytics.sink_queue);
        let sink_url = config.analytics.sink_url.clone();
        let sink_timeout = Duration::from_millis(config.node.upstream_response_timeout_ms);

        let state = AppState::from_config(config, node_id, sink_tx)?;

        if let Err(e) = state.relay.credential_service().validate_config() {
            warn!("Relay credential configuration is weak: {}", e);
        }

        let sink: Arc<dyn AnalyticsSink> = match sink_url {
            Some(url) => {
                info!("Analytics batches are posted to {}", url);
                Arc::new(HttpAnalyticsSink::new(
                    state.upstream.http().clone(),
                    &url,
                    sink_timeout,
                )?)
            }
            None => {
                info!("No analytics sink configured, flushed batches are logged only");
                Arc::new(LogSink)
            }
        };

        Ok(Self {
            state,
            sink,
            sink_rx,
        })
    }

    /// Start background tasks and serve HTTP until a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let Self {
            state,
            sink,
            sink_rx,
        } = self;
        let config = Arc::clone(&state.config);

        let sink_cancel = CancellationToken::new();
        let sink_handle = spawn_sink_consumer(sink_rx, sink, sink_cancel.clone());

        let mut tasks: Vec<JoinHandle<()>> = state
            .rate_limiters
            .start_sweepers(Duration::from_secs(config.rate_limit.sweep_interval_seconds));
        tasks.push(
            state
                .streams
                .start_sweeper(config.node.stream_sweep_interval()),
        );
        let probe: Arc<dyn NodeProbe> = Arc::new(TcpProbe::new(Duration::from_millis(
            config.relay.probe_timeout_ms,
        )));
        tasks.push(state.relay.start_health_monitor(probe));
        tasks.push(state.analytics.start());
        info!("Background tasks started ({})", tasks.len());

        let listener = tokio::net::TcpListener::bind(config.http_address())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {e}", config.http_address()))?;
        info!("HTTP server listening on {}", listener.local_addr()?);

        let draining = CancellationToken::new();
        let signal = {
            let draining = draining.clone();
            let streams = Arc::clone(&state.streams);
            async move {
                shutdown_signal().await;
                // Relays never end by themselves; close them so the drain can finish
                streams.shutdown();
                draining.cancel();
            }
        };

        let router = create_router(state.clone());
        let serve = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .into_future();
        let served = drain_with_deadline(serve, draining, HTTP_DRAIN_TIMEOUT).await;
        if let Err(e) = &served {
            error!("HTTP server error: {}", e);
        }

        shutdown(&state, tasks, sink_cancel, sink_handle).await;
        served.map_err(Into::into)
    }
}

/// Run `serve` until it returns, or until `grace` after `draining` fires
async fn drain_with_deadline<F>(
    serve: F,
    draining: CancellationToken,
    grace: Duration,
) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    tokio::select! {
        served = serve => served,
        () = async {
            draining.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(
                "Open connections did not drain within {}s, closing them",
                grace.as_secs()
            );
            Ok(())
        }
    }
}

/// Stop every loop, flush what is buffered, and let the sink drain
async fn shutdown(
    state: &AppState,
    tasks: Vec<JoinHandle<()>>,
    sink_cancel: CancellationToken,
    sink_handle: JoinHandle<()>,
) {
    info!("Shutting down edge node...");

    state.rate_limiters.shutdown();
    state.streams.shutdown();
    state.relay.shutdown();
    state.analytics.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    let flushed = state.analytics.flush();
    info!("Final analytics flush: {} event(s)", flushed.len());

    sink_cancel.cancel();
    match tokio::time::timeout(SINK_DRAIN_TIMEOUT, sink_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Analytics sink consumer ended abnormally: {}", e),
        Err(_) => warn!(
            "Analytics sink did not drain within {}s",
            SINK_DRAIN_TIMEOUT.as_secs()
        ),
    }

    info!("Edge node stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_grace() {
        let draining = CancellationToken::new();
        draining.cancel();

        // A connection that never finishes
        let served = drain_with_deadline(
            std::future::pending(),
            draining,
            Duration::from_secs(15),
        )
        .await;
        assert!(served.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_while_not_signalled() {
        let draining = CancellationToken::new();
        let drained = tokio::time::timeout(
            Duration::from_secs(60),
            drain_with_deadline(std::future::pending(), draining, Duration::from_secs(1)),
        )
        .await;
        assert!(drained.is_err());
    }

    #[tokio::test]
    async fn test_drain_returns_serve_result() {
        let served = drain_with_deadline(
            async { Err(io::Error::other("bind lost")) },
            CancellationToken::new(),
            Duration::from_secs(15),
        )
        .await;
        assert_eq!(served.unwrap_err().to_string(), "bind lost");
    }
}
