mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use edgecast_core::{logging, Config};

use server::EdgeServer;

/// Edge streaming and relay node
#[derive(Debug, Parser)]
#[command(name = "edgecast", version, about)]
struct Args {
    /// Configuration file (any format the `config` crate understands)
    #[arg(short, long, env = "EDGECAST_CONFIG")]
    config: Option<String>,

    /// Override `server.host`
    #[arg(long)]
    host: Option<String>,

    /// Override `server.http_port`
    #[arg(long)]
    port: Option<u16>,
}

/// Unique node id when none is configured
fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.http_port = port;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;

    let node_id = if config.node.node_id.is_empty() {
        generate_node_id()
    } else {
        config.node.node_id.clone()
    };
    info!(node_id = %node_id, region = %config.node.region, "Edgecast node starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Wire services and run until shutdown
    let server = EdgeServer::new(config, node_id)?;
    server.start().await
}
