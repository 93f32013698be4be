//! Storage node executable.

use chunkgrid::metrics;
use chunkgrid::node::{NodeConfig, StorageNode};
use clap::Parser;
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "chunkgrid storage node", long_about = None)]
struct CliArgs {
    /// Stable identifier for this node.
    #[arg(long)]
    node_id: String,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 picks an ephemeral port).
    #[arg(long, default_value_t = 7500)]
    port: u16,

    /// Coordinator host.
    #[arg(long, default_value = "127.0.0.1")]
    coordinator_host: String,

    /// Coordinator port.
    #[arg(long, default_value_t = 7400)]
    coordinator_port: u16,

    /// Declared storage capacity in bytes.
    #[arg(long, default_value_t = 100 * 1024 * 1024 * 1024)]
    capacity_bytes: u64,

    /// Declared link bandwidth in bits per second.
    #[arg(long, default_value_t = 1_000_000_000)]
    bandwidth_bps: u64,
}

impl CliArgs {
    fn sanitize(&self) -> Result<SocketAddr, String> {
        if self.node_id.is_empty() {
            return Err("node-id must not be empty".into());
        }
        if self.capacity_bytes == 0 {
            return Err("capacity-bytes must be positive".into());
        }
        if self.bandwidth_bps == 0 {
            return Err("bandwidth-bps must be positive".into());
        }
        format!("{}:{}", self.coordinator_host, self.coordinator_port)
            .parse()
            .map_err(|_| {
                format!(
                    "invalid coordinator endpoint {}:{}",
                    self.coordinator_host, self.coordinator_port
                )
            })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = CliArgs::parse();
    let coordinator_addr = match args.sanitize() {
        Ok(addr) => addr,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    metrics::init_metrics();

    let config = NodeConfig::builder(args.node_id.as_str(), coordinator_addr)
        .listen(args.host.as_str(), args.port)
        .capacity_bytes(args.capacity_bytes)
        .bandwidth_bps(args.bandwidth_bps)
        .build();

    let node = match StorageNode::bind(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = node.register().await {
        error!("registration failed: {e}");
        std::process::exit(2);
    }
    info!(node_id = %args.node_id, addr = %node.local_addr(), "storage node running");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = node.run(shutdown_rx).await {
        error!("node terminated abnormally: {e}");
        std::process::exit(2);
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
