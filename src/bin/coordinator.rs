//! Coordinator executable.

use chunkgrid::config::ClusterConfig;
use chunkgrid::coordinator::CoordinatorService;
use chunkgrid::metrics;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "chunkgrid coordinator", long_about = None)]
struct CliArgs {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 7400)]
    port: u16,

    /// Replica placement strategy: diverse, least_loaded, or random.
    #[arg(long, default_value = "diverse")]
    placement: String,
}

impl CliArgs {
    fn sanitize(&self) -> Result<(), String> {
        if self.port <= 1024 {
            return Err(format!("invalid port {}", self.port));
        }
        if !matches!(self.placement.as_str(), "diverse" | "least_loaded" | "random") {
            return Err(format!("unknown placement strategy '{}'", self.placement));
        }
        Ok(())
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
    if let Err(e) = args.sanitize() {
        error!("{e}");
        std::process::exit(1);
    }

    metrics::init_metrics();

    let mut config = ClusterConfig::default();
    config.replication.placement_strategy = args.placement.clone();

    let service = match CoordinatorService::bind(config, &args.host, args.port).await {
        Ok(service) => service,
        Err(e) => {
            error!("failed to start coordinator: {e}");
            std::process::exit(1);
        }
    };
    info!(addr = %service.local_addr(), "coordinator listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = service.run(shutdown_rx).await {
        error!("coordinator terminated abnormally: {e}");
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
