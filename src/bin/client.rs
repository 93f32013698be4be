//! Thin operator client: upload, download, and cluster status.

use chunkgrid::client::ClusterClient;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, about = "chunkgrid client", long_about = None)]
struct CliArgs {
    /// Coordinator host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Coordinator port.
    #[arg(long, default_value_t = 7400)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file and print its file id.
    Upload {
        path: PathBuf,
        /// Replication factor.
        #[arg(short, long, default_value_t = 3)]
        replication: u32,
    },
    /// Download a file by id.
    Download {
        file_id: String,
        /// Where to write the bytes.
        output: PathBuf,
    },
    /// Print cluster status.
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = CliArgs::parse();
    let coordinator_addr: SocketAddr = match format!("{}:{}", args.host, args.port).parse() {
        Ok(addr) => addr,
        Err(_) => {
            error!("invalid coordinator endpoint {}:{}", args.host, args.port);
            std::process::exit(1);
        }
    };

    let client = ClusterClient::new(coordinator_addr);
    let outcome = match args.command {
        Command::Upload { path, replication } => upload(&client, &path, replication).await,
        Command::Download { file_id, output } => download(&client, &file_id, &output).await,
        Command::Status => status(&client).await,
    };

    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(2);
    }
}

async fn upload(
    client: &ClusterClient,
    path: &PathBuf,
    replication: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = tokio::fs::read(path).await?;
    let display_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());

    let file_id = client.upload(&display_name, &data, replication).await?;
    println!("{file_id}");
    Ok(())
}

async fn download(
    client: &ClusterClient,
    file_id: &str,
    output: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = client.download(file_id).await?;
    tokio::fs::write(output, &data).await?;
    println!("{} bytes written to {}", data.len(), output.display());
    Ok(())
}

async fn status(client: &ClusterClient) -> Result<(), Box<dyn std::error::Error>> {
    let report = client.status().await?;
    println!("nodes:            {} ({} healthy)", report.total_nodes, report.healthy_nodes);
    println!("capacity:         {} bytes", report.total_bytes);
    println!("used:             {} bytes", report.used_bytes);
    println!("files:            {}", report.file_count);
    println!("under-replicated: {}", report.under_replicated_count);
    Ok(())
}
