use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil_common::shutdown_signal;
use vigil_server::{MetricServer, ServerConfig};

#[derive(Parser)]
#[command(name = "vigil-server")]
#[command(about = "Vigil metric server - merges pushed metrics into durable storage")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "VIGIL_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    address: Option<String>,

    /// Time between snapshot dumps, e.g. `300` or `5m`
    #[arg(short = 'i', long, value_parser = vigil_common::duration::parse)]
    store_interval: Option<Duration>,

    /// Snapshot file path
    #[arg(short, long)]
    file_storage_path: Option<PathBuf>,

    /// Restore the snapshot file on start
    #[arg(short, long)]
    restore: Option<bool>,

    /// Postgres connection string
    #[arg(short, long)]
    database_dsn: Option<String>,

    /// Signing and encryption key
    #[arg(short, long)]
    key: Option<String>,

    /// RSA private key (PEM) for asymmetric decryption
    #[arg(long)]
    crypto_key: Option<PathBuf>,

    /// Only accept requests whose X-Real-IP is in this CIDR
    #[arg(short, long)]
    trusted_subnet: Option<String>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(address) = self.address {
            config.network.address = address;
        }
        if let Some(interval) = self.store_interval {
            config.storage.store_interval = interval;
        }
        if let Some(path) = self.file_storage_path {
            config.storage.file_storage_path = path;
        }
        if let Some(restore) = self.restore {
            config.storage.restore = restore;
        }
        if let Some(dsn) = self.database_dsn {
            config.storage.database_dsn = Some(dsn);
        }
        if let Some(key) = self.key {
            config.security.key = Some(key);
        }
        if let Some(path) = self.crypto_key {
            config.security.crypto_key = Some(path);
        }
        if let Some(subnet) = self.trusted_subnet {
            config.security.trusted_subnet = Some(subnet);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .json()
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    info!("Starting Vigil server on {}", config.network.address);

    let server = MetricServer::new(config).await?;
    server.run(shutdown_signal()).await?;

    info!("Vigil server shutdown complete");
    Ok(())
}
