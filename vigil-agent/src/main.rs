use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil_agent::{AgentConfig, Collector, HttpSender, Pipeline, PipelineConfig};
use vigil_common::{shutdown_signal, ShutdownCoordinator};

#[derive(Parser)]
#[command(name = "vigil-agent")]
#[command(about = "Vigil agent - samples process and host metrics and pushes them to a Vigil server")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "VIGIL_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Server address
    #[arg(short, long)]
    address: Option<String>,

    /// Time between polls, e.g. `2` or `500ms`
    #[arg(short, long, value_parser = vigil_common::duration::parse)]
    poll_interval: Option<Duration>,

    /// Time between reports, e.g. `10` or `10s`
    #[arg(short, long, value_parser = vigil_common::duration::parse)]
    report_interval: Option<Duration>,

    /// Maximum concurrent sends
    #[arg(short = 'l', long)]
    rate_limit: Option<usize>,

    /// Signing and encryption key
    #[arg(short, long)]
    key: Option<String>,

    /// Encrypt request bodies with the key
    #[arg(short, long)]
    encrypt: bool,

    /// Server RSA public key (PEM) for asymmetric encryption
    #[arg(long)]
    crypto_key: Option<PathBuf>,

    /// Address to announce in X-Real-IP
    #[arg(long)]
    real_ip: Option<IpAddr>,
}

impl Args {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(address) = self.address {
            config.server.address = address;
        }
        if let Some(poll) = self.poll_interval {
            config.reporting.poll_interval = poll;
        }
        if let Some(report) = self.report_interval {
            config.reporting.report_interval = report;
        }
        if let Some(rate_limit) = self.rate_limit {
            config.reporting.rate_limit = rate_limit;
        }
        if let Some(key) = self.key {
            config.server.key = Some(key);
        }
        if self.encrypt {
            config.server.encrypt = true;
        }
        if let Some(path) = self.crypto_key {
            config.server.crypto_key = Some(path);
        }
        if let Some(ip) = self.real_ip {
            config.server.real_ip = Some(ip);
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
    let mut config = AgentConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    info!("Starting Vigil agent, reporting to {}", config.server.updates_url());

    let sender = HttpSender::new(&config.server).context("Failed to build HTTP sender")?;
    let pipeline = Pipeline::new(
        Collector::new(),
        Arc::new(sender),
        PipelineConfig {
            poll_interval: config.reporting.poll_interval,
            report_interval: config.reporting.report_interval,
            rate_limit: config.reporting.rate_limit,
        },
    );

    let coordinator = ShutdownCoordinator::new();
    let abort = CancellationToken::new();
    let handle = tokio::spawn(pipeline.run(coordinator.token(), abort.clone()));
    coordinator.register_task("pipeline", handle).await;

    shutdown_signal().await;
    let result = coordinator.shutdown(config.shutdown.grace_period).await;
    // Anything still sending past the grace window is cut off
    abort.cancel();
    result.context("Agent did not stop within the grace period")?;

    info!("Vigil agent shutdown complete");
    Ok(())
}
