use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Where and how batches are sent
    pub server: ServerEndpoint,

    /// Sampling and reporting cadence
    pub reporting: ReportingConfig,

    /// Shutdown behaviour
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEndpoint {
    /// Server address, `host:port` or a full base URL
    pub address: String,

    /// Per-request timeout
    #[serde(with = "vigil_common::duration")]
    pub request_timeout: Duration,

    /// Attempts per batch, the first one included
    pub retry_attempts: u32,

    /// Shared HMAC/encryption key
    pub key: Option<String>,

    /// Encrypt bodies with the shared key
    pub encrypt: bool,

    /// Server RSA public key (PEM); bodies are RSA-OAEP encrypted when set
    pub crypto_key: Option<PathBuf>,

    /// Address announced in `X-Real-IP`
    pub real_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Time between polls
    #[serde(with = "vigil_common::duration")]
    pub poll_interval: Duration,

    /// Time between report ticks
    #[serde(with = "vigil_common::duration")]
    pub report_interval: Duration,

    /// Maximum concurrent outbound sends
    pub rate_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed to drain queued batches
    #[serde(with = "vigil_common::duration")]
    pub grace_period: Duration,
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            request_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            key: None,
            encrypt: false,
            crypto_key: None,
            real_ip: None,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            rate_limit: 3,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(15),
        }
    }
}

impl ServerEndpoint {
    /// URL of the batch endpoint
    pub fn updates_url(&self) -> String {
        let base = self.address.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{}/updates/", base)
        } else {
            format!("http://{}/updates/", base)
        }
    }
}

impl AgentConfig {
    /// Defaults, then the optional file, then `VIGIL_AGENT__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&AgentConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(Environment::with_prefix("VIGIL_AGENT").separator("__"))
            .build()
            .context("Failed to read agent configuration")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.address.is_empty() {
            bail!("server.address must not be empty");
        }
        if self.server.request_timeout.is_zero() {
            bail!("server.request_timeout must be positive");
        }
        if self.server.retry_attempts == 0 {
            bail!("server.retry_attempts must be at least 1");
        }
        if self.server.encrypt && self.server.key.as_deref().map_or(true, str::is_empty) {
            bail!("server.encrypt requires server.key");
        }
        if self.server.encrypt && self.server.crypto_key.is_some() {
            bail!("server.encrypt and server.crypto_key are mutually exclusive");
        }
        if self.reporting.poll_interval.is_zero() || self.reporting.report_interval.is_zero() {
            bail!("reporting intervals must be positive");
        }
        if self.reporting.rate_limit == 0 {
            bail!("reporting.rate_limit must be at least 1");
        }
        if self.shutdown.grace_period.is_zero() {
            bail!("shutdown.grace_period must be positive");
        }
        Ok(())
    }
}
