use anyhow::{anyhow, bail, Context, Result};
use config::{Config, Environment, File};
use ip_network::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listener configuration
    pub network: NetworkConfig,

    /// Storage backend selection and persistence
    pub storage: StorageConfig,

    /// Payload signing and encryption
    pub security: SecurityConfig,

    /// Shutdown behaviour
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on, `host:port`
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Time between snapshot dumps
    #[serde(with = "vigil_common::duration")]
    pub store_interval: Duration,

    /// Snapshot file used when no database is configured
    pub file_storage_path: PathBuf,

    /// Replay the snapshot file on start
    pub restore: bool,

    /// Postgres connection string; selects the relational backend when set
    pub database_dsn: Option<String>,

    /// Attempts per storage operation, the first one included
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared HMAC/encryption key
    pub key: Option<String>,

    /// RSA private key (PEM); when set every body must be RSA-OAEP encrypted
    pub crypto_key: Option<PathBuf>,

    /// CIDR the `X-Real-IP` header must fall in, e.g. `10.0.0.0/8`
    pub trusted_subnet: Option<String>,
}

impl SecurityConfig {
    /// Parse `trusted_subnet`; a bare address is a single-host network
    pub fn trusted_network(&self) -> Result<Option<IpNetwork>> {
        let Some(subnet) = self.trusted_subnet.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if subnet.is_empty() {
            return Ok(None);
        }

        let network = match IpNetwork::from_str(subnet) {
            Ok(network) => network,
            Err(_) => match IpAddr::from_str(subnet) {
                Ok(IpAddr::V4(ip4)) => IpNetwork::new(ip4, 32)
                    .map_err(|e| anyhow!("failed to build single-host ipv4 network: {}", e))?,
                Ok(IpAddr::V6(ip6)) => IpNetwork::new(ip6, 128)
                    .map_err(|e| anyhow!("failed to build single-host ipv6 network: {}", e))?,
                Err(_) => bail!("security.trusted_subnet is not a valid network: {}", subnet),
            },
        };
        Ok(Some(network))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for the final dump and task teardown
    #[serde(with = "vigil_common::duration")]
    pub grace_period: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_interval: Duration::from_secs(300),
            file_storage_path: PathBuf::from("metrics.dump"),
            restore: false,
            database_dsn: None,
            retry_attempts: 4,
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

impl ServerConfig {
    /// Defaults, then the optional file, then `VIGIL_SERVER__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(Environment::with_prefix("VIGIL_SERVER").separator("__"))
            .build()
            .context("Failed to read server configuration")?;

        let config: ServerConfig = config
            .try_deserialize()
            .context("Invalid server configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.address.is_empty() {
            bail!("network.address must not be empty");
        }
        if self.storage.store_interval.is_zero() {
            bail!("storage.store_interval must be positive");
        }
        if self.storage.retry_attempts == 0 {
            bail!("storage.retry_attempts must be at least 1");
        }
        if self.shutdown.grace_period.is_zero() {
            bail!("shutdown.grace_period must be positive");
        }
        self.security.trusted_network()?;
        Ok(())
    }
}
