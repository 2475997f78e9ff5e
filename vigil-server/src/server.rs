use anyhow::{bail, Context, Result};
use ip_network::IpNetwork;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vigil_common::{crypto, PayloadCodec, ShutdownCoordinator};

use crate::config::ServerConfig;
use crate::http::{router, AppState};
use crate::persistence::PersistenceScheduler;
use crate::storage::{open_storage, MetricStorage};

/// Metric server that wires storage, persistence and the HTTP surface
pub struct MetricServer {
    config: ServerConfig,
    storage: Arc<dyn MetricStorage>,
    codec: PayloadCodec,
    trusted_subnet: Option<IpNetwork>,
}

impl MetricServer {
    /// Open the configured storage backend. Failing here is fatal.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        info!("Initializing metric server");
        let storage = open_storage(&config.storage)
            .await
            .context("Failed to open metric storage")?;
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: ServerConfig, storage: Arc<dyn MetricStorage>) -> Result<Self> {
        let mut codec = PayloadCodec::new(config.security.key.clone(), false)
            .context("Invalid security configuration")?;
        if let Some(path) = &config.security.crypto_key {
            let key = crypto::load_private_key(path)
                .with_context(|| format!("Failed to load private key {}", path.display()))?;
            codec = codec.with_private_key(key);
        }
        let trusted_subnet = config.security.trusted_network()?;
        Ok(Self {
            config,
            storage,
            codec,
            trusted_subnet,
        })
    }

    /// Bind the configured address and serve until `signal` resolves
    pub async fn run<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.config.network.address)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.network.address))?;
        self.serve(listener, signal).await
    }

    /// Serve on `listener` until `signal` resolves or the HTTP task dies.
    ///
    /// Shutdown order: stop accepting requests, run the final dump, close the
    /// storage. The whole sequence is bounded by the grace period and an
    /// overrun is returned as an error.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let coordinator = ShutdownCoordinator::new();
        let shutdown = coordinator.token();
        // Persistence outlives the HTTP server so the final dump sees every write
        let persistence_token = CancellationToken::new();

        let scheduler = PersistenceScheduler::new(self.storage.clone());
        let persistence = tokio::spawn(scheduler.run(persistence_token.clone()));
        coordinator.register_task("persistence", persistence).await;

        info!("Listening on {}", listener.local_addr()?);
        let state = AppState::new(self.storage.clone(), self.codec.clone());
        let app = router(match self.trusted_subnet {
            Some(subnet) => state.with_trusted_subnet(subnet),
            None => state,
        });
        let http_shutdown = shutdown.clone();
        let http = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(http_shutdown.clone().cancelled_owned())
                .await;
            if let Err(e) = result {
                error!("HTTP server failed: {}", e);
                http_shutdown.cancel();
            }
            info!("HTTP server stopped");
            persistence_token.cancel();
        });
        coordinator.register_task("http", http).await;

        let failed = tokio::select! {
            _ = signal => {
                info!("Shutdown requested");
                false
            }
            _ = shutdown.cancelled() => true,
        };

        coordinator
            .shutdown(self.config.shutdown.grace_period)
            .await
            .context("Graceful shutdown failed")?;

        if failed {
            bail!("HTTP server stopped unexpectedly");
        }
        info!("Metric server shutdown complete");
        Ok(())
    }
}
