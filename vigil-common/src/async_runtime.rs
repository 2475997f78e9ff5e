//! Async runtime helpers shared by the agent and the server
//!
//! This module provides:
//! - The linear backoff policy used between retry attempts
//! - A generic retry loop parameterised by an error classifier
//! - Graceful shutdown coordination with a bounded grace window

use std::future::Future;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::VigilError;

/// Linear backoff: `base`, then `base + step`, `base + 2 * step`, ...
///
/// Each retry loop owns a fresh instance; sharing one between loops would
/// interleave their attempt counts.
#[derive(Debug)]
pub struct LinearBackoff {
    next: Duration,
    step: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration, step: Duration) -> Self {
        Self { next: base, step }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next += self.step;
        delay
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(2))
    }
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first call included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Amount added to the delay after every retry
    pub delay_step: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Build a fresh backoff generator for one retry loop
    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff::new(self.base_delay, self.delay_step)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            delay_step: Duration::from_secs(2),
        }
    }
}

/// Retry `operation` while `is_retryable` accepts its error.
///
/// Non-retryable errors are returned at once. When every attempt fails the
/// last error is returned as is. A cancelled token stops the loop during the
/// backoff wait and yields `VigilError::Cancelled`.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    is_retryable: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + From<VigilError>,
    C: Fn(&E) -> bool,
{
    let mut backoff = config.backoff();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retryable(&e) => return Err(e),
            Err(e) if attempt >= max_attempts => {
                error!("All {} attempts failed: {}", max_attempts, e);
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("Attempt {} failed: {}, retrying after {:?}", attempt, e, delay);

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(VigilError::Cancelled.into()),
                            _ = sleep(delay) => {}
                        }
                    }
                    None => sleep(delay).await,
                }
                attempt += 1;
            }
        }
    }
}

/// Resolves when the process receives Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Graceful shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a task for graceful shutdown
    pub async fn register_task(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name, handle));
    }

    /// Token cancelled when shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown and wait for all tasks within one grace window.
    ///
    /// Tasks still running when the window closes are aborted and reported
    /// as `VigilError::ShutdownTimeout`.
    pub async fn shutdown(self, grace: Duration) -> Result<(), VigilError> {
        info!("Initiating coordinated shutdown");
        self.token.cancel();

        let deadline = Instant::now() + grace;
        let task_handles: Vec<_> = self.tasks.lock().await.drain(..).collect();

        let mut timed_out = Vec::new();
        let mut failed = None;

        for (name, mut handle) in task_handles {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!("Task '{}' shutdown successfully", name),
                Ok(Err(e)) => {
                    error!("Task '{}' panicked during shutdown: {:?}", name, e);
                    failed.get_or_insert(name);
                }
                Err(_) => {
                    error!("Task '{}' timed out during shutdown", name);
                    handle.abort();
                    timed_out.push(name);
                }
            }
        }

        if !timed_out.is_empty() {
            return Err(VigilError::ShutdownTimeout(timed_out));
        }
        if let Some(name) = failed {
            return Err(VigilError::TaskFailed(name));
        }

        info!("All tasks shutdown successfully");
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
