use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Client;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_common::codec::{ENCRYPTION_HEADER, HASH_HEADER, REAL_IP_HEADER};
use vigil_common::{crypto, retry_with_backoff, EncodedPayload, Metric, PayloadCodec, RetryConfig};

use crate::config::ServerEndpoint;
use crate::error::{SendError, SendResult};

/// Delivers one batch to the server
#[async_trait]
pub trait MetricSender: Send + Sync {
    /// Send `batch`, giving up early once `cancel` fires
    async fn send(&self, batch: &[Metric], cancel: &CancellationToken) -> SendResult<()>;
}

/// Batch sender over HTTP with retry on network errors and 5xx answers
pub struct HttpSender {
    client: Client,
    url: String,
    codec: PayloadCodec,
    retry: RetryConfig,
    real_ip: Option<IpAddr>,
}

impl HttpSender {
    pub fn new(endpoint: &ServerEndpoint) -> SendResult<Self> {
        let client = Client::builder()
            .timeout(endpoint.request_timeout)
            .build()?;
        let mut codec = PayloadCodec::new(endpoint.key.clone(), endpoint.encrypt)?;
        if let Some(path) = &endpoint.crypto_key {
            codec = codec.with_public_key(crypto::load_public_key(path)?);
        }

        let sender = Self::with_client(
            client,
            endpoint.updates_url(),
            codec,
            RetryConfig::new(endpoint.retry_attempts),
        );
        Ok(match endpoint.real_ip {
            Some(ip) => sender.with_real_ip(ip),
            None => sender,
        })
    }

    pub fn with_client(client: Client, url: String, codec: PayloadCodec, retry: RetryConfig) -> Self {
        Self {
            client,
            url,
            codec,
            retry,
            real_ip: None,
        }
    }

    pub fn with_real_ip(mut self, ip: IpAddr) -> Self {
        self.real_ip = Some(ip);
        self
    }

    async fn post(&self, payload: &EncodedPayload, cancel: &CancellationToken) -> SendResult<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(payload.body.clone());
        if let Some(encryption) = payload.encryption {
            request = request.header(ENCRYPTION_HEADER, encryption.header_value());
        }
        if let Some(ip) = self.real_ip {
            request = request.header(REAL_IP_HEADER, ip.to_string());
        }
        if let Some(signature) = &payload.signature {
            request = request.header(HASH_HEADER, signature.as_str());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SendError::Cancelled),
            response = request.send() => response.map_err(SendError::from_request)?,
        };

        let status = response.status();
        if status.is_server_error() {
            Err(SendError::Server(status.as_u16()))
        } else if status.is_client_error() {
            Err(SendError::Rejected(status.as_u16()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetricSender for HttpSender {
    async fn send(&self, batch: &[Metric], cancel: &CancellationToken) -> SendResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Encoded once; every attempt resends the same bytes
        let payload = self.codec.encode(batch)?;
        retry_with_backoff(&self.retry, Some(cancel), SendError::is_retryable, || {
            self.post(&payload, cancel)
        })
        .await?;

        debug!("Sent batch of {} metrics to {}", batch.len(), self.url);
        Ok(())
    }
}
