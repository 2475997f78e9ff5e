//! HTTP surface of the metric server
//!
//! Handlers only decode requests, call the storage engine and encode the
//! answer. Request bodies may be gzip encoded, encrypted and signed; with a
//! key configured every response carries a `HashSHA256` header too. With a
//! trusted subnet configured, requests announcing an `X-Real-IP` outside it
//! are refused before reaching any handler.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use ip_network::IpNetwork;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, warn};
use vigil_common::codec::{ENCRYPTION_HEADER, HASH_HEADER, REAL_IP_HEADER};
use vigil_common::{Encryption, Metric, MetricKind, PayloadCodec, PayloadHeaders, VigilError};

use crate::error::StorageError;
use crate::storage::MetricStorage;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn MetricStorage>,
    pub codec: Arc<PayloadCodec>,
    pub trusted_subnet: Option<IpNetwork>,
}

impl AppState {
    pub fn new(storage: Arc<dyn MetricStorage>, codec: PayloadCodec) -> Self {
        Self {
            storage,
            codec: Arc::new(codec),
            trusted_subnet: None,
        }
    }

    pub fn with_trusted_subnet(mut self, subnet: IpNetwork) -> Self {
        self.trusted_subnet = Some(subnet);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(all_metrics))
        .route("/ping", get(ping))
        .route("/updates/", post(update_batch))
        .route("/update/", post(update_one))
        .route("/update/{kind}/{id}/{value}", post(update_from_path))
        .route("/value/", post(value_of))
        .route("/value/{kind}/{id}", get(value_text))
        .layer(middleware::from_fn_with_state(state.clone(), check_real_ip))
        .with_state(state)
}

/// Refuse requests whose `X-Real-IP` is unparsable or outside the trusted
/// subnet. Requests without the header pass.
async fn check_real_ip(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let (Some(subnet), Some(value)) = (&state.trusted_subnet, request.headers().get(REAL_IP_HEADER)) {
        let ip = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        match ip {
            Some(ip) if subnet.contains(ip) => {}
            _ => {
                warn!("Refused request from untrusted address {:?}", value);
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }
    Ok(next.run(request).await)
}

/// Lookup body of `POST /value/`
#[derive(Debug, Deserialize)]
struct MetricQuery {
    id: String,
    #[serde(rename = "type")]
    kind: MetricKind,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, message).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            StorageError::Metric(_) => ApiError::BadRequest(e.to_string()),
            other => {
                error!("Storage failure: {}", other);
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<VigilError> for ApiError {
    fn from(e: VigilError) -> Self {
        match e {
            VigilError::Cancelled | VigilError::ShutdownTimeout(_) | VigilError::TaskFailed(_) => {
                ApiError::Internal(e.to_string())
            }
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

fn payload_headers(headers: &HeaderMap) -> Result<PayloadHeaders<'_>, ApiError> {
    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    let encryption = match headers.get(ENCRYPTION_HEADER) {
        None => None,
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ApiError::BadRequest("invalid encryption header".into()))?;
            Some(Encryption::from_header(value)?)
        }
    };
    let signature = headers.get(HASH_HEADER).and_then(|v| v.to_str().ok());

    Ok(PayloadHeaders {
        gzip,
        encryption,
        signature,
    })
}

fn decode_body<T: DeserializeOwned>(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, ApiError> {
    let headers = payload_headers(headers)?;
    state.codec.decode(body, &headers).map_err(|e| {
        warn!("Rejected request body: {}", e);
        ApiError::from(e)
    })
}

/// Build a response and sign its body when a key is configured
fn signed(state: &AppState, content_type: &'static str, body: Vec<u8>) -> Response {
    let signature = state.codec.sign(&body);
    let mut response = (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response();

    if let Some(signature) = signature {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(HASH_HEADER.as_bytes()),
            HeaderValue::from_str(&signature),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

fn signed_json<T: Serialize + ?Sized>(state: &AppState, value: &T) -> Result<Response, ApiError> {
    let body = serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(signed(state, "application/json", body))
}

/// POST /updates/ - merge a batch, answer with post-merge records
async fn update_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let batch: Vec<Metric> = decode_body(&state, &headers, &body)?;
    let merged = state.storage.update_metrics(&batch).await?;
    debug!("Merged batch of {} metrics", merged.len());
    signed_json(&state, &merged)
}

/// POST /update/ - merge one record
async fn update_one(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let metric: Metric = decode_body(&state, &headers, &body)?;
    let merged = state.storage.update_metrics(std::slice::from_ref(&metric)).await?;
    let merged = merged
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Internal("storage returned no record".into()))?;
    signed_json(&state, &merged)
}

/// POST /update/{kind}/{id}/{value} - merge one record given in the path
async fn update_from_path(
    State(state): State<AppState>,
    Path((kind, id, value)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let kind: MetricKind = kind.parse()?;
    let metric = match kind {
        MetricKind::Counter => value
            .parse::<i64>()
            .map(|delta| Metric::counter(id, delta))
            .map_err(|e| ApiError::BadRequest(format!("invalid counter delta: {}", e)))?,
        MetricKind::Gauge => value
            .parse::<f64>()
            .map(|v| Metric::gauge(id, v))
            .map_err(|e| ApiError::BadRequest(format!("invalid gauge value: {}", e)))?,
    };
    let merged = state.storage.update_metrics(&[metric]).await?;
    let body = merged.first().map(Metric::value_string).unwrap_or_default();
    Ok(signed(&state, "text/plain; charset=utf-8", body.into_bytes()))
}

/// POST /value/ - look up one record by id and kind
async fn value_of(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let query: MetricQuery = decode_body(&state, &headers, &body)?;
    let metric = state.storage.get_metric(&query.id, query.kind).await?;
    signed_json(&state, &metric)
}

/// GET /value/{kind}/{id} - plain-text value
async fn value_text(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let kind: MetricKind = kind.parse()?;
    let metric = state.storage.get_metric(&id, kind).await?;
    Ok(signed(
        &state,
        "text/plain; charset=utf-8",
        metric.value_string().into_bytes(),
    ))
}

/// GET / - every stored record
async fn all_metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let metrics = state.storage.get_all_metrics().await?;
    signed_json(&state, &metrics)
}

/// GET /ping - backend reachability
async fn ping(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.storage.ping().await.map_err(|e| {
        warn!("Ping failed: {}", e);
        ApiError::Internal(e.to_string())
    })?;
    Ok(StatusCode::OK)
}
