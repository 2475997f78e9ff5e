use thiserror::Error;
use crate::types::MetricKind;

/// Main error type shared by the Vigil crates
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    #[error("Unknown metric kind: {0}")]
    UnknownKind(String),

    #[error("Metric {id} is a {stored}, cannot apply a {incoming} update")]
    KindMismatch {
        id: String,
        stored: MetricKind,
        incoming: MetricKind,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown grace period exceeded, still running: {0:?}")]
    ShutdownTimeout(Vec<&'static str>),

    #[error("Task {0} failed during shutdown")]
    TaskFailed(&'static str),
}

pub type Result<T> = std::result::Result<T, VigilError>;
