use std::path::PathBuf;

use thiserror::Error;
use vigil_common::VigilError;

/// Failure of a single metric source during a poll
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {file}: {detail}")]
    Parse { file: &'static str, detail: String },
}

impl CollectError {
    pub fn parse(file: &'static str, detail: impl Into<String>) -> Self {
        CollectError::Parse {
            file,
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("Server error: HTTP {0}")]
    Server(u16),

    #[error("Batch rejected: HTTP {0}")]
    Rejected(u16),

    #[error("Encoding error: {0}")]
    Codec(VigilError),

    #[error("Send cancelled")]
    Cancelled,
}

impl SendError {
    /// Network failures and 5xx answers are worth another attempt. A timed
    /// out request is not: the client gave up on it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Network(_) | SendError::Server(_))
    }

    /// Classify a failed request
    pub fn from_request(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SendError::Timeout(error)
        } else {
            SendError::Network(error)
        }
    }
}

impl From<VigilError> for SendError {
    fn from(error: VigilError) -> Self {
        match error {
            VigilError::Cancelled => SendError::Cancelled,
            other => SendError::Codec(other),
        }
    }
}

pub type SendResult<T> = Result<T, SendError>;
