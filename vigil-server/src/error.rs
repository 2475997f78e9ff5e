use thiserror::Error;
use vigil_common::{MetricKind, VigilError};

/// SQLSTATE class for connection exceptions
const SQLSTATE_CONNECTION_CLASS: &str = "08";
/// SQLSTATE class for integrity constraint violations
const SQLSTATE_CONSTRAINT_CLASS: &str = "23";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Metric {id} ({kind}) not found")]
    NotFound { id: String, kind: MetricKind },

    #[error(transparent)]
    Metric(VigilError),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Integrity constraint violation: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Commit outcome unknown: {0}")]
    CommitUncertain(#[source] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted snapshot at line {line}: {source}")]
    Snapshot {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Errors worth retrying: transient connection failures and constraint
    /// conflicts that roll back the whole transaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_) | StorageError::Constraint(_))
    }

    pub fn not_found(id: &str, kind: MetricKind) -> Self {
        StorageError::NotFound {
            id: id.to_string(),
            kind,
        }
    }

    /// Map a failed `COMMIT`. A database answer means the transaction was
    /// rolled back; anything else leaves its outcome unknown.
    pub fn from_commit(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(_) => error.into(),
            other => StorageError::CommitUncertain(other),
        }
    }
}

impl From<VigilError> for StorageError {
    fn from(error: VigilError) -> Self {
        match error {
            VigilError::Io(e) => StorageError::Io(e),
            other => StorageError::Metric(other),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if code.starts_with(SQLSTATE_CONNECTION_CLASS) => {
                    StorageError::Connection(db.message().to_string())
                }
                Some(code) if code.starts_with(SQLSTATE_CONSTRAINT_CLASS) => {
                    StorageError::Constraint(db.message().to_string())
                }
                _ => StorageError::Database(error),
            },
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
                StorageError::Connection(error.to_string())
            }
            _ => StorageError::Database(error),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
