// Store error classification.
//
// Callers branch on exactly two outcomes: retryable (connection, timeout,
// throttling) and fatal (schema or encoding violations). The worker's
// circuit breaker counts the former and dead-letters on the latter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("retryable store failure: {reason}")]
    Retryable { reason: String },

    #[error("fatal store failure: {reason}")]
    Fatal { reason: String },
}

impl StoreError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        StoreError::Retryable {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        StoreError::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable { .. })
    }
}

impl From<opendal::Error> for StoreError {
    fn from(err: opendal::Error) -> Self {
        if err.is_temporary() {
            StoreError::retryable(err.to_string())
        } else {
            StoreError::fatal(err.to_string())
        }
    }
}

impl From<arrow::error::ArrowError> for StoreError {
    fn from(err: arrow::error::ArrowError) -> Self {
        StoreError::fatal(format!("arrow: {err}"))
    }
}

impl From<parquet::errors::ParquetError> for StoreError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        StoreError::fatal(format!("parquet: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
