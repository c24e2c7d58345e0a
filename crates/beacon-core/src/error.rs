// Error taxonomy shared by the HTTP services.
//
// Validation, auth and overload faults are handled at the edge; retryable
// dependency faults are absorbed by local retry and the worker's breaker
// before they become user-visible.

use serde::Serialize;
use thiserror::Error;

use crate::validate::SampleError;

#[derive(Debug, Error)]
pub enum Fault {
    #[error("payload validation failed")]
    Validation { errors: Vec<SampleError> },

    #[error("missing or invalid credential")]
    Auth,

    #[error("rate limit exceeded")]
    Overload { retry_after_secs: u64 },

    #[error("dependency temporarily unavailable: {reason}")]
    Retryable { reason: String },

    #[error("dependency rejected request: {reason}")]
    Fatal { reason: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Fault {
    pub fn http_status(&self) -> u16 {
        match self {
            Fault::Validation { .. } => 400,
            Fault::Auth => 401,
            Fault::Overload { .. } => 429,
            Fault::Retryable { .. } => 503,
            Fault::Fatal { .. } => 500,
            Fault::Cancelled => 499,
            Fault::Internal { .. } => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Fault::Validation { .. } => "validation",
            Fault::Auth => "auth",
            Fault::Overload { .. } => "overload",
            Fault::Retryable { .. } => "dependency_retryable",
            Fault::Fatal { .. } => "dependency_fatal",
            Fault::Cancelled => "cancelled",
            Fault::Internal { .. } => "internal",
        }
    }

    /// Machine-readable body. Auth faults leak no detail.
    pub fn body(&self) -> ErrorBody {
        let details = match self {
            Fault::Validation { errors } => {
                serde_json::to_value(errors).ok()
            }
            Fault::Overload { retry_after_secs } => {
                Some(serde_json::json!({ "retry_after": retry_after_secs }))
            }
            _ => None,
        };
        let message = match self {
            Fault::Auth => "unauthorized".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code(),
            message,
            details,
        }
    }
}

/// Wire shape of every error response: `{code, message, details?}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Fault::Validation { errors: vec![] }.http_status(),
            400
        );
        assert_eq!(Fault::Auth.http_status(), 401);
        assert_eq!(Fault::Overload { retry_after_secs: 60 }.http_status(), 429);
        assert_eq!(
            Fault::Retryable { reason: "bus down".into() }.http_status(),
            503
        );
        assert_eq!(
            Fault::Internal { reason: "bug".into() }.http_status(),
            500
        );
    }

    #[test]
    fn test_auth_body_leaks_nothing() {
        let body = Fault::Auth.body();
        assert_eq!(body.message, "unauthorized");
        assert!(body.details.is_none());
    }

    #[test]
    fn test_validation_body_lists_errors() {
        let fault = Fault::Validation {
            errors: vec![SampleError {
                index: 0,
                field: "value",
                code: "non_finite",
            }],
        };
        let body = fault.body();
        let details = body.details.unwrap();
        assert_eq!(details[0]["field"], "value");
        assert_eq!(details[0]["code"], "non_finite");
    }
}
