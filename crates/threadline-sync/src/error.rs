use serde::Serialize;
use thiserror::Error;
use threadline_transport::{classify_status, ResponseBody, RetryDisposition, TransportError};

/// Failure taxonomy shared by the batch queue and thread sync.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },
    #[error("transient network failure: {message}")]
    TransientNetwork { message: String },
    #[error("retryable server error (status {status})")]
    RetryableServer { status: u16, body: ResponseBody },
    #[error("server rejected request (status {status})")]
    NonRetryableServer { status: u16, body: ResponseBody },
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("extraction failed: {message}")]
    Extraction { message: String },
}

impl SyncError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Classify a non-2xx response.
    pub fn from_status(status: u16, body: ResponseBody) -> Self {
        match classify_status(status) {
            RetryDisposition::Retryable => Self::RetryableServer { status, body },
            RetryDisposition::NonRetryable => Self::NonRetryableServer { status, body },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RetryableServer { status, .. } | Self::NonRetryableServer { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Whether the failure came from the remote side and counts against the breaker.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. }
                | Self::RetryableServer { .. }
                | Self::NonRetryableServer { .. }
        )
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Build(reason) => Self::Validation { reason },
            other => Self::TransientNetwork {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
