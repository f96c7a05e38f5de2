//! Provider error types

use std::time::Duration;
use thiserror::Error;

use crate::domain::FailureKind;

/// Errors surfaced by completion providers
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Context length exceeded: requested {requested} tokens, max {max}")]
    ContextExceeded { max: u64, requested: u64 },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    /// Check if a retry could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Unavailable(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::Network(_) => true,
            ProviderError::Timeout(_) => true,
            ProviderError::ModelNotFound(_) => false,
            ProviderError::ContextExceeded { .. } => false,
            ProviderError::InvalidResponse(_) => false,
            ProviderError::Json(_) => false,
        }
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Map to the terminal failure kind recorded on the task
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProviderError::Unavailable(_) => FailureKind::ProviderUnavailable,
            ProviderError::ModelNotFound(_) => FailureKind::ModelNotFound,
            ProviderError::RateLimited { .. } => FailureKind::RateLimited,
            ProviderError::ContextExceeded { .. } => FailureKind::ContextExceeded,
            ProviderError::Timeout(_) => FailureKind::ProviderUnavailable,
            ProviderError::Api { .. } | ProviderError::Network(_) => FailureKind::ProviderUnavailable,
            ProviderError::InvalidResponse(_) | ProviderError::Json(_) => FailureKind::RunnerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_rate_limit() {
        let err = ProviderError::RateLimited {
            retry_after: Duration::from_secs(60),
        };
        assert!(err.is_rate_limit());

        let err = ProviderError::Unavailable("down".to_string());
        assert!(!err.is_rate_limit());
    }

    #[test]
    fn test_is_retryable() {
        assert!(
            ProviderError::RateLimited {
                retry_after: Duration::from_secs(60)
            }
            .is_retryable()
        );
        assert!(ProviderError::Unavailable("503".to_string()).is_retryable());
        assert!(
            ProviderError::Api {
                status: 502,
                message: "Bad gateway".to_string()
            }
            .is_retryable()
        );
        assert!(ProviderError::Timeout(Duration::from_secs(30)).is_retryable());

        assert!(!ProviderError::ModelNotFound("nope".to_string()).is_retryable());
        assert!(!ProviderError::ContextExceeded { max: 200_000, requested: 250_000 }.is_retryable());
        assert!(
            !ProviderError::Api {
                status: 400,
                message: "Bad request".to_string()
            }
            .is_retryable()
        );
        assert!(!ProviderError::InvalidResponse("Bad JSON".to_string()).is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = ProviderError::RateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
        assert_eq!(ProviderError::Unavailable("x".to_string()).retry_after(), None);
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            ProviderError::ModelNotFound("m".to_string()).failure_kind(),
            FailureKind::ModelNotFound
        );
        assert_eq!(
            ProviderError::ContextExceeded { max: 1, requested: 2 }.failure_kind(),
            FailureKind::ContextExceeded
        );
        assert_eq!(
            ProviderError::Unavailable("x".to_string()).failure_kind(),
            FailureKind::ProviderUnavailable
        );
    }
}
