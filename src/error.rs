//! Error types for cache operations
//!
//! Tier failures are carried as values so the manager can absorb them and
//! report `miss`/`false` to its callers. Only `MalformedInput` is meant to
//! reach the caller of `get`/`set` directly.

use crate::tier::TierKind;
use thiserror::Error;

/// Main error type for the documentation cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// A fast or durable tier could not be reached or rejected the operation
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: TierKind, reason: String },

    /// A tier or provider call exceeded its time budget
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The documentation provider failed to produce content
    #[error("Provider failure: {0}")]
    ProviderFailure(String),

    /// Caller passed empty or invalid fingerprint components
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Shorthand for a tier failure
    pub fn unavailable(tier: TierKind, reason: impl Into<String>) -> Self {
        CacheError::TierUnavailable {
            tier,
            reason: reason.into(),
        }
    }

    /// True when the error means "could not ask", as opposed to "asked and it is absent"
    pub fn is_tier_failure(&self) -> bool {
        matches!(
            self,
            CacheError::TierUnavailable { .. } | CacheError::Timeout { .. }
        )
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::unavailable(TierKind::Durable, e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::unavailable(TierKind::Fast, "connection refused");
        assert_eq!(error.to_string(), "fast tier unavailable: connection refused");

        let timeout_error = CacheError::Timeout {
            operation: "durable get".to_string(),
            timeout_ms: 500,
        };
        assert!(timeout_error.to_string().contains("timed out after 500ms"));

        let input_error = CacheError::MalformedInput("empty library id".to_string());
        assert!(input_error.to_string().contains("empty library id"));
    }

    #[test]
    fn test_tier_failure_classification() {
        assert!(CacheError::unavailable(TierKind::Durable, "down").is_tier_failure());
        assert!(CacheError::Timeout {
            operation: "fast get".to_string(),
            timeout_ms: 50
        }
        .is_tier_failure());
        assert!(!CacheError::ProviderFailure("404".to_string()).is_tier_failure());
        assert!(!CacheError::MalformedInput("".to_string()).is_tier_failure());
    }

    #[test]
    fn test_error_conversion() {
        let error: CacheError = "test error".into();
        assert!(matches!(error, CacheError::Other(_)));

        let error: CacheError = "test error".to_string().into();
        assert!(matches!(error, CacheError::Other(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: CacheError = json_err.into();
        assert!(matches!(error, CacheError::SerializationError(_)));
    }
}
