//! Error types for the resolution pipeline.

use thiserror::Error;

/// Result type alias using [`ResolveError`].
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Errors that can occur while resolving requirements.
///
/// Provider-side failures (`Provider`, `QuotaExceeded`, `NotFound`) are
/// non-fatal to a requirement: the tier that hit them is treated as
/// unavailable and the policy advances to the next tier. `Storage` errors
/// escalate to the task level only when they persist.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// External provider call failed (network, auth, malformed response).
    #[error("provider error: {message}")]
    Provider { message: String },

    /// External provider rejected the call due to quota or rate limits.
    ///
    /// Kept distinct from [`ResolveError::Provider`] so a caller-supplied
    /// backoff policy can tell the two apart.
    #[error("provider quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// Query vector dimensionality does not match the stored vectors.
    #[error("dimension mismatch: expected {expected} dims, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A provider config (or other named entity) could not be found.
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// Underlying storage is unavailable or rejected the operation.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Serialization of metadata or cached result lists failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration or persisted value.
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl ResolveError {
    /// Create a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    /// Create a quota-exceeded error.
    pub fn quota(message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True if this error means "tier unavailable" rather than a fault in
    /// our own storage: the resolution policy records it and advances.
    pub fn is_tier_fault(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. }
                | Self::QuotaExceeded { .. }
                | Self::NotFound { .. }
                | Self::DimensionMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = ResolveError::not_found("provider", "embedding/default");
        assert!(err.to_string().contains("embedding/default"));

        let err = ResolveError::DimensionMismatch {
            expected: 1536,
            actual: 768,
        };
        assert!(err.to_string().contains("1536"));
        assert!(err.to_string().contains("768"));
    }

    #[test]
    fn test_tier_fault_classification() {
        assert!(ResolveError::provider("boom").is_tier_fault());
        assert!(ResolveError::quota("slow down").is_tier_fault());
        assert!(!ResolveError::config("bad toml").is_tier_fault());
    }
}
