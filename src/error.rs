//! Error types for profile aggregation
//!
//! Errors are classified by recoverability:
//! - Retryable: upstream timeouts and unavailable sources
//! - NonRetryable: malformed identities, unresolvable contacts
//! - Internal: cache bookkeeping signals that never reach a caller

use thiserror::Error;

/// Error types for profile lookups
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    // Rejected before any upstream call
    #[error("Invalid customer identity: {0}")]
    InvalidIdentity(String),

    // Retryable errors
    #[error("{label} timed out after {budget_ms} ms")]
    Timeout { label: String, budget_ms: u64 },

    #[error("{label} unavailable: {message}")]
    SourceUnavailable { label: String, message: String },

    // Non-retryable errors
    #[error("No contact could be resolved for {0}")]
    NotFound(String),

    // Internal
    #[error("Cache miss for {0}")]
    CacheMiss(String),
}

impl ProfileError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProfileError::Timeout { .. } | ProfileError::SourceUnavailable { .. }
        )
    }

    /// Returns true if this error is an internal signal rather than a user-facing failure
    pub fn is_internal(&self) -> bool {
        matches!(self, ProfileError::CacheMiss(_))
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            ProfileError::InvalidIdentity(_) => {
                "Look the customer up by email address, not by record ID."
            }
            ProfileError::Timeout { .. } => "An upstream service is slow. Try again shortly.",
            ProfileError::SourceUnavailable { .. } => {
                "An upstream service is unavailable. Check the integration and try again."
            }
            ProfileError::NotFound(_) => "Create the contact manually and retry.",
            ProfileError::CacheMiss(_) => "The profile will be loaded from upstream sources.",
        }
    }
}

/// Serializable error representation for UI layers
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileErrorPayload {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    Internal,
}

impl From<&ProfileError> for ProfileErrorPayload {
    fn from(err: &ProfileError) -> Self {
        let error_type = if err.is_internal() {
            ErrorType::Internal
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ProfileErrorPayload {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
