//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else propagates `anyhow::Error`.

use std::time::Duration;
use thiserror::Error;

/// Rejected configuration. Raised before a session starts, never mid-run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be at least {min} (got {value})")]
    BelowMinimum {
        field: &'static str,
        min: u64,
        value: u64,
    },

    #[error("{field} must be within [0, 1] (got {value})")]
    OutOfUnitRange { field: &'static str, value: f64 },

    #[error("{field} must be a non-negative number (got {value})")]
    Negative { field: &'static str, value: f64 },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("failed to read config {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Failure of one of the two external collaborators (generator, compiler).
///
/// Every variant means "no usable output this attempt"; the runner retries a
/// bounded number of times and then abandons the iteration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("empty or malformed response")]
    EmptyResponse,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    /// Whether another attempt has a realistic chance of succeeding.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CollaboratorError::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_messages_name_the_field() {
        let err = ConfigError::BelowMinimum {
            field: "max_edits_per_iteration",
            min: 1,
            value: 0,
        };
        assert_eq!(
            err.to_string(),
            "max_edits_per_iteration must be at least 1 (got 0)"
        );
    }

    #[test]
    fn only_hard_failures_are_not_transient() {
        assert!(CollaboratorError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(CollaboratorError::EmptyResponse.is_transient());
        assert!(CollaboratorError::RateLimited("429".into()).is_transient());
        assert!(!CollaboratorError::Failed("bad request".into()).is_transient());
    }
}
