//! Error types for agentmesh
//!
//! One error enum covering every failure mode of the coordination layer.
//! Uses thiserror for ergonomic error handling.

use crate::retry::{RetryDecision, RetryableError};
use meshstore::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for agentmesh operations
pub type Result<T> = std::result::Result<T, MeshError>;

/// Error type for agentmesh operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Coordination store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Storage/database errors outside SQLite itself
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network/HTTP errors
    #[error("Network error: {0}")]
    Network(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Decision not found
    #[error("Decision not found: {0}")]
    DecisionNotFound(String),

    /// Escalation not found
    #[error("Escalation not found: {0}")]
    EscalationNotFound(String),

    /// Operation not allowed in the record's current state
    #[error("Invalid transition for {id}: {message}")]
    InvalidTransition { id: String, message: String },

    /// The voter already voted in the current round
    #[error("{voter} already voted on {id} this round")]
    AlreadyVoted { id: String, voter: String },

    /// Another process holds the decision lock
    #[error("Decision {0} is locked by another process")]
    DecisionBusy(String),

    /// Both delivery paths of a guaranteed publish failed
    #[error("Delivery failed on both paths: {0}")]
    Delivery(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),

    /// Rate limited (with retry-after duration in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),
}

impl MeshError {
    pub fn invalid_transition(id: impl Into<String>, message: impl Into<String>) -> Self {
        MeshError::InvalidTransition {
            id: id.into(),
            message: message.into(),
        }
    }
}

impl RetryableError for StoreError {
    fn retry_decision(&self) -> RetryDecision {
        if self.is_transient() {
            RetryDecision::Retry
        } else {
            RetryDecision::NoRetry
        }
    }
}

impl RetryableError for MeshError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            MeshError::Store(e) => e.retry_decision(),
            MeshError::Network(_) => RetryDecision::Retry,
            MeshError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if let Some(status) = e.status() {
                    match status.as_u16() {
                        429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        500..=599 => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                } else {
                    RetryDecision::Retry
                }
            }
            MeshError::RateLimited(secs) => RetryDecision::RetryAfter(Duration::from_secs(*secs)),
            // Lock contention clears up on its own
            MeshError::DecisionBusy(_) => RetryDecision::Retry,
            MeshError::Config(_)
            | MeshError::Storage(_)
            | MeshError::Io(_)
            | MeshError::DecisionNotFound(_)
            | MeshError::EscalationNotFound(_)
            | MeshError::InvalidTransition { .. }
            | MeshError::AlreadyVoted { .. }
            | MeshError::Delivery(_)
            | MeshError::Json(_)
            | MeshError::Yaml(_)
            | MeshError::Database(_)
            | MeshError::Other(_)
            | MeshError::Anyhow(_) => RetryDecision::NoRetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_classified() {
        let transient = MeshError::from(StoreError::Transport("connection refused".into()));
        assert_eq!(transient.retry_decision(), RetryDecision::Retry);

        let semantic = MeshError::from(StoreError::WrongType("queue:tasks:a".into()));
        assert_eq!(semantic.retry_decision(), RetryDecision::NoRetry);
    }

    #[test]
    fn test_rate_limited_retry_after() {
        assert_eq!(
            MeshError::RateLimited(7).retry_decision(),
            RetryDecision::RetryAfter(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_domain_errors_not_retried() {
        let err = MeshError::AlreadyVoted {
            id: "d1".into(),
            voter: "ceo".into(),
        };
        assert_eq!(err.retry_decision(), RetryDecision::NoRetry);
        assert_eq!(err.to_string(), "ceo already voted on d1 this round");
    }
}
