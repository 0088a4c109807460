//! Store error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a coordination store
///
/// Serializable so the HTTP store surface can hand the exact variant back to
/// remote clients.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StoreError {
    /// Operation against a key holding the wrong kind of value
    #[error("WRONGTYPE operation against key holding the wrong kind of value: {0}")]
    WrongType(String),

    /// Value stored at the key is not an integer
    #[error("value at {0} is not an integer")]
    NotInteger(String),

    /// Consumer group (or its stream) does not exist
    #[error("NOGROUP no such key '{stream}' or consumer group '{group}'")]
    NoGroup { stream: String, group: String },

    /// Consumer group already exists
    #[error("BUSYGROUP consumer group '{group}' already exists on '{stream}'")]
    BusyGroup { stream: String, group: String },

    /// Malformed stream id
    #[error("invalid stream id: {0}")]
    InvalidStreamId(String),

    /// Invalid command argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Reply did not have the expected shape
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The store could not be reached
    #[error("transport error: {0}")]
    Transport(String),

    /// The store did not answer in time
    #[error("store timed out: {0}")]
    Timeout(String),

    /// The store answered with an internal failure
    #[error("store server error: {0}")]
    Server(String),

    /// The store (or subscription) has been shut down
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// Whether the failure is a connectivity problem rather than a
    /// semantic rejection by the store
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Transport(_) | StoreError::Timeout(_) | StoreError::Server(_)
        )
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
