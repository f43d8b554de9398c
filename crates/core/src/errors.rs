//! Error types shared across the sync engine crates.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Database-level failure detail, wrapped by [`Error::Database`].
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Query failed at the storage layer.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Connection pool exhausted or unavailable.
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Internal invariant broken inside the storage layer.
    #[error("Internal database error: {0}")]
    Internal(String),
}

/// Top-level error for the sync engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Local storage failure.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found in the local capture store.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the record's current status.
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    /// Input rejected before reaching storage or the network.
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn not_found(client_id: impl Into<String>) -> Self {
        Self::NotFound(client_id.into())
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
