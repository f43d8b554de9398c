//! Contract the engine requires of the remote record repository.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::records::{RecordType, RemoteSnapshot, UpsertAck, UpsertRequest};

/// Errors the remote record repository may surface.
///
/// This is the full taxonomy the engine dispatches on; the HTTP client maps
/// transport and status-code failures into it.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No response, timeout, or transport-level failure.
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    /// Caller lacks permission for this operation on this record type.
    #[error("Unauthorized ({code}): {message}")]
    Unauthorized { code: String, message: String },

    /// Remote-side validation failure; never retryable.
    #[error("Rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    /// Remote state changed under an optimistic concurrency token.
    #[error("Remote conflict: {0}")]
    Conflict(String),
}

impl RemoteError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Short machine code recorded in `last_error_code`.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Rejected { .. } => "rejected",
            Self::Conflict(_) => "conflict",
        }
    }
}

/// Record types the current credential may write, discovered once at
/// client initialization and cached for the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteCapabilities {
    writable: HashSet<RecordType>,
}

impl WriteCapabilities {
    pub fn new(writable: impl IntoIterator<Item = RecordType>) -> Self {
        Self {
            writable: writable.into_iter().collect(),
        }
    }

    /// Capability set granting every record type.
    pub fn all() -> Self {
        Self::new(RecordType::ALL)
    }

    pub fn can_write(&self, record_type: RecordType) -> bool {
        self.writable.contains(&record_type)
    }
}

/// Abstraction over the authoritative backing store.
///
/// `upsert` must be idempotent keyed on `client_id`: repeating the same
/// `client_id` with an unchanged payload must not create a second remote
/// row and must return the same `remote_id`.
#[async_trait]
pub trait RemoteRecordRepository: Send + Sync {
    async fn upsert(&self, request: UpsertRequest) -> Result<UpsertAck, RemoteError>;

    /// Fetch remote state for conflict probing, keyed by `client_id`.
    /// Unknown ids are simply absent from the result.
    async fn fetch_by_client_ids(
        &self,
        record_type: RecordType,
        client_ids: &[String],
    ) -> Result<HashMap<String, RemoteSnapshot>, RemoteError>;

    /// Terminal cleanup; test/rollback use only.
    async fn delete(&self, record_type: RecordType, client_id: &str) -> Result<(), RemoteError>;

    /// Lightweight liveness probe used by the reachability monitor.
    async fn probe(&self) -> Result<(), RemoteError>;

    /// Cached write-capability set for the current credential.
    async fn capabilities(&self) -> Result<WriteCapabilities, RemoteError>;
}
