//! Field record domain model and sync lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record variants captured in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    RainfallReading,
    Inspection,
    IncidentDeclaration,
}

impl RecordType {
    /// All variants, in local table order.
    pub const ALL: [RecordType; 3] = [
        RecordType::RainfallReading,
        RecordType::Inspection,
        RecordType::IncidentDeclaration,
    ];

    /// Conflict handling declared per record variant.
    ///
    /// Inspections are wide flat forms where agents touch disjoint
    /// sections; the other variants are atomic documents.
    pub fn merge_policy(&self) -> MergePolicy {
        match self {
            RecordType::Inspection => MergePolicy::FieldLevel,
            RecordType::RainfallReading | RecordType::IncidentDeclaration => {
                MergePolicy::WholeRecord
            }
        }
    }
}

/// How diverging local/remote edits of one record are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Any concurrent remote edit flags the whole record as a conflict.
    WholeRecord,
    /// Disjoint top-level field changes merge automatically; overlapping
    /// changes still flag a conflict.
    FieldLevel,
}

/// Sync lifecycle status of a field record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Draft,
    Queued,
    Syncing,
    Synced,
    Conflict,
    Failed,
}

impl SyncStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// `draft` never jumps straight to `synced`; nothing leaves `synced`.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Draft, Queued)
                | (Queued, Syncing)
                | (Syncing, Synced)
                | (Syncing, Conflict)
                | (Syncing, Failed)
                | (Syncing, Queued)
                | (Conflict, Queued)
                | (Conflict, Synced)
                | (Failed, Queued)
        )
    }
}

/// A unit of field-collected data tracked through the sync lifecycle.
///
/// `client_id` is generated locally at creation, is globally unique and
/// never changes; it is the idempotency key for every remote write and the
/// sole join key between the local and remote stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRecord {
    pub client_id: String,
    pub record_type: RecordType,
    pub remote_id: Option<String>,
    /// Domain payload; opaque to the sync engine.
    pub payload: serde_json::Value,
    /// Last payload confirmed by the remote store. Merge base for
    /// field-level conflict detection.
    pub synced_payload: Option<serde_json::Value>,
    pub status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    /// Last remote timestamp observed for this record. Written only from a
    /// successful remote fetch or upsert acknowledgment, never guessed.
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    /// Remote snapshot captured when a conflict was flagged, so the
    /// operator can resolve it while offline.
    pub conflict_payload: Option<serde_json::Value>,
}

impl FieldRecord {
    /// Create a new draft with a fresh `client_id`.
    pub fn new_draft(record_type: RecordType, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            client_id: Uuid::new_v4().to_string(),
            record_type,
            remote_id: None,
            payload,
            synced_payload: None,
            status: SyncStatus::Draft,
            created_at: now,
            updated_at: now,
            synced_at: None,
            remote_updated_at: None,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            last_error_code: None,
            conflict_payload: None,
        }
    }
}

/// Remote view of a record, as returned by a conflict probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    pub remote_id: String,
    pub remote_updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Upsert request pushed to the remote record repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    pub client_id: String,
    pub record_type: RecordType,
    pub payload: serde_json::Value,
    /// Remote timestamp the engine last observed, used by stores that
    /// support optimistic concurrency tokens.
    pub expected_remote_updated_at: Option<DateTime<Utc>>,
}

/// Acknowledgment returned by a successful upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertAck {
    pub remote_id: String,
    pub remote_updated_at: DateTime<Utc>,
}
