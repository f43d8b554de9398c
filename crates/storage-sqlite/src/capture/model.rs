//! Database row model shared by the per-variant capture tables.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::sql_types::{Integer, Nullable, Text};

use sigerd_core::errors::{DatabaseError, Error, Result};
use sigerd_core::records::{FieldRecord, RecordType, SyncStatus};

/// Row shape of every capture table. The record variant is implied by the
/// table the row was read from, so it is not a column.
#[derive(diesel::QueryableByName, Debug, Clone)]
pub struct FieldRecordDB {
    #[diesel(sql_type = Text)]
    pub client_id: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub remote_id: Option<String>,
    #[diesel(sql_type = Text)]
    pub payload: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub synced_payload: Option<String>,
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = Text)]
    pub created_at: String,
    #[diesel(sql_type = Text)]
    pub updated_at: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub synced_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub remote_updated_at: Option<String>,
    #[diesel(sql_type = Integer)]
    pub retry_count: i32,
    #[diesel(sql_type = Nullable<Text>)]
    pub next_retry_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub last_error: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub last_error_code: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub conflict_payload: Option<String>,
}

/// RFC 3339 with fixed millisecond precision so lexical ordering on the
/// created_at index matches chronological ordering.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            Error::Database(DatabaseError::Internal(format!(
                "Unparseable timestamp '{}': {}",
                value, e
            )))
        })
}

pub(crate) fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

impl FieldRecordDB {
    pub fn from_domain(record: &FieldRecord) -> Result<Self> {
        Ok(Self {
            client_id: record.client_id.clone(),
            remote_id: record.remote_id.clone(),
            payload: serde_json::to_string(&record.payload)?,
            synced_payload: record
                .synced_payload
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            status: enum_to_db(&record.status)?,
            created_at: format_timestamp(record.created_at),
            updated_at: format_timestamp(record.updated_at),
            synced_at: record.synced_at.map(format_timestamp),
            remote_updated_at: record.remote_updated_at.map(format_timestamp),
            retry_count: record.retry_count,
            next_retry_at: record.next_retry_at.map(format_timestamp),
            last_error: record.last_error.clone(),
            last_error_code: record.last_error_code.clone(),
            conflict_payload: record
                .conflict_payload
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        })
    }

    pub fn into_domain(self, record_type: RecordType) -> Result<FieldRecord> {
        let status: SyncStatus = enum_from_db(&self.status)?;
        Ok(FieldRecord {
            client_id: self.client_id,
            record_type,
            remote_id: self.remote_id,
            payload: serde_json::from_str(&self.payload)?,
            synced_payload: self
                .synced_payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            status,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            synced_at: self.synced_at.as_deref().map(parse_timestamp).transpose()?,
            remote_updated_at: self
                .remote_updated_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            retry_count: self.retry_count,
            next_retry_at: self
                .next_retry_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            last_error: self.last_error,
            last_error_code: self.last_error_code,
            conflict_payload: self
                .conflict_payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}
