//! Sync contracts and pure sync logic.

pub mod conflict;
pub mod contract;
pub mod retry;

pub use conflict::{resolve, Resolution};
pub use contract::{RemoteError, RemoteRecordRepository, WriteCapabilities};
pub use retry::{backoff_delay, classify_remote_error, RetryClass};

/// Trigger source for scheduler drain passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Startup,
    ReachabilityRestored,
    RecordQueued,
    Manual,
    Periodic,
}
