//! Sync engine: drains the local capture store into the remote record
//! repository, driven by reachability transitions and explicit triggers.
//!
//! The engine never loses a field-collected record: capture writes go to
//! durable local storage first, every remote write is idempotent on the
//! locally generated `client_id`, and diverging edits are flagged as
//! conflicts instead of being overwritten.

pub mod capture;
pub mod config;
pub mod engine;
pub mod policy;
pub mod reachability;
pub mod scheduler;
pub mod status;

pub use capture::CaptureService;
pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use policy::{AccessPolicyGateway, CredentialRefresher, PolicyDenial};
pub use reachability::ReachabilityMonitor;
pub use scheduler::{DrainSummary, SyncScheduler};
pub use status::{StatusBroadcaster, StatusUpdate};
