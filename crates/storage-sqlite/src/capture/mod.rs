//! Local capture store: durable, synchronous, offline-first.

pub mod model;
pub mod repository;

pub use model::FieldRecordDB;
pub use repository::{CaptureStoreRepository, RecordFilter};
