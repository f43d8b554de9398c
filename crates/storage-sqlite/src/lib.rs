//! SQLite implementation of the local capture store.
//!
//! Field records are written here first, synchronously and without any
//! network dependency; the sync engine drains them later. Data survives
//! process restarts and is only purged after confirmed sync plus a
//! retention window.

pub mod capture;
pub mod db;
pub mod errors;

pub use capture::{CaptureStoreRepository, RecordFilter};
pub use db::{create_pool, get_connection, DbPool};
pub use errors::StorageError;
