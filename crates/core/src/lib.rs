//! Domain model and sync contracts for the SIGERD field-operations app.
//!
//! Everything network- and storage-shaped lives behind the traits defined
//! here; this crate holds the pure pieces: the record model, the error
//! taxonomy, the conflict resolver and the retry policy.

pub mod errors;
pub mod records;
pub mod sync;

pub use errors::{Error, Result};
