//! HTTP client for the remote record repository.

pub mod client;

pub use client::{AccessTokenProvider, RemoteRecordClient, StaticTokenProvider};
