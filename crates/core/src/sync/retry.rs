//! Retry policy: one declared table keyed by the error taxonomy, instead of
//! scattered per-call retry loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::contract::RemoteError;

/// Backoff starts at 2s and doubles up to a 5 minute cap.
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Failure taxonomy driving the scheduler's retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    /// Network unreachable or remote timeout; retried with backoff.
    Transient,
    /// Capability absent or denied; never retried automatically.
    Permission,
    /// Remote-side validation rejection; never retried, payload preserved.
    Validation,
    /// Local and remote diverged; resolved via the conflict resolver,
    /// never by blind retry.
    Divergence,
}

/// Classify a remote failure into the retry taxonomy.
pub fn classify_remote_error(error: &RemoteError) -> RetryClass {
    match error {
        RemoteError::Unreachable(_) => RetryClass::Transient,
        RemoteError::Unauthorized { .. } => RetryClass::Permission,
        RemoteError::Rejected { .. } => RetryClass::Validation,
        RemoteError::Conflict(_) => RetryClass::Divergence,
    }
}

/// Exponential backoff delay for the given retry count, capped.
pub fn backoff_delay(retry_count: i32) -> Duration {
    const MAX_EXPONENT: i32 = 16;

    let exponent = retry_count.clamp(0, MAX_EXPONENT) as u32;
    let delay = BACKOFF_BASE.saturating_mul(1_u32 << exponent.min(31));
    delay.min(BACKOFF_CAP)
}
